use crate::auth::{self, Actor, AuthError, Role};
use crate::db;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use uuid::Uuid;

/// Everything an authenticated handler gets to see.
pub struct Ctx<'a> {
    pub conn: &'a Connection,
    pub actor: Actor,
    pub workspace: Option<&'a std::path::Path>,
}

pub type AuthedHandler = fn(&Ctx, &Request) -> Result<Value, HandlerErr>;
pub type OpenHandler = fn(&Connection, &Request) -> Result<Value, HandlerErr>;

/// Any signed-in user.
pub const ANYONE: &[Role] = &[];
pub const STAFF: &[Role] = &[Role::Faculty, Role::Coordinator, Role::Registrar];
pub const REVIEWERS: &[Role] = &[Role::Coordinator, Role::Registrar];
pub const REGISTRAR: &[Role] = &[Role::Registrar];
pub const FACULTY: &[Role] = &[Role::Faculty];
pub const STUDENT: &[Role] = &[Role::Student];

pub fn db_conn<'a>(state: &'a AppState) -> Result<&'a Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

/// Resolves the session token to an active user.
pub fn resolve_actor(conn: &Connection, token: Option<&str>) -> Result<Actor, HandlerErr> {
    let token = token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::Unauthenticated)?;
    let row: Option<(String, String, String, i64, i64, String)> = conn
        .query_row(
            "SELECT u.id, u.username, u.role, u.is_coordinator, u.active, s.expires_at
             FROM sessions s
             JOIN users u ON u.id = s.user_id
             WHERE s.token_digest = ?",
            [auth::secret_digest(token)],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?)),
        )
        .optional()?;
    let Some((user_id, username, role, is_coordinator, active, expires_at)) = row else {
        return Err(AuthError::Unauthenticated.into());
    };
    if expires_at <= db::now_utc() {
        return Err(AuthError::SessionExpired.into());
    }
    if active == 0 {
        return Err(AuthError::Inactive.into());
    }
    let role = Role::parse(&role)
        .ok_or_else(|| HandlerErr::new("internal_error", format!("unknown role {}", role)))?;
    Ok(Actor {
        user_id,
        username,
        role,
        is_coordinator: is_coordinator != 0,
    })
}

/// Runs `f` for a signed-in caller whose role is in `roles` (empty = any).
pub fn run_authed(
    state: &mut AppState,
    req: &Request,
    roles: &[Role],
    f: AuthedHandler,
) -> Value {
    let result = authorize_and_call(state, req, roles, f);
    finish(req, result)
}

/// Resolves the caller and checks their role against `roles` (empty = any).
pub fn authorize(state: &AppState, req: &Request, roles: &[Role]) -> Result<Actor, HandlerErr> {
    let conn = db_conn(state)?;
    let actor = resolve_actor(conn, req.token.as_deref())?;
    if !roles.is_empty() && !actor.has_any(roles) {
        return Err(AuthError::Forbidden {
            method: req.method.clone(),
            role: actor.role.as_str(),
        }
        .into());
    }
    Ok(actor)
}

fn authorize_and_call(
    state: &AppState,
    req: &Request,
    roles: &[Role],
    f: AuthedHandler,
) -> Result<Value, HandlerErr> {
    let actor = authorize(state, req, roles)?;
    let ctx = Ctx {
        conn: db_conn(state)?,
        actor,
        workspace: state.workspace.as_deref(),
    };
    f(&ctx, req)
}

/// Runs `f` without a session, for login and account recovery.
pub fn run_open(state: &mut AppState, req: &Request, f: OpenHandler) -> Value {
    let result = db_conn(state).and_then(|conn| f(conn, req));
    finish(req, result)
}

pub fn finish(req: &Request, result: Result<Value, HandlerErr>) -> Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => {
            tracing::debug!(method = %req.method, code = e.code, message = %e.message, "request failed");
            e.response(&req.id)
        }
    }
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn optional_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

pub fn required_i64_range(params: &Value, key: &str, min: i64, max: i64) -> Result<i64, HandlerErr> {
    let n = params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing integer {}", key)))?;
    check_range(key, n, min, max)
}

pub fn optional_i64_range(
    params: &Value,
    key: &str,
    min: i64,
    max: i64,
) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            let n = v
                .as_i64()
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key)))?;
            check_range(key, n, min, max).map(Some)
        }
    }
}

fn check_range(key: &str, n: i64, min: i64, max: i64) -> Result<i64, HandlerErr> {
    if !(min..=max).contains(&n) {
        return Err(HandlerErr::bad_params(format!(
            "{} must be in {}..={}",
            key, min, max
        )));
    }
    Ok(n)
}

pub fn optional_f64(params: &Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key))),
    }
}

pub fn optional_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

pub fn notify(
    conn: &Connection,
    user_id: &str,
    kind: &str,
    message: &str,
    ref_id: Option<&str>,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO notifications(id, user_id, kind, message, ref_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (new_id(), user_id, kind, message, ref_id, db::now_utc()),
    )
    .map_err(HandlerErr::db("db_insert_failed"))?;
    Ok(())
}

/// Active school year id, if any.
pub fn active_school_year_id(conn: &Connection) -> Result<Option<String>, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT id FROM school_years WHERE is_active = 1",
            [],
            |r| r.get(0),
        )
        .optional()?)
}

/// `schoolYearId` from params, falling back to the active school year.
pub fn school_year_param(conn: &Connection, params: &Value) -> Result<String, HandlerErr> {
    if let Some(id) = optional_str(params, "schoolYearId")? {
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM school_years WHERE id = ?", [&id], |r| r.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(HandlerErr::not_found("school year"));
        }
        return Ok(id);
    }
    active_school_year_id(conn)?
        .ok_or_else(|| HandlerErr::new("no_active_school_year", "no school year is active"))
}

pub fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

pub fn write_text_file(path: &str, contents: &str) -> Result<(), HandlerErr> {
    let out = std::path::PathBuf::from(path);
    let fail = |e: std::io::Error| {
        HandlerErr::new("export_failed", e.to_string()).with_details(serde_json::json!({ "path": path }))
    };
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent).map_err(fail)?;
    }
    std::fs::write(&out, contents).map_err(fail)?;
    Ok(())
}
