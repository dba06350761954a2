use crate::auth::{self, AuthError, Role};
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    new_id, optional_bool, optional_str, required_str, run_authed, run_open, Ctx, ANYONE,
    REGISTRAR, REVIEWERS,
};
use crate::ipc::types::{AppState, Request};
use chrono::{Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

fn expires_in(duration: Duration) -> String {
    (Utc::now() + duration).to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

pub fn user_json(conn: &Connection, user_id: &str) -> Result<Value, HandlerErr> {
    conn.query_row(
        "SELECT id, username, full_name, email, role, is_coordinator, active
         FROM users WHERE id = ?",
        [user_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "username": r.get::<_, String>(1)?,
                "fullName": r.get::<_, String>(2)?,
                "email": r.get::<_, Option<String>>(3)?,
                "role": r.get::<_, String>(4)?,
                "isCoordinator": r.get::<_, i64>(5)? != 0,
                "active": r.get::<_, i64>(6)? != 0,
            }))
        },
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("user"))
}

struct NewUser {
    username: String,
    password: String,
    full_name: String,
    email: Option<String>,
}

fn parse_new_user(conn: &Connection, params: &Value) -> Result<NewUser, HandlerErr> {
    let username = required_str(params, "username")?.to_ascii_lowercase();
    if username.len() > 64 || username.chars().any(char::is_whitespace) {
        return Err(HandlerErr::bad_params(
            "username must be at most 64 characters with no spaces",
        ));
    }
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    auth::check_password_strength(&password, setup::min_password_length(conn)?)?;
    Ok(NewUser {
        username,
        password,
        full_name: required_str(params, "fullName")?,
        email: optional_str(params, "email")?,
    })
}

fn insert_user(
    conn: &Connection,
    user: &NewUser,
    role: Role,
    is_coordinator: bool,
) -> Result<String, HandlerErr> {
    let id = new_id();
    conn.execute(
        "INSERT INTO users(id, username, email, full_name, role, is_coordinator, active, password_hash, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?, ?)",
        (
            &id,
            &user.username,
            &user.email,
            &user.full_name,
            role.as_str(),
            is_coordinator as i64,
            auth::hash_password(&user.password),
            db::now_utc(),
        ),
    )
    .map_err(HandlerErr::db("db_insert_failed"))?;
    tracing::info!(user_id = %id, username = %user.username, role = role.as_str(), "user created");
    Ok(id)
}

fn handle_bootstrap(conn: &Connection, req: &Request) -> Result<Value, HandlerErr> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
    if count > 0 {
        return Err(HandlerErr::new(
            "already_bootstrapped",
            "users already exist; log in as a registrar",
        ));
    }
    let user = parse_new_user(conn, &req.params)?;
    let id = insert_user(conn, &user, Role::Registrar, false)?;
    Ok(json!({ "user": user_json(conn, &id)? }))
}

fn handle_register(conn: &Connection, req: &Request) -> Result<Value, HandlerErr> {
    let user = parse_new_user(conn, &req.params)?;
    let id = insert_user(conn, &user, Role::Student, false)?;
    Ok(json!({ "user": user_json(conn, &id)? }))
}

fn handle_login(conn: &Connection, req: &Request) -> Result<Value, HandlerErr> {
    let username = required_str(&req.params, "username")?.to_ascii_lowercase();
    let password = req
        .params
        .get("password")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    let row: Option<(String, String, i64)> = conn
        .query_row(
            "SELECT id, password_hash, active FROM users WHERE username = ?",
            [&username],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((user_id, hash, active)) = row else {
        tracing::warn!(username = %username, "login for unknown user");
        return Err(AuthError::InvalidCredentials.into());
    };
    if !auth::verify_password(password, &hash) {
        tracing::warn!(username = %username, "login with wrong password");
        return Err(AuthError::InvalidCredentials.into());
    }
    if active == 0 {
        return Err(AuthError::Inactive.into());
    }

    let token = auth::new_session_token();
    let expires_at = expires_in(Duration::hours(setup::session_ttl_hours(conn)?));
    conn.execute(
        "INSERT INTO sessions(id, user_id, token_digest, created_at, expires_at)
         VALUES(?, ?, ?, ?, ?)",
        (
            new_id(),
            &user_id,
            auth::secret_digest(&token),
            db::now_utc(),
            &expires_at,
        ),
    )
    .map_err(HandlerErr::db("db_insert_failed"))?;
    // Expired sessions are swept on every login.
    conn.execute(
        "DELETE FROM sessions WHERE expires_at <= ?",
        [db::now_utc()],
    )?;
    tracing::info!(user_id = %user_id, "login");

    Ok(json!({
        "token": token,
        "expiresAt": expires_at,
        "user": user_json(conn, &user_id)?
    }))
}

fn handle_logout(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let token = req.token.as_deref().unwrap_or("").trim();
    ctx.conn.execute(
        "DELETE FROM sessions WHERE token_digest = ?",
        [auth::secret_digest(token)],
    )?;
    Ok(json!({ "loggedOut": true }))
}

fn handle_me(ctx: &Ctx, _req: &Request) -> Result<Value, HandlerErr> {
    Ok(json!({ "user": user_json(ctx.conn, &ctx.actor.user_id)? }))
}

fn set_password(conn: &Connection, user_id: &str, password: &str) -> Result<(), HandlerErr> {
    auth::check_password_strength(password, setup::min_password_length(conn)?)?;
    conn.execute(
        "UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?",
        (auth::hash_password(password), db::now_utc(), user_id),
    )
    .map_err(HandlerErr::db("db_update_failed"))?;
    Ok(())
}

fn handle_change_password(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let current = req
        .params
        .get("currentPassword")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let new_password = req
        .params
        .get("newPassword")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let hash: String = ctx.conn.query_row(
        "SELECT password_hash FROM users WHERE id = ?",
        [&ctx.actor.user_id],
        |r| r.get(0),
    )?;
    if !auth::verify_password(current, &hash) {
        return Err(AuthError::InvalidCredentials.into());
    }
    set_password(ctx.conn, &ctx.actor.user_id, new_password)?;
    let keep = auth::secret_digest(req.token.as_deref().unwrap_or("").trim());
    ctx.conn.execute(
        "DELETE FROM sessions WHERE user_id = ? AND token_digest <> ?",
        (&ctx.actor.user_id, keep),
    )?;
    Ok(json!({ "changed": true }))
}

fn handle_request_password_reset(conn: &Connection, req: &Request) -> Result<Value, HandlerErr> {
    let login = required_str(&req.params, "username")?.to_ascii_lowercase();
    let user: Option<(String, Option<String>, String)> = conn
        .query_row(
            "SELECT id, email, full_name FROM users
             WHERE (username = ?1 OR lower(email) = ?1) AND active = 1",
            [&login],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;

    // The response never reveals whether the account exists.
    if let Some((user_id, Some(email), full_name)) = user {
        let otp = auth::new_otp();
        let ttl = setup::otp_ttl_minutes(conn)?;
        let tx = conn
            .unchecked_transaction()
            .map_err(HandlerErr::db("db_tx_failed"))?;
        tx.execute(
            "UPDATE password_resets SET used_at = ? WHERE user_id = ? AND used_at IS NULL",
            (db::now_utc(), &user_id),
        )?;
        tx.execute(
            "INSERT INTO password_resets(id, user_id, otp_digest, expires_at, created_at)
             VALUES(?, ?, ?, ?, ?)",
            (
                new_id(),
                &user_id,
                auth::secret_digest(&otp),
                expires_in(Duration::minutes(ttl)),
                db::now_utc(),
            ),
        )
        .map_err(HandlerErr::db("db_insert_failed"))?;
        tx.execute(
            "INSERT INTO mail_outbox(id, to_address, subject, body, created_at)
             VALUES(?, ?, ?, ?, ?)",
            (
                new_id(),
                &email,
                "Password reset code",
                render_otp_mail(&full_name, &otp, ttl),
                db::now_utc(),
            ),
        )
        .map_err(HandlerErr::db("db_insert_failed"))?;
        tx.commit().map_err(HandlerErr::db("db_tx_failed"))?;
        tracing::info!(user_id = %user_id, "password reset code queued");
    } else {
        tracing::debug!(login = %login, "password reset for unknown or mail-less account");
    }
    Ok(json!({ "queued": true }))
}

fn render_otp_mail(full_name: &str, otp: &str, ttl_minutes: i64) -> String {
    format!(
        "Hello {},\n\nYour password reset code is {}.\nIt expires in {} minutes.\n\nIf you did not ask for this, ignore this message.\n",
        full_name, otp, ttl_minutes
    )
}

fn handle_reset_password(conn: &Connection, req: &Request) -> Result<Value, HandlerErr> {
    let login = required_str(&req.params, "username")?.to_ascii_lowercase();
    let otp = required_str(&req.params, "otp")?;
    let new_password = req
        .params
        .get("newPassword")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    let user_id: Option<String> = conn
        .query_row(
            "SELECT id FROM users
             WHERE username = ?1 OR lower(email) = ?1
             ORDER BY username = ?1 DESC
             LIMIT 1",
            [&login],
            |r| r.get(0),
        )
        .optional()?;
    let Some(user_id) = user_id else {
        return Err(AuthError::InvalidOtp.into());
    };
    let now = db::now_utc();
    let reset_id: Option<String> = conn
        .query_row(
            "SELECT id FROM password_resets
             WHERE user_id = ?1
               AND otp_digest = ?2
               AND used_at IS NULL
               AND expires_at > ?3",
            (&user_id, auth::secret_digest(&otp), &now),
            |r| r.get(0),
        )
        .optional()?;
    let Some(reset_id) = reset_id else {
        // Every open code for the account burns once the misses add up.
        let counted = conn.execute(
            "UPDATE password_resets
             SET attempts = attempts + 1,
                 used_at = CASE WHEN attempts + 1 >= ?1 THEN ?2 ELSE used_at END
             WHERE user_id = ?3 AND used_at IS NULL AND expires_at > ?2",
            (auth::MAX_OTP_ATTEMPTS, &now, &user_id),
        )?;
        if counted > 0 {
            tracing::warn!(user_id = %user_id, "password reset code mismatch");
        }
        return Err(AuthError::InvalidOtp.into());
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    set_password(&tx, &user_id, new_password)?;
    tx.execute(
        "UPDATE password_resets SET used_at = ? WHERE id = ?",
        (db::now_utc(), &reset_id),
    )?;
    tx.execute("DELETE FROM sessions WHERE user_id = ?", [&user_id])?;
    tx.commit().map_err(HandlerErr::db("db_tx_failed"))?;
    tracing::info!(user_id = %user_id, "password reset");
    Ok(json!({ "reset": true }))
}

fn handle_users_list(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let role = match optional_str(&req.params, "role")? {
        Some(r) => Some(
            Role::parse(&r).ok_or_else(|| HandlerErr::bad_params(format!("unknown role {}", r)))?,
        ),
        None => None,
    };
    let mut stmt = ctx.conn.prepare(
        "SELECT id FROM users
         WHERE (?1 IS NULL OR role = ?1)
         ORDER BY role, full_name",
    )?;
    let ids = stmt
        .query_map([role.map(|r| r.as_str())], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let users = ids
        .iter()
        .map(|id| user_json(ctx.conn, id))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "users": users }))
}

fn handle_users_create(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let role_raw = required_str(&req.params, "role")?;
    let mut role = Role::parse(&role_raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown role {}", role_raw)))?;
    let mut is_coordinator = optional_bool(&req.params, "isCoordinator")?.unwrap_or(false);
    // Coordinators are faculty with the flag set.
    if role == Role::Coordinator {
        role = Role::Faculty;
        is_coordinator = true;
    }
    if is_coordinator && role != Role::Faculty {
        return Err(HandlerErr::bad_params("only faculty can be coordinators"));
    }
    let user = parse_new_user(ctx.conn, &req.params)?;
    let id = insert_user(ctx.conn, &user, role, is_coordinator)?;
    Ok(json!({ "user": user_json(ctx.conn, &id)? }))
}

fn target_user(ctx: &Ctx, req: &Request) -> Result<(String, Role), HandlerErr> {
    let user_id = required_str(&req.params, "userId")?;
    let role: String = ctx
        .conn
        .query_row("SELECT role FROM users WHERE id = ?", [&user_id], |r| r.get(0))
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("user"))?;
    let role = Role::parse(&role)
        .ok_or_else(|| HandlerErr::new("internal_error", format!("unknown role {}", role)))?;
    Ok((user_id, role))
}

fn handle_users_set_coordinator(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let (user_id, role) = target_user(ctx, req)?;
    let flag = optional_bool(&req.params, "isCoordinator")?
        .ok_or_else(|| HandlerErr::bad_params("missing isCoordinator"))?;
    if role != Role::Faculty {
        return Err(HandlerErr::bad_params("only faculty can be coordinators"));
    }
    ctx.conn
        .execute(
            "UPDATE users SET is_coordinator = ?, updated_at = ? WHERE id = ?",
            (flag as i64, db::now_utc(), &user_id),
        )
        .map_err(HandlerErr::db("db_update_failed"))?;
    tracing::info!(user_id = %user_id, is_coordinator = flag, by = %ctx.actor.username, "coordinator flag changed");
    Ok(json!({ "user": user_json(ctx.conn, &user_id)? }))
}

fn handle_users_set_active(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let (user_id, _) = target_user(ctx, req)?;
    let active = optional_bool(&req.params, "active")?
        .ok_or_else(|| HandlerErr::bad_params("missing active"))?;
    if !active && user_id == ctx.actor.user_id {
        return Err(HandlerErr::bad_params("cannot deactivate your own account"));
    }
    ctx.conn
        .execute(
            "UPDATE users SET active = ?, updated_at = ? WHERE id = ?",
            (active as i64, db::now_utc(), &user_id),
        )
        .map_err(HandlerErr::db("db_update_failed"))?;
    if !active {
        ctx.conn
            .execute("DELETE FROM sessions WHERE user_id = ?", [&user_id])?;
    }
    Ok(json!({ "user": user_json(ctx.conn, &user_id)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let resp = match req.method.as_str() {
        "auth.bootstrap" => run_open(state, req, handle_bootstrap),
        "auth.register" => run_open(state, req, handle_register),
        "auth.login" => run_open(state, req, handle_login),
        "auth.requestPasswordReset" => run_open(state, req, handle_request_password_reset),
        "auth.resetPassword" => run_open(state, req, handle_reset_password),
        "auth.logout" => run_authed(state, req, ANYONE, handle_logout),
        "auth.me" => run_authed(state, req, ANYONE, handle_me),
        "auth.changePassword" => run_authed(state, req, ANYONE, handle_change_password),
        "users.list" => run_authed(state, req, REVIEWERS, handle_users_list),
        "users.create" => run_authed(state, req, REGISTRAR, handle_users_create),
        "users.setCoordinator" => run_authed(state, req, REGISTRAR, handle_users_set_coordinator),
        "users.setActive" => run_authed(state, req, REGISTRAR, handle_users_set_active),
        _ => return None,
    };
    Some(resp)
}
