use crate::auth::Role;
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::auth::user_json;
use crate::ipc::helpers::{optional_str, required_str, run_authed, Ctx, ANYONE};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

pub fn profile_json(conn: &Connection, user_id: &str) -> Result<Option<Value>, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT lrn, last_name, first_name, middle_name, birth_date, sex, address,
                    contact_no, guardian_name, guardian_contact, last_school, updated_at
             FROM student_personal_info WHERE user_id = ?",
            [user_id],
            |r| {
                Ok(json!({
                    "lrn": r.get::<_, Option<String>>(0)?,
                    "lastName": r.get::<_, String>(1)?,
                    "firstName": r.get::<_, String>(2)?,
                    "middleName": r.get::<_, Option<String>>(3)?,
                    "birthDate": r.get::<_, Option<String>>(4)?,
                    "sex": r.get::<_, Option<String>>(5)?,
                    "address": r.get::<_, Option<String>>(6)?,
                    "contactNo": r.get::<_, Option<String>>(7)?,
                    "guardianName": r.get::<_, Option<String>>(8)?,
                    "guardianContact": r.get::<_, Option<String>>(9)?,
                    "lastSchool": r.get::<_, Option<String>>(10)?,
                    "updatedAt": r.get::<_, Option<String>>(11)?,
                }))
            },
        )
        .optional()?)
}

/// "Last, First M." for documents and rosters.
pub fn display_name(profile: &Value) -> Option<String> {
    let last = profile.get("lastName")?.as_str()?;
    let first = profile.get("firstName")?.as_str()?;
    let middle = profile
        .get("middleName")
        .and_then(|v| v.as_str())
        .and_then(|m| m.chars().next())
        .map(|c| format!(" {}.", c))
        .unwrap_or_default();
    Some(format!("{}, {}{}", last, first, middle))
}

pub fn is_valid_lrn(lrn: &str) -> bool {
    lrn.len() == 12 && lrn.bytes().all(|b| b.is_ascii_digit())
}

/// Students may only address themselves; staff must name the student.
fn target_student(ctx: &Ctx, params: &Value, staff_roles: &[Role]) -> Result<String, HandlerErr> {
    let requested = optional_str(params, "studentId")?;
    if ctx.actor.role == Role::Student {
        return match requested {
            Some(id) if id != ctx.actor.user_id => {
                Err(HandlerErr::forbidden("students may only access their own profile"))
            }
            _ => Ok(ctx.actor.user_id.clone()),
        };
    }
    if !ctx.actor.has_any(staff_roles) {
        return Err(HandlerErr::forbidden(format!(
            "{} may not edit student profiles",
            ctx.actor.role.as_str()
        )));
    }
    requested.ok_or_else(|| HandlerErr::bad_params("missing studentId"))
}

fn ensure_student(conn: &Connection, id: &str) -> Result<Value, HandlerErr> {
    let user = user_json(conn, id)?;
    if user["role"] != "student" {
        return Err(HandlerErr::bad_params("user is not a student"));
    }
    Ok(user)
}

fn handle_profile_get(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let id = target_student(
        ctx,
        &req.params,
        &[Role::Faculty, Role::Coordinator, Role::Registrar],
    )?;
    let user = ensure_student(ctx.conn, &id)?;
    Ok(json!({ "student": user, "profile": profile_json(ctx.conn, &id)? }))
}

fn handle_profile_upsert(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let id = target_student(ctx, &req.params, &[Role::Registrar])?;
    ensure_student(ctx.conn, &id)?;
    let p = &req.params;

    let lrn = optional_str(p, "lrn")?;
    if let Some(lrn) = &lrn {
        if !is_valid_lrn(lrn) {
            return Err(HandlerErr::bad_params("lrn must be 12 digits"));
        }
    }
    let last_name = required_str(p, "lastName")?;
    let first_name = required_str(p, "firstName")?;
    let birth_date = match optional_str(p, "birthDate")? {
        Some(s) => Some(
            NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .map_err(|_| HandlerErr::bad_params("birthDate must be YYYY-MM-DD"))?
                .format("%Y-%m-%d")
                .to_string(),
        ),
        None => None,
    };
    let sex = match optional_str(p, "sex")?.map(|s| s.to_ascii_uppercase()) {
        Some(s) if s == "M" || s == "F" => Some(s),
        Some(_) => return Err(HandlerErr::bad_params("sex must be M or F")),
        None => None,
    };

    ctx.conn
        .execute(
            "INSERT INTO student_personal_info(
                user_id, lrn, last_name, first_name, middle_name, birth_date, sex, address,
                contact_no, guardian_name, guardian_contact, last_school, updated_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(user_id) DO UPDATE SET
                lrn = excluded.lrn,
                last_name = excluded.last_name,
                first_name = excluded.first_name,
                middle_name = excluded.middle_name,
                birth_date = excluded.birth_date,
                sex = excluded.sex,
                address = excluded.address,
                contact_no = excluded.contact_no,
                guardian_name = excluded.guardian_name,
                guardian_contact = excluded.guardian_contact,
                last_school = excluded.last_school,
                updated_at = excluded.updated_at",
            rusqlite::params![
                id,
                lrn,
                last_name,
                first_name,
                optional_str(p, "middleName")?,
                birth_date,
                sex,
                optional_str(p, "address")?,
                optional_str(p, "contactNo")?,
                optional_str(p, "guardianName")?,
                optional_str(p, "guardianContact")?,
                optional_str(p, "lastSchool")?,
                db::now_utc(),
            ],
        )
        .map_err(HandlerErr::db("db_update_failed"))?;
    Ok(json!({ "profile": profile_json(ctx.conn, &id)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let resp = match req.method.as_str() {
        "students.profile.get" => run_authed(state, req, ANYONE, handle_profile_get),
        "students.profile.upsert" => run_authed(state, req, ANYONE, handle_profile_upsert),
        _ => return None,
    };
    Some(resp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lrn_must_be_twelve_digits() {
        assert!(is_valid_lrn("123456789012"));
        assert!(!is_valid_lrn("12345678901"));
        assert!(!is_valid_lrn("12345678901a"));
        assert!(!is_valid_lrn("1234567890123"));
    }

    #[test]
    fn display_name_abbreviates_middle_name() {
        let p = json!({ "lastName": "Dela Cruz", "firstName": "Juan", "middleName": "Santos" });
        assert_eq!(display_name(&p).as_deref(), Some("Dela Cruz, Juan S."));
        let p = json!({ "lastName": "Reyes", "firstName": "Ana", "middleName": null });
        assert_eq!(display_name(&p).as_deref(), Some("Reyes, Ana"));
    }
}
