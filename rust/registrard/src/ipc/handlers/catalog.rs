use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    active_school_year_id, new_id, optional_i64_range, optional_str, required_i64_range,
    required_str, run_authed, Ctx, ANYONE, REGISTRAR,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};

fn ensure_unused(
    conn: &Connection,
    what: &str,
    checks: &[(&str, &str)],
    id: &str,
) -> Result<(), HandlerErr> {
    for (table, column) in checks {
        let n: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE {} = ?", table, column),
            [id],
            |r| r.get(0),
        )?;
        if n > 0 {
            return Err(HandlerErr::new(
                "in_use",
                format!("{} is referenced by {} {} row(s)", what, n, table),
            )
            .with_details(json!({ "table": table, "count": n })));
        }
    }
    Ok(())
}

// ---- strands ----

fn strand_row(r: &Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "code": r.get::<_, String>(1)?,
        "name": r.get::<_, String>(2)?,
        "track": r.get::<_, Option<String>>(3)?,
    }))
}

fn strand_json(conn: &Connection, id: &str) -> Result<Value, HandlerErr> {
    conn.query_row(
        "SELECT id, code, name, track FROM strands WHERE id = ?",
        [id],
        strand_row,
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("strand"))
}

fn handle_strands_list(ctx: &Ctx, _req: &Request) -> Result<Value, HandlerErr> {
    let mut stmt = ctx
        .conn
        .prepare("SELECT id, code, name, track FROM strands ORDER BY code")?;
    let rows = stmt
        .query_map([], strand_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "strands": rows }))
}

fn handle_strands_create(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let code = required_str(&req.params, "code")?.to_ascii_uppercase();
    let name = required_str(&req.params, "name")?;
    let track = optional_str(&req.params, "track")?;
    let id = new_id();
    ctx.conn
        .execute(
            "INSERT INTO strands(id, code, name, track, created_at) VALUES(?, ?, ?, ?, ?)",
            (&id, &code, &name, &track, db::now_utc()),
        )
        .map_err(HandlerErr::db("db_insert_failed"))?;
    Ok(json!({ "strand": strand_json(ctx.conn, &id)? }))
}

fn handle_strands_update(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let id = required_str(&req.params, "strandId")?;
    strand_json(ctx.conn, &id)?;
    let name = optional_str(&req.params, "name")?;
    let set_track = req.params.get("track").is_some();
    let track = optional_str(&req.params, "track")?;
    ctx.conn
        .execute(
            "UPDATE strands
             SET name = COALESCE(?1, name),
                 track = CASE WHEN ?2 THEN ?3 ELSE track END
             WHERE id = ?4",
            (&name, set_track, &track, &id),
        )
        .map_err(HandlerErr::db("db_update_failed"))?;
    Ok(json!({ "strand": strand_json(ctx.conn, &id)? }))
}

fn handle_strands_delete(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let id = required_str(&req.params, "strandId")?;
    strand_json(ctx.conn, &id)?;
    ensure_unused(
        ctx.conn,
        "strand",
        &[
            ("sections", "strand_id"),
            ("subjects", "strand_id"),
            ("enrollments", "strand_id"),
        ],
        &id,
    )?;
    ctx.conn
        .execute("DELETE FROM strands WHERE id = ?", [&id])
        .map_err(HandlerErr::db("db_delete_failed"))?;
    Ok(json!({ "deleted": id }))
}

// ---- sections ----

const SELECT_SECTION: &str = "SELECT
       sec.id, sec.strand_id, st.code, sec.grade_level, sec.name, sec.capacity,
       sec.adviser_id, u.full_name,
       (SELECT COUNT(*) FROM enrollments e
        WHERE e.assigned_section_id = sec.id
          AND e.status = 'enrolled'
          AND e.school_year_id = ?1) AS enrolled_count
     FROM sections sec
     JOIN strands st ON st.id = sec.strand_id
     LEFT JOIN users u ON u.id = sec.adviser_id";

fn section_row(r: &Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "strandId": r.get::<_, String>(1)?,
        "strandCode": r.get::<_, String>(2)?,
        "gradeLevel": r.get::<_, i64>(3)?,
        "name": r.get::<_, String>(4)?,
        "capacity": r.get::<_, i64>(5)?,
        "adviserId": r.get::<_, Option<String>>(6)?,
        "adviserName": r.get::<_, Option<String>>(7)?,
        "enrolledCount": r.get::<_, i64>(8)?,
    }))
}

pub fn section_json(conn: &Connection, id: &str) -> Result<Value, HandlerErr> {
    let sy = active_school_year_id(conn)?;
    conn.query_row(
        &format!("{} WHERE sec.id = ?2", SELECT_SECTION),
        (sy, id),
        section_row,
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("section"))
}

fn ensure_faculty(conn: &Connection, user_id: &str) -> Result<(), HandlerErr> {
    let role: Option<String> = conn
        .query_row(
            "SELECT role FROM users WHERE id = ? AND active = 1",
            [user_id],
            |r| r.get(0),
        )
        .optional()?;
    match role.as_deref() {
        Some("faculty") => Ok(()),
        Some(_) => Err(HandlerErr::bad_params("user is not a faculty member")),
        None => Err(HandlerErr::not_found("faculty")),
    }
}

fn handle_sections_list(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let strand_id = optional_str(&req.params, "strandId")?;
    let grade_level = optional_i64_range(&req.params, "gradeLevel", 11, 12)?;
    let sy = match optional_str(&req.params, "schoolYearId")? {
        Some(id) => Some(id),
        None => active_school_year_id(ctx.conn)?,
    };
    let mut stmt = ctx.conn.prepare(&format!(
        "{} WHERE (?2 IS NULL OR sec.strand_id = ?2)
           AND (?3 IS NULL OR sec.grade_level = ?3)
         ORDER BY st.code, sec.grade_level, sec.name",
        SELECT_SECTION
    ))?;
    let rows = stmt
        .query_map((sy, strand_id, grade_level), section_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "sections": rows }))
}

fn handle_sections_create(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let strand_id = required_str(&req.params, "strandId")?;
    strand_json(ctx.conn, &strand_id)?;
    let grade_level = required_i64_range(&req.params, "gradeLevel", 11, 12)?;
    let name = required_str(&req.params, "name")?;
    let capacity = match optional_i64_range(&req.params, "capacity", 1, 100)? {
        Some(c) => c,
        None => setup::default_section_capacity(ctx.conn)?,
    };
    let adviser_id = optional_str(&req.params, "adviserId")?;
    if let Some(a) = &adviser_id {
        ensure_faculty(ctx.conn, a)?;
    }
    let id = new_id();
    ctx.conn
        .execute(
            "INSERT INTO sections(id, strand_id, grade_level, name, capacity, adviser_id)
             VALUES(?, ?, ?, ?, ?, ?)",
            (&id, &strand_id, grade_level, &name, capacity, &adviser_id),
        )
        .map_err(HandlerErr::db("db_insert_failed"))?;
    Ok(json!({ "section": section_json(ctx.conn, &id)? }))
}

fn handle_sections_update(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let id = required_str(&req.params, "sectionId")?;
    let current = section_json(ctx.conn, &id)?;
    let name = optional_str(&req.params, "name")?;
    let capacity = optional_i64_range(&req.params, "capacity", 1, 100)?;
    let set_adviser = req.params.get("adviserId").is_some();
    let adviser_id = optional_str(&req.params, "adviserId")?;
    if let Some(capacity) = capacity {
        let enrolled = current["enrolledCount"].as_i64().unwrap_or(0);
        if capacity < enrolled {
            return Err(HandlerErr::bad_params(format!(
                "capacity {} is below the {} students already enrolled",
                capacity, enrolled
            )));
        }
    }
    if let Some(a) = &adviser_id {
        ensure_faculty(ctx.conn, a)?;
    }
    ctx.conn
        .execute(
            "UPDATE sections
             SET name = COALESCE(?1, name),
                 capacity = COALESCE(?2, capacity),
                 adviser_id = CASE WHEN ?3 THEN ?4 ELSE adviser_id END
             WHERE id = ?5",
            (&name, capacity, set_adviser, &adviser_id, &id),
        )
        .map_err(HandlerErr::db("db_update_failed"))?;
    Ok(json!({ "section": section_json(ctx.conn, &id)? }))
}

fn handle_sections_delete(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let id = required_str(&req.params, "sectionId")?;
    section_json(ctx.conn, &id)?;
    ensure_unused(
        ctx.conn,
        "section",
        &[
            ("enrollments", "assigned_section_id"),
            ("faculty_loads", "section_id"),
        ],
        &id,
    )?;
    ctx.conn
        .execute("DELETE FROM sections WHERE id = ?", [&id])
        .map_err(HandlerErr::db("db_delete_failed"))?;
    Ok(json!({ "deleted": id }))
}

// ---- subjects ----

const SUBJECT_TYPES: [&str; 3] = ["core", "applied", "specialized"];

const SELECT_SUBJECT: &str = "SELECT
       sub.id, sub.code, sub.name, sub.subject_type, sub.grade_level, sub.semester,
       sub.strand_id, st.code, sub.hours
     FROM subjects sub
     LEFT JOIN strands st ON st.id = sub.strand_id";

fn subject_row(r: &Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "code": r.get::<_, String>(1)?,
        "name": r.get::<_, String>(2)?,
        "subjectType": r.get::<_, String>(3)?,
        "gradeLevel": r.get::<_, i64>(4)?,
        "semester": r.get::<_, i64>(5)?,
        "strandId": r.get::<_, Option<String>>(6)?,
        "strandCode": r.get::<_, Option<String>>(7)?,
        "hours": r.get::<_, i64>(8)?,
    }))
}

pub fn subject_json(conn: &Connection, id: &str) -> Result<Value, HandlerErr> {
    conn.query_row(
        &format!("{} WHERE sub.id = ?", SELECT_SUBJECT),
        [id],
        subject_row,
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("subject"))
}

fn parse_subject_type(raw: &str) -> Result<String, HandlerErr> {
    let t = raw.trim().to_ascii_lowercase();
    if !SUBJECT_TYPES.contains(&t.as_str()) {
        return Err(HandlerErr::bad_params(
            "subjectType must be one of: core, applied, specialized",
        ));
    }
    Ok(t)
}

fn handle_subjects_list(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let strand_id = optional_str(&req.params, "strandId")?;
    let grade_level = optional_i64_range(&req.params, "gradeLevel", 11, 12)?;
    let semester = optional_i64_range(&req.params, "semester", 1, 2)?;
    // A strand filter includes subjects common to every strand.
    let mut stmt = ctx.conn.prepare(&format!(
        "{} WHERE (?1 IS NULL OR sub.strand_id IS NULL OR sub.strand_id = ?1)
           AND (?2 IS NULL OR sub.grade_level = ?2)
           AND (?3 IS NULL OR sub.semester = ?3)
         ORDER BY sub.grade_level, sub.semester, sub.code",
        SELECT_SUBJECT
    ))?;
    let rows = stmt
        .query_map((strand_id, grade_level, semester), subject_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "subjects": rows }))
}

fn handle_subjects_create(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let code = required_str(&req.params, "code")?.to_ascii_uppercase();
    let name = required_str(&req.params, "name")?;
    let subject_type = parse_subject_type(&required_str(&req.params, "subjectType")?)?;
    let grade_level = required_i64_range(&req.params, "gradeLevel", 11, 12)?;
    let semester = required_i64_range(&req.params, "semester", 1, 2)?;
    let hours = optional_i64_range(&req.params, "hours", 1, 400)?.unwrap_or(80);
    let strand_id = optional_str(&req.params, "strandId")?;
    if let Some(s) = &strand_id {
        strand_json(ctx.conn, s)?;
    }
    if subject_type == "specialized" && strand_id.is_none() {
        return Err(HandlerErr::bad_params("specialized subjects need a strandId"));
    }
    let id = new_id();
    ctx.conn
        .execute(
            "INSERT INTO subjects(id, code, name, subject_type, grade_level, semester, strand_id, hours)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &id,
                &code,
                &name,
                &subject_type,
                grade_level,
                semester,
                &strand_id,
                hours,
            ),
        )
        .map_err(HandlerErr::db("db_insert_failed"))?;
    Ok(json!({ "subject": subject_json(ctx.conn, &id)? }))
}

fn handle_subjects_update(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let id = required_str(&req.params, "subjectId")?;
    let current = subject_json(ctx.conn, &id)?;
    let name = optional_str(&req.params, "name")?;
    let subject_type = match optional_str(&req.params, "subjectType")? {
        Some(t) => Some(parse_subject_type(&t)?),
        None => None,
    };
    let hours = optional_i64_range(&req.params, "hours", 1, 400)?;
    let final_type = subject_type
        .as_deref()
        .or(current["subjectType"].as_str())
        .unwrap_or_default();
    if final_type == "specialized" && current["strandId"].is_null() {
        return Err(HandlerErr::bad_params("specialized subjects need a strandId"));
    }
    ctx.conn
        .execute(
            "UPDATE subjects
             SET name = COALESCE(?1, name),
                 subject_type = COALESCE(?2, subject_type),
                 hours = COALESCE(?3, hours)
             WHERE id = ?4",
            (&name, &subject_type, hours, &id),
        )
        .map_err(HandlerErr::db("db_update_failed"))?;
    Ok(json!({ "subject": subject_json(ctx.conn, &id)? }))
}

fn handle_subjects_delete(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let id = required_str(&req.params, "subjectId")?;
    subject_json(ctx.conn, &id)?;
    ensure_unused(
        ctx.conn,
        "subject",
        &[
            ("faculty_loads", "subject_id"),
            ("grades", "subject_id"),
            ("transferee_credits", "subject_id"),
        ],
        &id,
    )?;
    ctx.conn
        .execute("DELETE FROM subjects WHERE id = ?", [&id])
        .map_err(HandlerErr::db("db_delete_failed"))?;
    Ok(json!({ "deleted": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let resp = match req.method.as_str() {
        "strands.list" => run_authed(state, req, ANYONE, handle_strands_list),
        "strands.create" => run_authed(state, req, REGISTRAR, handle_strands_create),
        "strands.update" => run_authed(state, req, REGISTRAR, handle_strands_update),
        "strands.delete" => run_authed(state, req, REGISTRAR, handle_strands_delete),
        "sections.list" => run_authed(state, req, ANYONE, handle_sections_list),
        "sections.create" => run_authed(state, req, REGISTRAR, handle_sections_create),
        "sections.update" => run_authed(state, req, REGISTRAR, handle_sections_update),
        "sections.delete" => run_authed(state, req, REGISTRAR, handle_sections_delete),
        "subjects.list" => run_authed(state, req, ANYONE, handle_subjects_list),
        "subjects.create" => run_authed(state, req, REGISTRAR, handle_subjects_create),
        "subjects.update" => run_authed(state, req, REGISTRAR, handle_subjects_update),
        "subjects.delete" => run_authed(state, req, REGISTRAR, handle_subjects_delete),
        _ => return None,
    };
    Some(resp)
}
