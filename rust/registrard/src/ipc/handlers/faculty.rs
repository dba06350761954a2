use crate::auth::Role;
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::catalog::subject_json;
use crate::ipc::helpers::{
    new_id, optional_str, required_str, run_authed, school_year_param, Ctx, ANYONE, REVIEWERS,
    STAFF,
};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveTime;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};

const SELECT_LOAD: &str = "SELECT
       fl.id, fl.faculty_id, u.full_name, fl.subject_id, sub.code, sub.name, sub.semester,
       fl.section_id, sec.name, sec.grade_level, st.code, fl.school_year_id,
       (SELECT COUNT(*) FROM classes c WHERE c.faculty_load_id = fl.id) AS class_count,
       (SELECT COUNT(*) FROM enrollments e
        WHERE e.assigned_section_id = fl.section_id
          AND e.school_year_id = fl.school_year_id
          AND e.status = 'enrolled') AS student_count
     FROM faculty_loads fl
     JOIN users u ON u.id = fl.faculty_id
     JOIN subjects sub ON sub.id = fl.subject_id
     JOIN sections sec ON sec.id = fl.section_id
     JOIN strands st ON st.id = sec.strand_id";

fn load_row(r: &Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "facultyId": r.get::<_, String>(1)?,
        "facultyName": r.get::<_, String>(2)?,
        "subjectId": r.get::<_, String>(3)?,
        "subjectCode": r.get::<_, String>(4)?,
        "subjectName": r.get::<_, String>(5)?,
        "semester": r.get::<_, i64>(6)?,
        "sectionId": r.get::<_, String>(7)?,
        "sectionName": r.get::<_, String>(8)?,
        "gradeLevel": r.get::<_, i64>(9)?,
        "strandCode": r.get::<_, String>(10)?,
        "schoolYearId": r.get::<_, String>(11)?,
        "classCount": r.get::<_, i64>(12)?,
        "studentCount": r.get::<_, i64>(13)?,
    }))
}

pub fn load_json(conn: &Connection, id: &str) -> Result<Value, HandlerErr> {
    conn.query_row(&format!("{} WHERE fl.id = ?", SELECT_LOAD), [id], load_row)
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("faculty load"))
}

/// The `(faculty_id, subject_id, section_id, school_year_id)` of a load.
pub fn load_keys(
    conn: &Connection,
    id: &str,
) -> Result<(String, String, String, String), HandlerErr> {
    conn.query_row(
        "SELECT faculty_id, subject_id, section_id, school_year_id FROM faculty_loads WHERE id = ?",
        [id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("faculty load"))
}

/// Faculty only see their own loads; reviewers see everything.
fn scoped_faculty_id(ctx: &Ctx, requested: Option<String>) -> Option<String> {
    if ctx.actor.role == Role::Faculty && !ctx.actor.is_reviewer() {
        Some(ctx.actor.user_id.clone())
    } else {
        requested
    }
}

fn handle_loads_list(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let sy = school_year_param(ctx.conn, &req.params)?;
    let faculty_id = scoped_faculty_id(ctx, optional_str(&req.params, "facultyId")?);
    let section_id = optional_str(&req.params, "sectionId")?;
    let mut stmt = ctx.conn.prepare(&format!(
        "{} WHERE fl.school_year_id = ?1
           AND (?2 IS NULL OR fl.faculty_id = ?2)
           AND (?3 IS NULL OR fl.section_id = ?3)
         ORDER BY u.full_name, st.code, sec.name, sub.code",
        SELECT_LOAD
    ))?;
    let rows = stmt
        .query_map((&sy, faculty_id, section_id), load_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "facultyLoads": rows }))
}

fn handle_loads_assign(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let faculty_id = required_str(&req.params, "facultyId")?;
    let subject_id = required_str(&req.params, "subjectId")?;
    let section_id = required_str(&req.params, "sectionId")?;
    let sy = school_year_param(ctx.conn, &req.params)?;

    let role: Option<String> = ctx
        .conn
        .query_row(
            "SELECT role FROM users WHERE id = ? AND active = 1",
            [&faculty_id],
            |r| r.get(0),
        )
        .optional()?;
    match role.as_deref() {
        Some("faculty") => {}
        Some(_) => return Err(HandlerErr::bad_params("user is not a faculty member")),
        None => return Err(HandlerErr::not_found("faculty")),
    }

    let subject = subject_json(ctx.conn, &subject_id)?;
    let (section_strand, section_grade): (String, i64) = ctx
        .conn
        .query_row(
            "SELECT strand_id, grade_level FROM sections WHERE id = ?",
            [&section_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("section"))?;
    if subject["gradeLevel"].as_i64() != Some(section_grade) {
        return Err(HandlerErr::bad_params(
            "subject grade level does not match the section",
        ));
    }
    if let Some(strand) = subject["strandId"].as_str() {
        if strand != section_strand {
            return Err(HandlerErr::bad_params(
                "subject belongs to a different strand than the section",
            ));
        }
    }
    let term: i64 = ctx
        .conn
        .query_row("SELECT semester FROM school_years WHERE id = ?", [&sy], |r| {
            r.get(0)
        })
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("school year"))?;
    if subject["semester"].as_i64() != Some(term) {
        return Err(HandlerErr::bad_params(format!(
            "subject is offered in semester {}, the school year is semester {}",
            subject["semester"], term
        )));
    }

    let existing: Option<String> = ctx
        .conn
        .query_row(
            "SELECT id FROM faculty_loads
             WHERE subject_id = ? AND section_id = ? AND school_year_id = ?",
            (&subject_id, &section_id, &sy),
            |r| r.get(0),
        )
        .optional()?;
    let id = match existing {
        Some(id) => {
            ctx.conn
                .execute(
                    "UPDATE faculty_loads SET faculty_id = ? WHERE id = ?",
                    (&faculty_id, &id),
                )
                .map_err(HandlerErr::db("db_update_failed"))?;
            tracing::info!(load_id = %id, faculty_id = %faculty_id, "faculty load reassigned");
            id
        }
        None => {
            let id = new_id();
            ctx.conn
                .execute(
                    "INSERT INTO faculty_loads(id, faculty_id, subject_id, section_id, school_year_id)
                     VALUES(?, ?, ?, ?, ?)",
                    (&id, &faculty_id, &subject_id, &section_id, &sy),
                )
                .map_err(HandlerErr::db("db_insert_failed"))?;
            id
        }
    };
    Ok(json!({ "facultyLoad": load_json(ctx.conn, &id)? }))
}

fn handle_loads_remove(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let id = required_str(&req.params, "facultyLoadId")?;
    let (_, subject_id, _, sy) = load_keys(ctx.conn, &id)?;
    let classes: i64 = ctx.conn.query_row(
        "SELECT COUNT(*) FROM classes WHERE faculty_load_id = ?",
        [&id],
        |r| r.get(0),
    )?;
    if classes > 0 {
        return Err(HandlerErr::new(
            "in_use",
            "delete the load's class schedule first",
        ));
    }
    let grades: i64 = ctx.conn.query_row(
        "SELECT COUNT(*) FROM grades g
         JOIN enrollments e ON e.student_id = g.student_id AND e.school_year_id = g.school_year_id
         JOIN faculty_loads fl ON fl.section_id = e.assigned_section_id
         WHERE fl.id = ? AND g.subject_id = ? AND g.school_year_id = ?",
        (&id, &subject_id, &sy),
        |r| r.get(0),
    )?;
    if grades > 0 {
        return Err(HandlerErr::new("in_use", "grades were already encoded for this load"));
    }
    ctx.conn
        .execute("DELETE FROM faculty_loads WHERE id = ?", [&id])
        .map_err(HandlerErr::db("db_delete_failed"))?;
    Ok(json!({ "deleted": id }))
}

// ---- class schedule ----

pub const SELECT_CLASS: &str = "SELECT
       c.id, c.faculty_load_id, c.day_of_week, c.start_time, c.end_time, c.room,
       sub.code, sub.name, sec.name, u.full_name, fl.section_id, fl.faculty_id, sub.hours
     FROM classes c
     JOIN faculty_loads fl ON fl.id = c.faculty_load_id
     JOIN subjects sub ON sub.id = fl.subject_id
     JOIN sections sec ON sec.id = fl.section_id
     JOIN users u ON u.id = fl.faculty_id";

pub const CLASS_ORDER: &str = "ORDER BY CASE c.day_of_week
       WHEN 'MON' THEN 1 WHEN 'TUE' THEN 2 WHEN 'WED' THEN 3
       WHEN 'THU' THEN 4 WHEN 'FRI' THEN 5 ELSE 6 END,
     c.start_time, sub.code";

pub fn class_row(r: &Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "facultyLoadId": r.get::<_, String>(1)?,
        "dayOfWeek": r.get::<_, String>(2)?,
        "startTime": r.get::<_, String>(3)?,
        "endTime": r.get::<_, String>(4)?,
        "room": r.get::<_, Option<String>>(5)?,
        "subjectCode": r.get::<_, String>(6)?,
        "subjectName": r.get::<_, String>(7)?,
        "sectionName": r.get::<_, String>(8)?,
        "facultyName": r.get::<_, String>(9)?,
        "sectionId": r.get::<_, String>(10)?,
        "facultyId": r.get::<_, String>(11)?,
        "hours": r.get::<_, i64>(12)?,
    }))
}

fn parse_time(params: &Value, key: &str) -> Result<String, HandlerErr> {
    let raw = required_str(params, key)?;
    let t = NaiveTime::parse_from_str(&raw, "%H:%M")
        .map_err(|_| HandlerErr::bad_params(format!("{} must be HH:MM", key)))?;
    Ok(t.format("%H:%M").to_string())
}

fn parse_day(params: &Value) -> Result<String, HandlerErr> {
    let raw = required_str(params, "dayOfWeek")?.to_ascii_uppercase();
    let day = match raw.as_str() {
        "MON" | "MONDAY" => "MON",
        "TUE" | "TUESDAY" => "TUE",
        "WED" | "WEDNESDAY" => "WED",
        "THU" | "THURSDAY" => "THU",
        "FRI" | "FRIDAY" => "FRI",
        "SAT" | "SATURDAY" => "SAT",
        _ => return Err(HandlerErr::bad_params("dayOfWeek must be MON..SAT")),
    };
    Ok(day.to_string())
}

fn handle_classes_list(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let sy = school_year_param(ctx.conn, &req.params)?;
    let section_id = optional_str(&req.params, "sectionId")?;
    let load_id = optional_str(&req.params, "facultyLoadId")?;
    let faculty_id = optional_str(&req.params, "facultyId")?;
    let mut stmt = ctx.conn.prepare(&format!(
        "{} WHERE fl.school_year_id = ?1
           AND (?2 IS NULL OR fl.section_id = ?2)
           AND (?3 IS NULL OR fl.id = ?3)
           AND (?4 IS NULL OR fl.faculty_id = ?4)
         {}",
        SELECT_CLASS, CLASS_ORDER
    ))?;
    let rows = stmt
        .query_map((&sy, section_id, load_id, faculty_id), class_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "classes": rows }))
}

/// First class that overlaps `[start, end)` on `day` and shares the
/// faculty, the section or the room within the same school year.
fn find_conflict(
    conn: &Connection,
    load_id: &str,
    day: &str,
    start: &str,
    end: &str,
    room: Option<&str>,
) -> Result<Option<Value>, HandlerErr> {
    let (faculty_id, _, section_id, sy) = load_keys(conn, load_id)?;
    let row = conn
        .query_row(
            &format!(
                "{} WHERE fl.school_year_id = ?1
                   AND c.day_of_week = ?2
                   AND c.start_time < ?4 AND ?3 < c.end_time
                   AND (fl.faculty_id = ?5 OR fl.section_id = ?6
                        OR (?7 IS NOT NULL AND lower(c.room) = lower(?7)))
                 LIMIT 1",
                SELECT_CLASS
            ),
            (&sy, day, start, end, &faculty_id, &section_id, room),
            class_row,
        )
        .optional()?;
    Ok(row)
}

fn handle_classes_create(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let load_id = required_str(&req.params, "facultyLoadId")?;
    let (_, _, section_id, sy) = load_keys(ctx.conn, &load_id)?;
    let day = parse_day(&req.params)?;
    let start = parse_time(&req.params, "startTime")?;
    let end = parse_time(&req.params, "endTime")?;
    if end <= start {
        return Err(HandlerErr::bad_params("endTime must be after startTime"));
    }
    let room = optional_str(&req.params, "room")?;

    if let Some(conflict) = find_conflict(ctx.conn, &load_id, &day, &start, &end, room.as_deref())? {
        return Err(
            HandlerErr::new("schedule_conflict", "overlaps an existing class")
                .with_details(json!({ "conflictsWith": conflict })),
        );
    }

    let id = new_id();
    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    tx.execute(
        "INSERT INTO classes(id, faculty_load_id, day_of_week, start_time, end_time, room)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&id, &load_id, &day, &start, &end, &room),
    )
    .map_err(HandlerErr::db("db_insert_failed"))?;
    // Students already enrolled in the section pick up the new class.
    let added = tx
        .execute(
            "INSERT INTO class_details(id, enrollment_id, class_id, created_at)
             SELECT lower(hex(randomblob(16))), e.id, ?1, ?2
             FROM enrollments e
             WHERE e.assigned_section_id = ?3 AND e.school_year_id = ?4 AND e.status = 'enrolled'",
            (&id, db::now_utc(), &section_id, &sy),
        )
        .map_err(HandlerErr::db("db_insert_failed"))?;
    tx.commit().map_err(HandlerErr::db("db_tx_failed"))?;

    let class = ctx
        .conn
        .query_row(&format!("{} WHERE c.id = ?", SELECT_CLASS), [&id], class_row)?;
    Ok(json!({ "class": class, "studentsLinked": added }))
}

fn handle_classes_delete(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let id = required_str(&req.params, "classId")?;
    let exists: Option<i64> = ctx
        .conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&id], |r| r.get(0))
        .optional()?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("class"));
    }
    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    tx.execute("DELETE FROM class_details WHERE class_id = ?", [&id])
        .map_err(HandlerErr::db("db_delete_failed"))?;
    tx.execute("DELETE FROM classes WHERE id = ?", [&id])
        .map_err(HandlerErr::db("db_delete_failed"))?;
    tx.commit().map_err(HandlerErr::db("db_tx_failed"))?;
    Ok(json!({ "deleted": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let resp = match req.method.as_str() {
        "facultyLoads.list" => run_authed(state, req, STAFF, handle_loads_list),
        "facultyLoads.assign" => run_authed(state, req, REVIEWERS, handle_loads_assign),
        "facultyLoads.remove" => run_authed(state, req, REVIEWERS, handle_loads_remove),
        "classes.list" => run_authed(state, req, ANYONE, handle_classes_list),
        "classes.create" => run_authed(state, req, REVIEWERS, handle_classes_create),
        "classes.delete" => run_authed(state, req, REVIEWERS, handle_classes_delete),
        _ => return None,
    };
    Some(resp)
}
