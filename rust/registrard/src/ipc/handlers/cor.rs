use crate::auth::Role;
use crate::cor::{self, CorSnapshot, CorStudent, CorSubject, Meeting, SchoolHeader};
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::setup;
use crate::ipc::handlers::students::{display_name, profile_json};
use crate::ipc::helpers::{
    new_id, notify, optional_i64_range, optional_str, required_str, run_authed,
    write_text_file, Ctx, ANYONE, REVIEWERS,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

struct Stored {
    id: String,
    enrollment_id: String,
    student_id: String,
    version: i64,
    snapshot: CorSnapshot,
    checksum: String,
    generated_at: String,
}

fn stored_to_json(s: &Stored) -> Value {
    json!({
        "id": s.id,
        "enrollmentId": s.enrollment_id,
        "corNo": s.snapshot.cor_no,
        "version": s.version,
        "checksum": s.checksum,
        "generatedAt": s.generated_at,
        "snapshot": s.snapshot,
        "totalHours": s.snapshot.total_hours(),
    })
}

fn load_stored(conn: &Connection, where_sql: &str, arg: &str, version: Option<i64>) -> Result<Stored, HandlerErr> {
    let row: Option<(String, String, String, i64, String, String, String)> = conn
        .query_row(
            &format!(
                "SELECT c.id, c.enrollment_id, e.student_id, c.version, c.snapshot_json, c.checksum, c.generated_at
                 FROM certificates_of_registration c
                 JOIN enrollments e ON e.id = c.enrollment_id
                 WHERE {} AND (?2 IS NULL OR c.version = ?2)
                 ORDER BY c.version DESC LIMIT 1",
                where_sql
            ),
            rusqlite::params![arg, version],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?, r.get(6)?)),
        )
        .optional()?;
    let Some((id, enrollment_id, student_id, version, snapshot_json, checksum, generated_at)) = row
    else {
        return Err(HandlerErr::not_found("certificate of registration"));
    };
    let snapshot: CorSnapshot = serde_json::from_str(&snapshot_json).map_err(|e| {
        tracing::error!(cor_id = %id, error = %e, "stored COR snapshot is unreadable");
        HandlerErr::new("internal_error", format!("unreadable COR snapshot: {}", e))
    })?;
    Ok(Stored {
        id,
        enrollment_id,
        student_id,
        version,
        snapshot,
        checksum,
        generated_at,
    })
}

/// Latest (or the requested) version for an enrollment or a COR number.
fn find_for(ctx: &Ctx, req: &Request) -> Result<Stored, HandlerErr> {
    let version = optional_i64_range(&req.params, "version", 1, i64::MAX)?;
    let stored = if let Some(cor_no) = optional_str(&req.params, "corNo")? {
        load_stored(ctx.conn, "c.cor_no = ?1", &cor_no, None)?
    } else {
        let enrollment_id = required_str(&req.params, "enrollmentId")?;
        load_stored(ctx.conn, "c.enrollment_id = ?1", &enrollment_id, version)?
    };
    if ctx.actor.role == Role::Student && stored.student_id != ctx.actor.user_id {
        return Err(HandlerErr::forbidden("not your certificate of registration"));
    }
    Ok(stored)
}

fn subjects_for(conn: &Connection, enrollment_id: &str, section_id: &str, sy: &str) -> Result<Vec<CorSubject>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT fl.id, s.code, s.name, s.subject_type, s.hours
         FROM faculty_loads fl
         JOIN subjects s ON s.id = fl.subject_id
         WHERE fl.section_id = ? AND fl.school_year_id = ?
         ORDER BY CASE s.subject_type WHEN 'core' THEN 1 WHEN 'applied' THEN 2 ELSE 3 END, s.code",
    )?;
    let loads = stmt
        .query_map((section_id, sy), |r| {
            Ok((
                r.get::<_, String>(0)?,
                CorSubject {
                    code: r.get(1)?,
                    name: r.get(2)?,
                    subject_type: r.get(3)?,
                    hours: r.get(4)?,
                    schedule: Vec::new(),
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut meetings = conn.prepare(
        "SELECT c.day_of_week, c.start_time, c.end_time, c.room, u.full_name
         FROM class_details cd
         JOIN classes c ON c.id = cd.class_id
         JOIN faculty_loads fl ON fl.id = c.faculty_load_id
         JOIN users u ON u.id = fl.faculty_id
         WHERE cd.enrollment_id = ? AND c.faculty_load_id = ?
         ORDER BY CASE c.day_of_week
             WHEN 'MON' THEN 1 WHEN 'TUE' THEN 2 WHEN 'WED' THEN 3
             WHEN 'THU' THEN 4 WHEN 'FRI' THEN 5 ELSE 6 END,
           c.start_time",
    )?;
    let mut out = Vec::with_capacity(loads.len());
    for (load_id, mut subject) in loads {
        subject.schedule = meetings
            .query_map((enrollment_id, &load_id), |r| {
                Ok(Meeting {
                    day: r.get(0)?,
                    start: r.get(1)?,
                    end: r.get(2)?,
                    room: r.get(3)?,
                    faculty: r.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        out.push(subject);
    }
    Ok(out)
}

fn handle_generate(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let enrollment_id = required_str(&req.params, "enrollmentId")?;
    let row: Option<(String, String, Option<String>, String, i64, i64, i64, i64, String, String, i64)> = ctx
        .conn
        .query_row(
            "SELECT e.student_id, u.full_name, e.assigned_section_id, e.status, e.is_transferee,
                    sy.year_start, sy.year_end, sy.semester, st.code, st.name, e.grade_level
             FROM enrollments e
             JOIN users u ON u.id = e.student_id
             JOIN school_years sy ON sy.id = e.school_year_id
             JOIN strands st ON st.id = e.strand_id
             WHERE e.id = ?",
            [&enrollment_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                    r.get(8)?,
                    r.get(9)?,
                    r.get(10)?,
                ))
            },
        )
        .optional()?;
    let Some((
        student_id,
        full_name,
        section_id,
        status,
        is_transferee,
        year_start,
        year_end,
        semester,
        strand_code,
        strand_name,
        grade_level,
    )) = row
    else {
        return Err(HandlerErr::not_found("enrollment"));
    };
    let (Some(section_id), "enrolled") = (section_id, status.as_str()) else {
        return Err(HandlerErr::new(
            "not_enrolled",
            "a COR is only issued for officially enrolled students",
        ));
    };

    let (section_name, adviser, sy_id): (String, Option<String>, String) = ctx.conn.query_row(
        "SELECT sec.name, u.full_name, e.school_year_id
         FROM sections sec
         JOIN enrollments e ON e.assigned_section_id = sec.id
         LEFT JOIN users u ON u.id = sec.adviser_id
         WHERE e.id = ?",
        [&enrollment_id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )?;
    let profile = profile_json(ctx.conn, &student_id)?.unwrap_or(Value::Null);
    let text = |k: &str| profile.get(k).and_then(|v| v.as_str()).map(str::to_string);
    let school: SchoolHeader = serde_json::from_value(setup::school_header(ctx.conn)?)
        .map_err(|e| HandlerErr::new("internal_error", e.to_string()))?;
    let subjects = subjects_for(ctx.conn, &enrollment_id, &section_id, &sy_id)?;

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    let version: i64 = tx.query_row(
        "SELECT COALESCE(MAX(version), 0) + 1 FROM certificates_of_registration WHERE enrollment_id = ?",
        [&enrollment_id],
        |r| r.get(0),
    )?;
    let prefix = format!("COR-{}-", year_start);
    let seq: i64 = tx.query_row(
        "SELECT COUNT(*) + 1 FROM certificates_of_registration WHERE cor_no LIKE ? || '%'",
        [&prefix],
        |r| r.get(0),
    )?;
    let generated_at = db::now_utc();
    let snapshot = CorSnapshot {
        cor_no: cor::cor_number(year_start, seq),
        version,
        generated_at: generated_at.clone(),
        school,
        student: CorStudent {
            id: student_id.clone(),
            name: display_name(&profile).unwrap_or(full_name),
            lrn: text("lrn"),
            sex: text("sex"),
            birth_date: text("birthDate"),
            address: text("address"),
        },
        school_year: format!("S.Y. {}-{}", year_start, year_end),
        semester,
        strand_code,
        strand_name,
        grade_level,
        section: section_name,
        adviser,
        is_transferee: is_transferee != 0,
        subjects,
    };
    let checksum = cor::checksum(&snapshot)?;
    let snapshot_json = serde_json::to_string(&snapshot)
        .map_err(|e| HandlerErr::new("internal_error", e.to_string()))?;
    let id = new_id();
    tx.execute(
        "INSERT INTO certificates_of_registration(
            id, enrollment_id, cor_no, version, snapshot_json, checksum, generated_by, generated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            enrollment_id,
            snapshot.cor_no,
            version,
            snapshot_json,
            checksum,
            ctx.actor.user_id,
            generated_at
        ],
    )
    .map_err(HandlerErr::db("db_insert_failed"))?;
    notify(
        &tx,
        &student_id,
        "cor",
        &format!("Your Certificate of Registration {} is ready.", snapshot.cor_no),
        Some(&enrollment_id),
    )?;
    tx.commit().map_err(HandlerErr::db("db_tx_failed"))?;
    tracing::info!(cor_no = %snapshot.cor_no, version, enrollment_id = %enrollment_id, "COR generated");

    let stored = Stored {
        id,
        enrollment_id,
        student_id,
        version,
        snapshot,
        checksum,
        generated_at,
    };
    Ok(json!({ "cor": stored_to_json(&stored) }))
}

fn handle_get(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let stored = find_for(ctx, req)?;
    Ok(json!({ "cor": stored_to_json(&stored) }))
}

fn handle_render_html(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let stored = find_for(ctx, req)?;
    let html = cor::render_html(&stored.snapshot, &stored.checksum);
    let out_path = optional_str(&req.params, "outPath")?;
    if let Some(path) = &out_path {
        write_text_file(path, &html)?;
    }
    Ok(json!({
        "corNo": stored.snapshot.cor_no,
        "version": stored.version,
        "html": html,
        "path": out_path,
    }))
}

fn handle_verify(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let cor_no = required_str(&req.params, "corNo")?;
    let presented = optional_str(&req.params, "checksum")?;
    let stored = match load_stored(ctx.conn, "c.cor_no = ?1", &cor_no, None) {
        Ok(s) => s,
        Err(e) if e.code == "not_found" => {
            return Ok(json!({ "corNo": cor_no, "valid": false, "reason": "unknown" }));
        }
        Err(e) => return Err(e),
    };
    let recomputed = cor::checksum(&stored.snapshot)?;
    let reason = if recomputed != stored.checksum {
        Some("tampered")
    } else if presented.as_deref().is_some_and(|p| !p.eq_ignore_ascii_case(&stored.checksum)) {
        Some("checksum_mismatch")
    } else {
        None
    };
    Ok(json!({
        "corNo": cor_no,
        "valid": reason.is_none(),
        "reason": reason,
        "studentName": stored.snapshot.student.name,
        "schoolYear": stored.snapshot.school_year,
        "semester": stored.snapshot.semester,
        "version": stored.version,
        "generatedAt": stored.generated_at,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let resp = match req.method.as_str() {
        "cor.generate" => run_authed(state, req, REVIEWERS, handle_generate),
        "cor.get" => run_authed(state, req, ANYONE, handle_get),
        "cor.renderHtml" => run_authed(state, req, ANYONE, handle_render_html),
        "cor.verify" => run_authed(state, req, ANYONE, handle_verify),
        _ => return None,
    };
    Some(resp)
}
