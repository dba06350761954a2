use crate::auth::Role;
use crate::db;
use crate::grading::{
    self, ensure_editable, next_grade_status, validate_quarter, GradeAction, GradeStatus,
};
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::faculty::{load_json, load_keys};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    new_id, notify, optional_str, required_str, run_authed, Ctx, ANYONE, FACULTY, REGISTRAR,
    STAFF,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Subquery for students officially enrolled in a section for a school
/// year, bound to the given parameter numbers.
fn roster_subquery(section_param: usize, sy_param: usize) -> String {
    format!(
        "SELECT e.student_id FROM enrollments e
         WHERE e.assigned_section_id = ?{} AND e.school_year_id = ?{} AND e.status = 'enrolled'",
        section_param, sy_param
    )
}

struct Load {
    id: String,
    faculty_id: String,
    subject_id: String,
    section_id: String,
    school_year_id: String,
}

fn load_for(ctx: &Ctx, params: &Value, owner_only: bool) -> Result<Load, HandlerErr> {
    let id = required_str(params, "facultyLoadId")?;
    let (faculty_id, subject_id, section_id, school_year_id) = load_keys(ctx.conn, &id)?;
    let is_owner = faculty_id == ctx.actor.user_id;
    if (owner_only || !ctx.actor.is_reviewer()) && !is_owner {
        return Err(HandlerErr::forbidden("this faculty load belongs to someone else"));
    }
    Ok(Load {
        id,
        faculty_id,
        subject_id,
        section_id,
        school_year_id,
    })
}

fn roster_sql(select: &str, tail: &str) -> String {
    format!(
        "{} WHERE e.assigned_section_id = ?1 AND e.school_year_id = ?2 AND e.status = 'enrolled' {}",
        select, tail
    )
}

fn roster_rows(conn: &Connection, load: &Load) -> Result<Vec<Value>, HandlerErr> {
    let sql = roster_sql(
        "SELECT e.student_id,
                COALESCE(spi.last_name || ', ' || spi.first_name, u.full_name),
                spi.lrn, g.id, g.q1, g.q2, g.semester_grade, g.remarks, g.status, g.return_note
         FROM enrollments e
         JOIN users u ON u.id = e.student_id
         LEFT JOIN student_personal_info spi ON spi.user_id = e.student_id
         LEFT JOIN grades g
           ON g.student_id = e.student_id AND g.subject_id = ?3 AND g.school_year_id = e.school_year_id",
        "ORDER BY 2",
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((&load.section_id, &load.school_year_id, &load.subject_id), |r| {
            Ok(json!({
                "studentId": r.get::<_, String>(0)?,
                "studentName": r.get::<_, String>(1)?,
                "lrn": r.get::<_, Option<String>>(2)?,
                "gradeId": r.get::<_, Option<String>>(3)?,
                "q1": r.get::<_, Option<f64>>(4)?,
                "q2": r.get::<_, Option<f64>>(5)?,
                "semesterGrade": r.get::<_, Option<i64>>(6)?,
                "remarks": r.get::<_, Option<String>>(7)?,
                "status": r.get::<_, Option<String>>(8)?.unwrap_or_else(|| "draft".to_string()),
                "returnNote": r.get::<_, Option<String>>(9)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_roster(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let load = load_for(ctx, &req.params, false)?;
    Ok(json!({
        "facultyLoad": load_json(ctx.conn, &load.id)?,
        "students": roster_rows(ctx.conn, &load)?,
    }))
}

struct Entry {
    student_id: String,
    q1: Option<Option<f64>>,
    q2: Option<Option<f64>>,
}

/// `Some(None)` clears a quarter, `None` leaves it as stored.
fn quarter_field(item: &Value, key: &str, min: f64) -> Result<Option<Option<f64>>, HandlerErr> {
    match item.get(key) {
        None => Ok(None),
        Some(Value::Null) => Ok(Some(None)),
        Some(v) => {
            let n = v
                .as_f64()
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key)))?;
            Ok(Some(Some(validate_quarter(n, min)?)))
        }
    }
}

fn parse_entries(params: &Value, min: f64) -> Result<Vec<Entry>, HandlerErr> {
    let items = params
        .get("entries")
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::bad_params("entries must be an array"))?;
    items
        .iter()
        .map(|item| -> Result<Entry, HandlerErr> {
            Ok(Entry {
                student_id: required_str(item, "studentId")?,
                q1: quarter_field(item, "q1", min)?,
                q2: quarter_field(item, "q2", min)?,
            })
        })
        .collect()
}

fn handle_encode(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let load = load_for(ctx, &req.params, true)?;
    let settings = setup::grading_settings(ctx.conn)?;
    if !settings.grade_entry_open {
        return Err(HandlerErr::new("grade_entry_closed", "grade encoding is closed"));
    }
    let entries = parse_entries(&req.params, settings.min_quarter_grade as f64)?;

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    let in_roster = format!("{} AND e.student_id = ?3", roster_subquery(1, 2));
    for entry in &entries {
        let enrolled: Option<String> = tx
            .query_row(
                &in_roster,
                (&load.section_id, &load.school_year_id, &entry.student_id),
                |r| r.get(0),
            )
            .optional()?;
        if enrolled.is_none() {
            return Err(HandlerErr::bad_params(format!(
                "student {} is not enrolled in this section",
                entry.student_id
            ))
            .with_details(json!({ "studentId": entry.student_id })));
        }

        let existing: Option<(String, Option<f64>, Option<f64>, String)> = tx
            .query_row(
                "SELECT id, q1, q2, status FROM grades
                 WHERE student_id = ? AND subject_id = ? AND school_year_id = ?",
                (&entry.student_id, &load.subject_id, &load.school_year_id),
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?;
        let (id, old_q1, old_q2, status) = match existing {
            Some((id, q1, q2, status)) => {
                let status = GradeStatus::parse(&status).unwrap_or(GradeStatus::Draft);
                (Some(id), q1, q2, status)
            }
            None => (None, None, None, GradeStatus::Draft),
        };
        ensure_editable(status).map_err(|e| {
            HandlerErr::from(e).with_details(json!({ "studentId": entry.student_id }))
        })?;

        let q1 = entry.q1.unwrap_or(old_q1);
        let q2 = entry.q2.unwrap_or(old_q2);
        let semester = grading::semester_grade(q1, q2);
        let remarks = grading::remarks(semester, settings.passing_grade);
        let now = db::now_utc();
        match id {
            Some(id) => tx.execute(
                "UPDATE grades SET q1 = ?, q2 = ?, semester_grade = ?, remarks = ?,
                        faculty_id = ?, updated_at = ?
                 WHERE id = ?",
                rusqlite::params![q1, q2, semester, remarks, load.faculty_id, now, id],
            ),
            None => tx.execute(
                "INSERT INTO grades(id, student_id, subject_id, school_year_id, faculty_id,
                                    q1, q2, semester_grade, remarks, status, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 'draft', ?)",
                rusqlite::params![
                    new_id(),
                    entry.student_id,
                    load.subject_id,
                    load.school_year_id,
                    load.faculty_id,
                    q1,
                    q2,
                    semester,
                    remarks,
                    now
                ],
            ),
        }
        .map_err(HandlerErr::db("db_update_failed"))?;
    }
    tx.commit().map_err(HandlerErr::db("db_tx_failed"))?;

    Ok(json!({
        "updated": entries.len(),
        "students": roster_rows(ctx.conn, &load)?,
    }))
}

/// Moves every roster grade of the load in one of `action.sources()` to
/// `action.target()`. Fails when no row is eligible.
fn apply_load_action(
    conn: &Connection,
    load: &Load,
    action: GradeAction,
    note: Option<&str>,
) -> Result<usize, HandlerErr> {
    let statuses: Vec<&str> = action.sources().iter().map(|s| s.as_str()).collect();
    let placeholders = statuses
        .iter()
        .enumerate()
        .map(|(i, _)| format!("?{}", i + 6))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE grades SET status = ?1, return_note = ?2, updated_at = ?3
         WHERE subject_id = ?4 AND school_year_id = ?5 AND status IN ({})
           AND student_id IN ({})",
        placeholders,
        roster_subquery(statuses.len() + 6, 5)
    );
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![
        Box::new(action.target().as_str()),
        Box::new(note.map(str::to_string)),
        Box::new(db::now_utc()),
        Box::new(load.subject_id.clone()),
        Box::new(load.school_year_id.clone()),
    ];
    for s in &statuses {
        values.push(Box::new(s.to_string()));
    }
    values.push(Box::new(load.section_id.clone()));
    let changed = conn
        .execute(&sql, rusqlite::params_from_iter(values.iter()))
        .map_err(HandlerErr::db("db_update_failed"))?;
    if changed == 0 {
        let current: Option<String> = conn
            .query_row(
                &format!(
                    "SELECT status FROM grades
                     WHERE subject_id = ?1 AND school_year_id = ?2 AND student_id IN ({})
                     LIMIT 1",
                    roster_subquery(3, 2)
                ),
                (&load.subject_id, &load.school_year_id, &load.section_id),
                |r| r.get(0),
            )
            .optional()?;
        return match current.as_deref().and_then(GradeStatus::parse) {
            Some(status) => {
                next_grade_status(action, status)?;
                Err(HandlerErr::new("conflict", "grades changed while updating; retry"))
            }
            None => Err(HandlerErr::new(
                "no_grades",
                "no grades were encoded for this load",
            )),
        };
    }
    Ok(changed)
}

fn subject_label(conn: &Connection, subject_id: &str) -> Result<String, HandlerErr> {
    Ok(conn.query_row(
        "SELECT code || ' ' || name FROM subjects WHERE id = ?",
        [subject_id],
        |r| r.get(0),
    )?)
}

fn handle_submit(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let load = load_for(ctx, &req.params, true)?;
    let roster = roster_rows(ctx.conn, &load)?;
    let missing: Vec<&Value> = roster
        .iter()
        .filter(|r| r["semesterGrade"].is_null())
        .map(|r| &r["studentId"])
        .collect();
    if !missing.is_empty() {
        return Err(HandlerErr::new(
            "incomplete_grades",
            "every student needs both quarter grades before submission",
        )
        .with_details(json!({ "studentIds": missing })));
    }

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    let changed = apply_load_action(&tx, &load, GradeAction::Submit, None)?;
    let label = subject_label(&tx, &load.subject_id)?;
    let mut stmt = tx.prepare("SELECT id FROM users WHERE role = 'registrar' AND active = 1")?;
    let registrars = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);
    for registrar in &registrars {
        notify(
            &tx,
            registrar,
            "grades",
            &format!("Grades for {} were submitted for approval.", label),
            Some(&load.id),
        )?;
    }
    tx.commit().map_err(HandlerErr::db("db_tx_failed"))?;
    tracing::info!(load_id = %load.id, rows = changed, by = %ctx.actor.username, "grades submitted");
    Ok(json!({ "submitted": changed }))
}

fn handle_approve(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let load = load_for(ctx, &req.params, false)?;
    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    let changed = apply_load_action(&tx, &load, GradeAction::Approve, None)?;
    let label = subject_label(&tx, &load.subject_id)?;
    notify(
        &tx,
        &load.faculty_id,
        "grades",
        &format!("Your grades for {} were approved.", label),
        Some(&load.id),
    )?;
    let mut stmt = tx.prepare(&roster_sql("SELECT e.student_id FROM enrollments e", ""))?;
    let students = stmt
        .query_map((&load.section_id, &load.school_year_id), |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);
    for student in &students {
        notify(
            &tx,
            student,
            "grades",
            &format!("Your grade for {} is now available.", label),
            Some(&load.id),
        )?;
    }
    tx.commit().map_err(HandlerErr::db("db_tx_failed"))?;
    tracing::info!(load_id = %load.id, rows = changed, by = %ctx.actor.username, "grades approved");
    Ok(json!({ "approved": changed }))
}

fn handle_return(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let load = load_for(ctx, &req.params, false)?;
    let remarks = required_str(&req.params, "remarks")?;
    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    let changed = apply_load_action(&tx, &load, GradeAction::Return, Some(&remarks))?;
    let label = subject_label(&tx, &load.subject_id)?;
    notify(
        &tx,
        &load.faculty_id,
        "grades",
        &format!("Your grades for {} were returned: {}", label, remarks),
        Some(&load.id),
    )?;
    tx.commit().map_err(HandlerErr::db("db_tx_failed"))?;
    Ok(json!({ "returned": changed }))
}

fn handle_student(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let requested = optional_str(&req.params, "studentId")?;
    let student_id = match (ctx.actor.role, requested) {
        (Role::Student, Some(id)) if id != ctx.actor.user_id => {
            return Err(HandlerErr::forbidden("students may only view their own grades"));
        }
        (Role::Student, _) => ctx.actor.user_id.clone(),
        (_, Some(id)) => id,
        (_, None) => return Err(HandlerErr::bad_params("missing studentId")),
    };
    let school_year = optional_str(&req.params, "schoolYearId")?;
    let passing = setup::grading_settings(ctx.conn)?.passing_grade;

    let mut stmt = ctx.conn.prepare(
        "SELECT g.school_year_id, sy.year_start, sy.year_end, sy.semester,
                s.code, s.name, s.subject_type, g.q1, g.q2, g.semester_grade, g.remarks
         FROM grades g
         JOIN subjects s ON s.id = g.subject_id
         JOIN school_years sy ON sy.id = g.school_year_id
         WHERE g.student_id = ?1 AND g.status = 'approved'
           AND (?2 IS NULL OR g.school_year_id = ?2)
         ORDER BY sy.year_start, sy.semester, s.subject_type, s.code",
    )?;
    let rows = stmt
        .query_map((&student_id, &school_year), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, i64>(3)?,
                json!({
                    "subjectCode": r.get::<_, String>(4)?,
                    "subjectName": r.get::<_, String>(5)?,
                    "subjectType": r.get::<_, String>(6)?,
                    "q1": r.get::<_, Option<f64>>(7)?,
                    "q2": r.get::<_, Option<f64>>(8)?,
                    "semesterGrade": r.get::<_, Option<i64>>(9)?,
                    "remarks": r.get::<_, Option<String>>(10)?,
                }),
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    // Keyed by (year_start, semester) so terms come out in order.
    let mut terms: BTreeMap<(i64, i64), (String, i64, Vec<Value>)> = BTreeMap::new();
    for (sy_id, year_start, year_end, semester, grade) in rows {
        terms
            .entry((year_start, semester))
            .or_insert_with(|| (sy_id, year_end, Vec::new()))
            .2
            .push(grade);
    }
    let terms: Vec<Value> = terms
        .into_iter()
        .map(|((year_start, semester), (sy_id, year_end, grades))| {
            let finals: Vec<i64> = grades
                .iter()
                .filter_map(|g| g["semesterGrade"].as_i64())
                .collect();
            let average = grading::general_average(&finals);
            json!({
                "schoolYearId": sy_id,
                "yearStart": year_start,
                "yearEnd": year_end,
                "semester": semester,
                "grades": grades,
                "generalAverage": average,
                "remarks": average.map(|a| if a >= passing as f64 { "Passed" } else { "Failed" }),
            })
        })
        .collect();
    Ok(json!({ "studentId": student_id, "terms": terms }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let resp = match req.method.as_str() {
        "grades.roster" => run_authed(state, req, STAFF, handle_roster),
        "grades.encode" => run_authed(state, req, FACULTY, handle_encode),
        "grades.submit" => run_authed(state, req, FACULTY, handle_submit),
        "grades.approve" => run_authed(state, req, REGISTRAR, handle_approve),
        "grades.return" => run_authed(state, req, REGISTRAR, handle_return),
        "grades.student" => run_authed(state, req, ANYONE, handle_student),
        _ => return None,
    };
    Some(resp)
}
