use crate::auth::Role;
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::faculty::{class_row, CLASS_ORDER, SELECT_CLASS};
use crate::ipc::handlers::setup;
use crate::ipc::handlers::students::profile_json;
use crate::ipc::helpers::{
    active_school_year_id, new_id, notify, optional_bool, optional_f64, optional_i64_range,
    optional_str, required_i64_range, required_str, run_authed, school_year_param, Ctx, ANYONE,
    REVIEWERS, STUDENT,
};
use crate::ipc::types::{AppState, Request};
use crate::workflow::{
    plan_evaluation, plan_transition, EnrollmentAction, EnrollmentState, EnrollmentStatus,
    EvaluationStatus,
};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde_json::{json, Value};

const SELECT_ENROLLMENT: &str = "SELECT
       e.id, e.student_id, u.full_name, spi.lrn, e.school_year_id, sy.year_start, sy.year_end,
       sy.semester, e.strand_id, st.code, e.grade_level, e.assigned_section_id, sec.name,
       e.status, e.is_transferee, e.evaluation_status, e.remarks, e.submitted_at, e.updated_at
     FROM enrollments e
     JOIN users u ON u.id = e.student_id
     JOIN school_years sy ON sy.id = e.school_year_id
     JOIN strands st ON st.id = e.strand_id
     LEFT JOIN sections sec ON sec.id = e.assigned_section_id
     LEFT JOIN student_personal_info spi ON spi.user_id = e.student_id";

fn enrollment_row(r: &Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "studentName": r.get::<_, String>(2)?,
        "lrn": r.get::<_, Option<String>>(3)?,
        "schoolYearId": r.get::<_, String>(4)?,
        "yearStart": r.get::<_, i64>(5)?,
        "yearEnd": r.get::<_, i64>(6)?,
        "semester": r.get::<_, i64>(7)?,
        "strandId": r.get::<_, String>(8)?,
        "strandCode": r.get::<_, String>(9)?,
        "gradeLevel": r.get::<_, i64>(10)?,
        "sectionId": r.get::<_, Option<String>>(11)?,
        "sectionName": r.get::<_, Option<String>>(12)?,
        "status": r.get::<_, String>(13)?,
        "isTransferee": r.get::<_, i64>(14)? != 0,
        "evaluationStatus": r.get::<_, Option<String>>(15)?,
        "remarks": r.get::<_, Option<String>>(16)?,
        "submittedAt": r.get::<_, String>(17)?,
        "updatedAt": r.get::<_, Option<String>>(18)?,
    }))
}

pub fn enrollment_json(conn: &Connection, id: &str) -> Result<Value, HandlerErr> {
    conn.query_row(&format!("{} WHERE e.id = ?", SELECT_ENROLLMENT), [id], enrollment_row)
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("enrollment"))
}

/// Columns the workflow and the enroll guard need.
struct Loaded {
    state: EnrollmentState,
    school_year_id: String,
    strand_id: String,
    grade_level: i64,
    section_id: Option<String>,
}

fn load(conn: &Connection, id: &str) -> Result<Loaded, HandlerErr> {
    let row: Option<(String, String, i64, Option<String>, String, String, i64, Option<String>)> =
        conn.query_row(
            "SELECT student_id, status, is_transferee, evaluation_status,
                    school_year_id, strand_id, grade_level, assigned_section_id
             FROM enrollments WHERE id = ?",
            [id],
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
                ))
            },
        )
        .optional()?;
    let Some((student_id, status, transferee, evaluation, sy, strand, grade, section)) = row else {
        return Err(HandlerErr::not_found("enrollment"));
    };
    let status = EnrollmentStatus::parse(&status).ok_or_else(|| {
        HandlerErr::new("internal_error", format!("unknown enrollment status {}", status))
    })?;
    let is_transferee = transferee != 0;
    let evaluation = match evaluation.as_deref() {
        Some(s) => EvaluationStatus::parse(s),
        None if is_transferee => Some(EvaluationStatus::Pending),
        None => None,
    };
    Ok(Loaded {
        state: EnrollmentState {
            student_id,
            status,
            is_transferee,
            evaluation,
        },
        school_year_id: sy,
        strand_id: strand,
        grade_level: grade,
        section_id: section,
    })
}

/// Students only ever see their own enrollments.
fn ensure_visible(ctx: &Ctx, loaded: &Loaded) -> Result<(), HandlerErr> {
    if ctx.actor.role == Role::Student && loaded.state.student_id != ctx.actor.user_id {
        return Err(HandlerErr::forbidden("not your enrollment"));
    }
    Ok(())
}

fn insert_history(
    conn: &Connection,
    enrollment_id: &str,
    from: Option<&str>,
    to: &str,
    actor_id: &str,
    note: Option<&str>,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO enrollment_status_history(id, enrollment_id, from_status, to_status, actor_id, note, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (new_id(), enrollment_id, from, to, actor_id, note, db::now_utc()),
    )
    .map_err(HandlerErr::db("db_insert_failed"))?;
    Ok(())
}

fn handle_submit(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let strand_id = required_str(&req.params, "strandId")?;
    let grade_level = required_i64_range(&req.params, "gradeLevel", 11, 12)?;
    let is_transferee = optional_bool(&req.params, "isTransferee")?.unwrap_or(false);
    let sy = active_school_year_id(ctx.conn)?
        .ok_or_else(|| HandlerErr::new("no_active_school_year", "enrollment is closed"))?;

    if profile_json(ctx.conn, &ctx.actor.user_id)?.is_none() {
        return Err(HandlerErr::new(
            "profile_required",
            "complete your personal information first",
        ));
    }
    if is_transferee && !setup::allow_transferees(ctx.conn)? {
        return Err(HandlerErr::bad_params("transferee enrollment is closed"));
    }
    let strand_exists: Option<i64> = ctx
        .conn
        .query_row("SELECT 1 FROM strands WHERE id = ?", [&strand_id], |r| r.get(0))
        .optional()?;
    if strand_exists.is_none() {
        return Err(HandlerErr::not_found("strand"));
    }

    let id = new_id();
    let evaluation = is_transferee.then(|| EvaluationStatus::Pending.as_str());
    let now = db::now_utc();
    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    tx.execute(
        "INSERT INTO enrollments(id, student_id, school_year_id, strand_id, grade_level, status,
                                 is_transferee, evaluation_status, submitted_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            ctx.actor.user_id,
            sy,
            strand_id,
            grade_level,
            EnrollmentStatus::Pending.as_str(),
            is_transferee as i64,
            evaluation,
            now,
            now,
        ],
    )
    .map_err(HandlerErr::db("db_insert_failed"))?;
    insert_history(
        &tx,
        &id,
        None,
        EnrollmentStatus::Pending.as_str(),
        &ctx.actor.user_id,
        None,
    )?;
    notify(
        &tx,
        &ctx.actor.user_id,
        "enrollment",
        "Your enrollment was submitted and is pending review.",
        Some(&id),
    )?;
    tx.commit().map_err(HandlerErr::db("db_tx_failed"))?;
    tracing::info!(enrollment_id = %id, student = %ctx.actor.username, is_transferee, "enrollment submitted");
    Ok(json!({ "enrollment": enrollment_json(ctx.conn, &id)? }))
}

fn handle_list(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let status = match optional_str(&req.params, "status")? {
        Some(s) => Some(
            EnrollmentStatus::parse(&s)
                .ok_or_else(|| HandlerErr::bad_params("unknown status"))?
                .as_str(),
        ),
        None => None,
    };
    let rows = if ctx.actor.role == Role::Student {
        let mut stmt = ctx.conn.prepare(&format!(
            "{} WHERE e.student_id = ?1 AND (?2 IS NULL OR e.status = ?2)
             ORDER BY sy.year_start DESC, sy.semester DESC",
            SELECT_ENROLLMENT
        ))?;
        let rows = stmt
            .query_map((&ctx.actor.user_id, status), enrollment_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    } else {
        let sy = school_year_param(ctx.conn, &req.params)?;
        let strand_id = optional_str(&req.params, "strandId")?;
        let section_id = optional_str(&req.params, "sectionId")?;
        let grade_level = optional_i64_range(&req.params, "gradeLevel", 11, 12)?;
        let transferee = optional_bool(&req.params, "isTransferee")?.map(|b| b as i64);
        let mut stmt = ctx.conn.prepare(&format!(
            "{} WHERE e.school_year_id = ?1
               AND (?2 IS NULL OR e.status = ?2)
               AND (?3 IS NULL OR e.strand_id = ?3)
               AND (?4 IS NULL OR e.assigned_section_id = ?4)
               AND (?5 IS NULL OR e.grade_level = ?5)
               AND (?6 IS NULL OR e.is_transferee = ?6)
             ORDER BY e.submitted_at, u.full_name",
            SELECT_ENROLLMENT
        ))?;
        let rows = stmt
            .query_map(
                rusqlite::params![sy, status, strand_id, section_id, grade_level, transferee],
                enrollment_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    Ok(json!({ "enrollments": rows }))
}

fn history_json(conn: &Connection, enrollment_id: &str) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT h.from_status, h.to_status, h.actor_id, u.full_name, h.note, h.created_at
         FROM enrollment_status_history h
         LEFT JOIN users u ON u.id = h.actor_id
         WHERE h.enrollment_id = ?
         ORDER BY h.created_at, h.rowid",
    )?;
    let rows = stmt
        .query_map([enrollment_id], |r| {
            Ok(json!({
                "fromStatus": r.get::<_, Option<String>>(0)?,
                "toStatus": r.get::<_, String>(1)?,
                "actorId": r.get::<_, String>(2)?,
                "actorName": r.get::<_, Option<String>>(3)?,
                "note": r.get::<_, Option<String>>(4)?,
                "at": r.get::<_, String>(5)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn credits_json(conn: &Connection, enrollment_id: &str) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT tc.subject_id, s.code, s.name, tc.grade
         FROM transferee_credits tc
         JOIN subjects s ON s.id = tc.subject_id
         WHERE tc.enrollment_id = ?
         ORDER BY s.code",
    )?;
    let rows = stmt
        .query_map([enrollment_id], |r| {
            Ok(json!({
                "subjectId": r.get::<_, String>(0)?,
                "subjectCode": r.get::<_, String>(1)?,
                "subjectName": r.get::<_, String>(2)?,
                "grade": r.get::<_, Option<f64>>(3)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_get(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let id = required_str(&req.params, "enrollmentId")?;
    let loaded = load(ctx.conn, &id)?;
    ensure_visible(ctx, &loaded)?;
    Ok(json!({
        "enrollment": enrollment_json(ctx.conn, &id)?,
        "history": history_json(ctx.conn, &id)?,
        "credits": credits_json(ctx.conn, &id)?,
    }))
}

/// Checks the target section for an enroll and returns its id.
fn pick_section(conn: &Connection, req: &Request, loaded: &Loaded) -> Result<String, HandlerErr> {
    let section_id = optional_str(&req.params, "sectionId")?
        .or_else(|| loaded.section_id.clone())
        .ok_or_else(|| HandlerErr::bad_params("missing sectionId"))?;
    let (strand_id, grade_level, capacity): (String, i64, i64) = conn
        .query_row(
            "SELECT strand_id, grade_level, capacity FROM sections WHERE id = ?",
            [&section_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("section"))?;
    if strand_id != loaded.strand_id || grade_level != loaded.grade_level {
        return Err(HandlerErr::new(
            "section_mismatch",
            "section strand or grade level does not match the enrollment",
        ));
    }
    let enrolled: i64 = conn.query_row(
        "SELECT COUNT(*) FROM enrollments
         WHERE assigned_section_id = ? AND school_year_id = ? AND status = 'enrolled'",
        (&section_id, &loaded.school_year_id),
        |r| r.get(0),
    )?;
    if enrolled >= capacity {
        return Err(HandlerErr::new("capacity_full", "section is full")
            .with_details(json!({ "capacity": capacity, "enrolled": enrolled })));
    }
    Ok(section_id)
}

fn student_message(to: EnrollmentStatus, note: Option<&str>) -> String {
    let base = match to {
        EnrollmentStatus::Pending => "Your enrollment was resubmitted and is pending review.",
        EnrollmentStatus::Approved => "Your enrollment was approved.",
        EnrollmentStatus::Enrolled => "You are now officially enrolled.",
        EnrollmentStatus::Rejected => "Your enrollment was rejected.",
        EnrollmentStatus::Returned => "Your enrollment was returned for revision.",
    };
    match note {
        Some(n) if !n.trim().is_empty() => format!("{} Note: {}", base, n.trim()),
        _ => base.to_string(),
    }
}

fn transition(ctx: &Ctx, req: &Request, action: EnrollmentAction) -> Result<Value, HandlerErr> {
    let id = required_str(&req.params, "enrollmentId")?;
    let loaded = load(ctx.conn, &id)?;
    let note_key = match action {
        EnrollmentAction::Reject => "reason",
        _ => "remarks",
    };
    let note = optional_str(&req.params, note_key)?;
    let policy = setup::workflow_policy(ctx.conn)?;
    let to = plan_transition(action, &ctx.actor, &loaded.state, note.as_deref(), policy)?;

    // A resubmission may correct the requested strand or grade level.
    let (strand_id, grade_level) = match action {
        EnrollmentAction::Resubmit => (
            optional_str(&req.params, "strandId")?,
            optional_i64_range(&req.params, "gradeLevel", 11, 12)?,
        ),
        _ => (None, None),
    };
    let reviewed_by = (action != EnrollmentAction::Resubmit).then(|| ctx.actor.user_id.clone());
    let from = loaded.state.status;

    // Immediate, so the seat count below holds until commit.
    let tx = Transaction::new_unchecked(ctx.conn, TransactionBehavior::Immediate)
        .map_err(HandlerErr::db("db_tx_failed"))?;
    let section_id = match action {
        EnrollmentAction::Enroll => Some(pick_section(&tx, req, &loaded)?),
        _ => None,
    };
    let changed = tx
        .execute(
            "UPDATE enrollments SET
                status = ?1,
                remarks = COALESCE(?2, remarks),
                reviewed_by = COALESCE(?3, reviewed_by),
                assigned_section_id = COALESCE(?4, assigned_section_id),
                strand_id = COALESCE(?5, strand_id),
                grade_level = COALESCE(?6, grade_level),
                updated_at = ?7
             WHERE id = ?8 AND status = ?9",
            rusqlite::params![
                to.as_str(),
                note,
                reviewed_by,
                section_id,
                strand_id,
                grade_level,
                db::now_utc(),
                id,
                from.as_str(),
            ],
        )
        .map_err(HandlerErr::db("db_update_failed"))?;
    if changed == 0 {
        return Err(HandlerErr::new(
            "conflict",
            "enrollment was changed by someone else; reload and retry",
        ));
    }

    let mut classes_linked = 0;
    if let Some(section_id) = &section_id {
        classes_linked = tx
            .execute(
                "INSERT OR IGNORE INTO class_details(id, enrollment_id, class_id, created_at)
                 SELECT lower(hex(randomblob(16))), ?1, c.id, ?2
                 FROM classes c
                 JOIN faculty_loads fl ON fl.id = c.faculty_load_id
                 WHERE fl.section_id = ?3 AND fl.school_year_id = ?4",
                (&id, db::now_utc(), section_id, &loaded.school_year_id),
            )
            .map_err(HandlerErr::db("db_insert_failed"))?;
    }
    insert_history(
        &tx,
        &id,
        Some(from.as_str()),
        to.as_str(),
        &ctx.actor.user_id,
        note.as_deref(),
    )?;
    notify(
        &tx,
        &loaded.state.student_id,
        "enrollment",
        &student_message(to, note.as_deref()),
        Some(&id),
    )?;
    tx.commit().map_err(HandlerErr::db("db_tx_failed"))?;

    tracing::info!(
        enrollment_id = %id,
        action = action.as_str(),
        from = from.as_str(),
        to = to.as_str(),
        by = %ctx.actor.username,
        "enrollment transition"
    );
    Ok(json!({
        "enrollment": enrollment_json(ctx.conn, &id)?,
        "classesLinked": classes_linked,
    }))
}

fn handle_approve(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    transition(ctx, req, EnrollmentAction::Approve)
}

fn handle_enroll(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    transition(ctx, req, EnrollmentAction::Enroll)
}

fn handle_reject(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    transition(ctx, req, EnrollmentAction::Reject)
}

fn handle_return(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    transition(ctx, req, EnrollmentAction::Return)
}

fn handle_resubmit(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    transition(ctx, req, EnrollmentAction::Resubmit)
}

struct Credit {
    subject_id: String,
    grade: Option<f64>,
}

fn parse_credits(params: &Value) -> Result<Vec<Credit>, HandlerErr> {
    let Some(raw) = params.get("credits") else {
        return Ok(Vec::new());
    };
    if raw.is_null() {
        return Ok(Vec::new());
    }
    let items = raw
        .as_array()
        .ok_or_else(|| HandlerErr::bad_params("credits must be an array"))?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let subject_id = required_str(item, "subjectId")?;
        let grade = optional_f64(item, "grade")?;
        if let Some(g) = grade {
            if !(0.0..=100.0).contains(&g) {
                return Err(HandlerErr::bad_params("credit grade must be in 0..=100"));
            }
        }
        out.push(Credit { subject_id, grade });
    }
    Ok(out)
}

fn handle_evaluate_transferee(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let id = required_str(&req.params, "enrollmentId")?;
    let decision = required_str(&req.params, "decision")?;
    let decision = EvaluationStatus::parse(&decision)
        .ok_or_else(|| HandlerErr::bad_params("decision must be approved or rejected"))?;
    let remarks = optional_str(&req.params, "remarks")?;
    let credits = parse_credits(&req.params)?;
    if decision == EvaluationStatus::Rejected && !credits.is_empty() {
        return Err(HandlerErr::bad_params("a rejected evaluation credits no subjects"));
    }

    let loaded = load(ctx.conn, &id)?;
    plan_evaluation(&ctx.actor, &loaded.state, decision)?;

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    let changed = tx
        .execute(
            "UPDATE enrollments SET evaluation_status = ?1, reviewed_by = ?2, updated_at = ?3
             WHERE id = ?4 AND status = ?5
               AND COALESCE(evaluation_status, 'evaluation_pending') = 'evaluation_pending'",
            (
                decision.as_str(),
                &ctx.actor.user_id,
                db::now_utc(),
                &id,
                loaded.state.status.as_str(),
            ),
        )
        .map_err(HandlerErr::db("db_update_failed"))?;
    if changed == 0 {
        return Err(HandlerErr::new(
            "conflict",
            "enrollment was changed by someone else; reload and retry",
        ));
    }
    for c in &credits {
        tx.execute(
            "INSERT INTO transferee_credits(id, enrollment_id, subject_id, grade)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(enrollment_id, subject_id) DO UPDATE SET grade = excluded.grade",
            (new_id(), &id, &c.subject_id, c.grade),
        )
        .map_err(HandlerErr::db("db_insert_failed"))?;
    }
    insert_history(
        &tx,
        &id,
        Some(EvaluationStatus::Pending.as_str()),
        decision.as_str(),
        &ctx.actor.user_id,
        remarks.as_deref(),
    )?;
    let message = match decision {
        EvaluationStatus::Approved => format!(
            "Your transferee evaluation was approved with {} credited subject(s).",
            credits.len()
        ),
        _ => "Your transferee evaluation was not approved.".to_string(),
    };
    notify(&tx, &loaded.state.student_id, "evaluation", &message, Some(&id))?;
    tx.commit().map_err(HandlerErr::db("db_tx_failed"))?;

    Ok(json!({
        "enrollment": enrollment_json(ctx.conn, &id)?,
        "credits": credits_json(ctx.conn, &id)?,
    }))
}

/// Class rows linked to an enrollment. Students may omit the id to get the
/// schedule of their enrollment in the active school year.
pub fn schedule_rows(conn: &Connection, enrollment_id: &str) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn.prepare(&format!(
        "{} JOIN class_details cd ON cd.class_id = c.id WHERE cd.enrollment_id = ? {}",
        SELECT_CLASS, CLASS_ORDER
    ))?;
    let rows = stmt
        .query_map([enrollment_id], class_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_schedule(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let id = match optional_str(&req.params, "enrollmentId")? {
        Some(id) => id,
        None if ctx.actor.role == Role::Student => {
            let sy = school_year_param(ctx.conn, &req.params)?;
            ctx.conn
                .query_row(
                    "SELECT id FROM enrollments WHERE student_id = ? AND school_year_id = ?",
                    (&ctx.actor.user_id, &sy),
                    |r| r.get(0),
                )
                .optional()?
                .ok_or_else(|| HandlerErr::not_found("enrollment"))?
        }
        None => return Err(HandlerErr::bad_params("missing enrollmentId")),
    };
    let loaded = load(ctx.conn, &id)?;
    ensure_visible(ctx, &loaded)?;
    Ok(json!({
        "enrollmentId": id,
        "status": loaded.state.status.as_str(),
        "classes": schedule_rows(ctx.conn, &id)?,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let resp = match req.method.as_str() {
        "enrollments.submit" => run_authed(state, req, STUDENT, handle_submit),
        "enrollments.list" => run_authed(state, req, ANYONE, handle_list),
        "enrollments.get" => run_authed(state, req, ANYONE, handle_get),
        "enrollments.approve" => run_authed(state, req, REVIEWERS, handle_approve),
        "enrollments.enroll" => run_authed(state, req, REVIEWERS, handle_enroll),
        "enrollments.reject" => run_authed(state, req, REVIEWERS, handle_reject),
        "enrollments.return" => run_authed(state, req, REVIEWERS, handle_return),
        "enrollments.resubmit" => run_authed(state, req, STUDENT, handle_resubmit),
        "enrollments.evaluateTransferee" => {
            run_authed(state, req, REVIEWERS, handle_evaluate_transferee)
        }
        "enrollments.schedule" => run_authed(state, req, ANYONE, handle_schedule),
        _ => return None,
    };
    Some(resp)
}
