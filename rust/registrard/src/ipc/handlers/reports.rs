use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::faculty::load_keys;
use crate::ipc::helpers::{
    csv_quote, optional_str, required_str, run_authed, school_year_param, write_text_file, Ctx,
    REVIEWERS, STAFF,
};
use crate::ipc::types::{AppState, Request};
use crate::workflow::EnrollmentStatus;
use chrono::NaiveTime;
use rusqlite::OptionalExtension;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

fn csv_line(fields: &[String]) -> String {
    let mut line = fields
        .iter()
        .map(|f| csv_quote(f))
        .collect::<Vec<_>>()
        .join(",");
    line.push('\n');
    line
}

/// Returns the CSV inline and, when `outPath` is given, also writes it.
fn export_csv(req: &Request, csv: String, rows: usize) -> Result<Value, HandlerErr> {
    let out_path = optional_str(&req.params, "outPath")?;
    if let Some(path) = &out_path {
        write_text_file(path, &csv)?;
    }
    Ok(json!({
        "rowsExported": rows,
        "path": out_path,
        "csv": csv,
    }))
}

fn handle_enrollment_summary(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let sy = school_year_param(ctx.conn, &req.params)?;

    let mut by_status = Map::new();
    for status in EnrollmentStatus::ALL {
        by_status.insert(status.as_str().to_string(), json!(0));
    }
    let mut stmt = ctx.conn.prepare(
        "SELECT status, COUNT(*) FROM enrollments WHERE school_year_id = ? GROUP BY status",
    )?;
    let mut total = 0i64;
    for row in stmt.query_map([&sy], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))? {
        let (status, n) = row?;
        total += n;
        by_status.insert(status, json!(n));
    }

    let mut stmt = ctx.conn.prepare(
        "SELECT st.code, e.grade_level,
                SUM(CASE WHEN e.status = 'enrolled' THEN 1 ELSE 0 END),
                SUM(CASE WHEN e.status IN ('pending', 'approved', 'returned') THEN 1 ELSE 0 END),
                SUM(CASE WHEN e.is_transferee = 1 THEN 1 ELSE 0 END)
         FROM enrollments e
         JOIN strands st ON st.id = e.strand_id
         WHERE e.school_year_id = ?
         GROUP BY st.code, e.grade_level
         ORDER BY st.code, e.grade_level",
    )?;
    let by_strand = stmt
        .query_map([&sy], |r| {
            Ok(json!({
                "strandCode": r.get::<_, String>(0)?,
                "gradeLevel": r.get::<_, i64>(1)?,
                "enrolled": r.get::<_, i64>(2)?,
                "inProcess": r.get::<_, i64>(3)?,
                "transferees": r.get::<_, i64>(4)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = ctx.conn.prepare(
        "SELECT sec.id, sec.name, st.code, sec.grade_level, sec.capacity,
                (SELECT COUNT(*) FROM enrollments e
                 WHERE e.assigned_section_id = sec.id AND e.school_year_id = ?1
                   AND e.status = 'enrolled')
         FROM sections sec
         JOIN strands st ON st.id = sec.strand_id
         ORDER BY st.code, sec.grade_level, sec.name",
    )?;
    let sections = stmt
        .query_map([&sy], |r| {
            let capacity: i64 = r.get(4)?;
            let enrolled: i64 = r.get(5)?;
            Ok(json!({
                "sectionId": r.get::<_, String>(0)?,
                "sectionName": r.get::<_, String>(1)?,
                "strandCode": r.get::<_, String>(2)?,
                "gradeLevel": r.get::<_, i64>(3)?,
                "capacity": capacity,
                "enrolled": enrolled,
                "available": (capacity - enrolled).max(0),
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({
        "schoolYearId": sy,
        "total": total,
        "byStatus": by_status,
        "byStrand": by_strand,
        "sections": sections,
    }))
}

fn handle_section_roster(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let section_id = required_str(&req.params, "sectionId")?;
    let sy = school_year_param(ctx.conn, &req.params)?;
    let section: Option<(String, String, i64)> = ctx
        .conn
        .query_row(
            "SELECT sec.name, st.code, sec.grade_level
             FROM sections sec JOIN strands st ON st.id = sec.strand_id
             WHERE sec.id = ?",
            [&section_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((section_name, strand_code, grade_level)) = section else {
        return Err(HandlerErr::not_found("section"));
    };

    let mut stmt = ctx.conn.prepare(
        "SELECT COALESCE(spi.lrn, ''), COALESCE(spi.last_name, u.full_name),
                COALESCE(spi.first_name, ''), COALESCE(spi.middle_name, ''),
                COALESCE(spi.sex, ''), e.is_transferee
         FROM enrollments e
         JOIN users u ON u.id = e.student_id
         LEFT JOIN student_personal_info spi ON spi.user_id = e.student_id
         WHERE e.assigned_section_id = ? AND e.school_year_id = ? AND e.status = 'enrolled'
         ORDER BY COALESCE(spi.sex, ''), 2, 3",
    )?;
    let rows = stmt
        .query_map((&section_id, &sy), |r| {
            Ok(vec![
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                (if r.get::<_, i64>(5)? != 0 { "transferee" } else { "regular" }).to_string(),
            ])
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut csv = String::from("no,lrn,last_name,first_name,middle_name,sex,strand,grade_level,section,type\n");
    for (i, r) in rows.iter().enumerate() {
        csv.push_str(&csv_line(&[
            (i + 1).to_string(),
            r[0].clone(),
            r[1].clone(),
            r[2].clone(),
            r[3].clone(),
            r[4].clone(),
            strand_code.clone(),
            grade_level.to_string(),
            section_name.clone(),
            r[5].clone(),
        ]));
    }
    export_csv(req, csv, rows.len())
}

fn fmt_opt_num(v: Option<f64>) -> String {
    match v {
        Some(n) if n.fract() == 0.0 => format!("{}", n as i64),
        Some(n) => format!("{:.2}", n),
        None => String::new(),
    }
}

fn handle_grade_sheet(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let load_id = required_str(&req.params, "facultyLoadId")?;
    let (faculty_id, subject_id, section_id, sy) = load_keys(ctx.conn, &load_id)?;
    if !ctx.actor.is_reviewer() && faculty_id != ctx.actor.user_id {
        return Err(HandlerErr::forbidden("this faculty load belongs to someone else"));
    }
    let mut stmt = ctx.conn.prepare(
        "SELECT COALESCE(spi.lrn, ''),
                COALESCE(spi.last_name || ', ' || spi.first_name, u.full_name),
                g.q1, g.q2, g.semester_grade, COALESCE(g.remarks, ''), COALESCE(g.status, 'draft')
         FROM enrollments e
         JOIN users u ON u.id = e.student_id
         LEFT JOIN student_personal_info spi ON spi.user_id = e.student_id
         LEFT JOIN grades g
           ON g.student_id = e.student_id AND g.subject_id = ?3 AND g.school_year_id = e.school_year_id
         WHERE e.assigned_section_id = ?1 AND e.school_year_id = ?2 AND e.status = 'enrolled'
         ORDER BY 2",
    )?;
    let rows = stmt
        .query_map((&section_id, &sy, &subject_id), |r| {
            Ok(vec![
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                fmt_opt_num(r.get(2)?),
                fmt_opt_num(r.get(3)?),
                r.get::<_, Option<i64>>(4)?.map(|g| g.to_string()).unwrap_or_default(),
                r.get::<_, String>(5)?,
                r.get::<_, String>(6)?,
            ])
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut csv = String::from("lrn,student_name,q1,q2,semester_grade,remarks,status\n");
    for r in &rows {
        csv.push_str(&csv_line(r));
    }
    export_csv(req, csv, rows.len())
}

/// Minutes between two `HH:MM` strings; 0 when either is malformed.
fn minutes_between(start: &str, end: &str) -> i64 {
    match (
        NaiveTime::parse_from_str(start, "%H:%M"),
        NaiveTime::parse_from_str(end, "%H:%M"),
    ) {
        (Ok(s), Ok(e)) if e > s => (e - s).num_minutes(),
        _ => 0,
    }
}

#[derive(Default)]
struct FacultyTotals {
    name: String,
    loads: i64,
    hours: i64,
    weekly_minutes: i64,
    subjects: Vec<String>,
    sections: Vec<String>,
}

fn handle_faculty_load_summary(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let sy = school_year_param(ctx.conn, &req.params)?;
    let mut stmt = ctx.conn.prepare(
        "SELECT u.id, u.full_name, fl.id, sub.code, sub.hours, sec.name
         FROM faculty_loads fl
         JOIN users u ON u.id = fl.faculty_id
         JOIN subjects sub ON sub.id = fl.subject_id
         JOIN sections sec ON sec.id = fl.section_id
         WHERE fl.school_year_id = ?
         ORDER BY u.full_name, sub.code",
    )?;
    let loads = stmt
        .query_map([&sy], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)?,
                r.get::<_, String>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut classes = ctx
        .conn
        .prepare("SELECT start_time, end_time FROM classes WHERE faculty_load_id = ?")?;
    let mut totals: BTreeMap<String, FacultyTotals> = BTreeMap::new();
    for (faculty_id, name, load_id, subject_code, hours, section) in loads {
        let minutes: i64 = classes
            .query_map([&load_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?
            .iter()
            .map(|(s, e)| minutes_between(s, e))
            .sum();
        let t = totals.entry(faculty_id).or_default();
        t.name = name;
        t.loads += 1;
        t.hours += hours;
        t.weekly_minutes += minutes;
        if !t.subjects.contains(&subject_code) {
            t.subjects.push(subject_code);
        }
        if !t.sections.contains(&section) {
            t.sections.push(section);
        }
    }

    let mut faculty: Vec<Value> = totals
        .into_iter()
        .map(|(id, t)| {
            json!({
                "facultyId": id,
                "facultyName": t.name,
                "loadCount": t.loads,
                "totalHours": t.hours,
                "weeklyMinutes": t.weekly_minutes,
                "subjects": t.subjects,
                "sections": t.sections,
            })
        })
        .collect();
    faculty.sort_by(|a, b| {
        a["facultyName"]
            .as_str()
            .unwrap_or("")
            .cmp(b["facultyName"].as_str().unwrap_or(""))
    });
    Ok(json!({ "schoolYearId": sy, "faculty": faculty }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let resp = match req.method.as_str() {
        "reports.enrollmentSummary" => run_authed(state, req, REVIEWERS, handle_enrollment_summary),
        "reports.sectionRoster" => run_authed(state, req, STAFF, handle_section_roster),
        "reports.gradeSheet" => run_authed(state, req, STAFF, handle_grade_sheet),
        "reports.facultyLoadSummary" => {
            run_authed(state, req, REVIEWERS, handle_faculty_load_summary)
        }
        _ => return None,
    };
    Some(resp)
}
