use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    new_id, optional_str, required_i64_range, required_str, run_authed, Ctx, ANYONE, REGISTRAR,
};
use crate::ipc::types::{AppState, Request};
use chrono::{Local, NaiveDate};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};

const SELECT_SCHOOL_YEAR: &str =
    "SELECT id, year_start, year_end, semester, start_date, end_date, is_active FROM school_years";

fn row_to_json(r: &Row) -> rusqlite::Result<Value> {
    let year_start: i64 = r.get(1)?;
    let year_end: i64 = r.get(2)?;
    let semester: i64 = r.get(3)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "yearStart": year_start,
        "yearEnd": year_end,
        "semester": semester,
        "label": format!("S.Y. {}-{}, {} Semester", year_start, year_end, if semester == 1 { "1st" } else { "2nd" }),
        "startDate": r.get::<_, Option<String>>(4)?,
        "endDate": r.get::<_, Option<String>>(5)?,
        "isActive": r.get::<_, i64>(6)? != 0,
    }))
}

pub fn school_year_json(conn: &Connection, id: &str) -> Result<Value, HandlerErr> {
    conn.query_row(&format!("{} WHERE id = ?", SELECT_SCHOOL_YEAR), [id], row_to_json)
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("school year"))
}

fn parse_date(params: &Value, key: &str) -> Result<Option<NaiveDate>, HandlerErr> {
    match optional_str(params, key)? {
        None => Ok(None),
        Some(s) => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key))),
    }
}

fn handle_list(ctx: &Ctx, _req: &Request) -> Result<Value, HandlerErr> {
    let mut stmt = ctx.conn.prepare(&format!(
        "{} ORDER BY year_start DESC, semester DESC",
        SELECT_SCHOOL_YEAR
    ))?;
    let rows = stmt
        .query_map([], row_to_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "schoolYears": rows }))
}

fn handle_active(ctx: &Ctx, _req: &Request) -> Result<Value, HandlerErr> {
    let row = ctx
        .conn
        .query_row(
            &format!("{} WHERE is_active = 1", SELECT_SCHOOL_YEAR),
            [],
            row_to_json,
        )
        .optional()?;
    Ok(json!({ "schoolYear": row }))
}

fn handle_create(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let year_start = required_i64_range(&req.params, "yearStart", 2000, 2100)?;
    let semester = required_i64_range(&req.params, "semester", 1, 2)?;
    let start_date = parse_date(&req.params, "startDate")?;
    let end_date = parse_date(&req.params, "endDate")?;
    if let (Some(s), Some(e)) = (start_date, end_date) {
        if e < s {
            return Err(HandlerErr::bad_params("endDate must not be before startDate"));
        }
    }
    let id = new_id();
    let fmt = |d: Option<NaiveDate>| d.map(|d| d.format("%Y-%m-%d").to_string());
    ctx.conn
        .execute(
            "INSERT INTO school_years(id, year_start, year_end, semester, start_date, end_date, is_active, created_at)
             VALUES(?, ?, ?, ?, ?, ?, 0, ?)",
            (
                &id,
                year_start,
                year_start + 1,
                semester,
                fmt(start_date),
                fmt(end_date),
                db::now_utc(),
            ),
        )
        .map_err(HandlerErr::db("db_insert_failed"))?;
    Ok(json!({ "schoolYear": school_year_json(ctx.conn, &id)? }))
}

fn handle_activate(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let id = required_str(&req.params, "schoolYearId")?;
    school_year_json(ctx.conn, &id)?;

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(HandlerErr::db("db_tx_failed"))?;
    tx.execute("UPDATE school_years SET is_active = 0 WHERE is_active = 1", [])
        .map_err(HandlerErr::db("db_update_failed"))?;
    tx.execute("UPDATE school_years SET is_active = 1 WHERE id = ?", [&id])
        .map_err(HandlerErr::db("db_update_failed"))?;
    tx.commit().map_err(HandlerErr::db("db_tx_failed"))?;
    tracing::info!(school_year_id = %id, by = %ctx.actor.username, "school year activated");
    Ok(json!({ "schoolYear": school_year_json(ctx.conn, &id)? }))
}

fn handle_deactivate_expired(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let today = parse_date(&req.params, "today")?.unwrap_or_else(|| Local::now().date_naive());
    let ids = db::deactivate_expired_school_years(ctx.conn, today)?;
    Ok(json!({ "deactivated": ids }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let resp = match req.method.as_str() {
        "schoolYears.list" => run_authed(state, req, ANYONE, handle_list),
        "schoolYears.active" => run_authed(state, req, ANYONE, handle_active),
        "schoolYears.create" => run_authed(state, req, REGISTRAR, handle_create),
        "schoolYears.activate" => run_authed(state, req, REGISTRAR, handle_activate),
        "schoolYears.deactivateExpired" => {
            run_authed(state, req, REGISTRAR, handle_deactivate_expired)
        }
        _ => return None,
    };
    Some(resp)
}
