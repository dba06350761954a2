use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{optional_bool, optional_i64_range, run_authed, Ctx, ANYONE};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};

fn handle_list(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let unread_only = optional_bool(&req.params, "unreadOnly")?.unwrap_or(false);
    let limit = optional_i64_range(&req.params, "limit", 1, 500)?.unwrap_or(50);
    let mut stmt = ctx.conn.prepare(
        "SELECT id, kind, message, ref_id, created_at, read_at
         FROM notifications
         WHERE user_id = ?1 AND (?2 = 0 OR read_at IS NULL)
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?3",
    )?;
    let rows = stmt
        .query_map((&ctx.actor.user_id, unread_only as i64, limit), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "kind": r.get::<_, String>(1)?,
                "message": r.get::<_, String>(2)?,
                "refId": r.get::<_, Option<String>>(3)?,
                "createdAt": r.get::<_, String>(4)?,
                "readAt": r.get::<_, Option<String>>(5)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let unread: i64 = ctx.conn.query_row(
        "SELECT COUNT(*) FROM notifications WHERE user_id = ? AND read_at IS NULL",
        [&ctx.actor.user_id],
        |r| r.get(0),
    )?;
    Ok(json!({ "notifications": rows, "unread": unread }))
}

/// Marks the listed ids read, or everything when `ids` is absent.
fn handle_mark_read(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let now = db::now_utc();
    let changed = match req.params.get("ids") {
        None | Some(Value::Null) => ctx
            .conn
            .execute(
                "UPDATE notifications SET read_at = ? WHERE user_id = ? AND read_at IS NULL",
                (&now, &ctx.actor.user_id),
            )
            .map_err(HandlerErr::db("db_update_failed"))?,
        Some(Value::Array(ids)) => {
            let mut n = 0;
            for id in ids {
                let id = id
                    .as_str()
                    .ok_or_else(|| HandlerErr::bad_params("ids must be strings"))?;
                // Scoped to the caller so one user cannot touch another's inbox.
                n += ctx
                    .conn
                    .execute(
                        "UPDATE notifications SET read_at = ?
                         WHERE id = ? AND user_id = ? AND read_at IS NULL",
                        (&now, id, &ctx.actor.user_id),
                    )
                    .map_err(HandlerErr::db("db_update_failed"))?;
            }
            n
        }
        Some(_) => return Err(HandlerErr::bad_params("ids must be an array")),
    };
    Ok(json!({ "marked": changed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let resp = match req.method.as_str() {
        "notifications.list" => run_authed(state, req, ANYONE, handle_list),
        "notifications.markRead" => run_authed(state, req, ANYONE, handle_mark_read),
        _ => return None,
    };
    Some(resp)
}
