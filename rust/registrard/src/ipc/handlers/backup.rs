use crate::backup;
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{authorize, finish, required_str, run_authed, Ctx, REGISTRAR};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};
use std::path::PathBuf;

fn handle_export(ctx: &Ctx, req: &Request) -> Result<Value, HandlerErr> {
    let out = PathBuf::from(required_str(&req.params, "outPath")?);
    let workspace = ctx
        .workspace
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let summary = backup::export_workspace_bundle(workspace, &out)
        .map_err(|e| HandlerErr::new("export_failed", format!("{e:#}")))?;
    tracing::info!(path = %out.display(), by = %ctx.actor.username, "workspace exported");
    Ok(json!({
        "path": out.to_string_lossy(),
        "bundleFormat": summary.bundle_format,
        "dbSha256": summary.db_sha256,
        "dbBytes": summary.db_bytes,
    }))
}

/// Replaces the open workspace's database. The connection is closed for the
/// swap and reopened afterwards, migrating the restored file if needed.
fn import(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = authorize(state, req, REGISTRAR)?;
    let src = PathBuf::from(required_str(&req.params, "inPath")?);
    let workspace = state
        .workspace
        .clone()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;

    state.db = None;
    let imported = backup::import_workspace_bundle(&src, &workspace);
    let reopened = db::open_db(&workspace);
    let conn = match reopened {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!(workspace = %workspace.display(), error = %e, "failed to reopen workspace after import");
            return Err(HandlerErr::new("db_open_failed", format!("{e:#}")));
        }
    };
    state.db = Some(conn);
    let summary = imported.map_err(|e| HandlerErr::new("import_failed", format!("{e:#}")))?;
    tracing::info!(path = %src.display(), by = %actor.username, format = %summary.bundle_format_detected, "workspace imported");
    Ok(json!({
        "bundleFormatDetected": summary.bundle_format_detected,
        "dbSha256": summary.db_sha256,
        "workspacePath": workspace.to_string_lossy(),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "backup.exportWorkspace" => Some(run_authed(state, req, REGISTRAR, handle_export)),
        "backup.importWorkspace" => {
            let result = import(state, req);
            Some(finish(req, result))
        }
        _ => None,
    }
}
