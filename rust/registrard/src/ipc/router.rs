use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;
use serde_json::Value;

type TryHandle = fn(&mut AppState, &Request) -> Option<Value>;

/// Handlers are asked in order; the first to claim the method answers.
const HANDLERS: &[TryHandle] = &[
    handlers::core::try_handle,
    handlers::setup::try_handle,
    handlers::auth::try_handle,
    handlers::school_years::try_handle,
    handlers::catalog::try_handle,
    handlers::faculty::try_handle,
    handlers::students::try_handle,
    handlers::enrollments::try_handle,
    handlers::grades::try_handle,
    handlers::cor::try_handle,
    handlers::reports::try_handle,
    handlers::notifications::try_handle,
    handlers::backup::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> Value {
    tracing::debug!(id = %req.id, method = %req.method, "request");
    for try_handle in HANDLERS {
        if let Some(resp) = try_handle(state, &req) {
            return resp;
        }
    }
    tracing::warn!(method = %req.method, "unknown method");
    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
