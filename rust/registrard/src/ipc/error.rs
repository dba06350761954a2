use crate::auth::AuthError;
use crate::grading::GradeError;
use crate::workflow::WorkflowError;
use rusqlite::ffi;
use serde_json::{json, Value};

pub fn ok(id: &str, result: Value) -> Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(id: &str, code: &str, message: impl Into<String>, details: Option<Value>) -> Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

#[derive(Debug)]
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(what: &str) -> Self {
        Self::new("not_found", format!("{} not found", what))
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new("forbidden", message)
    }

    /// Maps a database error to `code`, except constraint violations, which
    /// get their own codes so callers can tell bad input from broken storage.
    pub fn db(code: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
        move |e| {
            if let rusqlite::Error::SqliteFailure(f, _) = &e {
                match f.extended_code {
                    ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                        return HandlerErr::new("duplicate", e.to_string());
                    }
                    ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                        return HandlerErr::new("bad_reference", e.to_string());
                    }
                    _ => {}
                }
            }
            tracing::warn!(code, error = %e, "database error");
            HandlerErr::new(code, e.to_string())
        }
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        HandlerErr::db("db_query_failed")(e)
    }
}

impl From<anyhow::Error> for HandlerErr {
    fn from(e: anyhow::Error) -> Self {
        tracing::warn!(error = %e, "internal error");
        HandlerErr::new("internal_error", e.to_string())
    }
}

impl From<WorkflowError> for HandlerErr {
    fn from(e: WorkflowError) -> Self {
        HandlerErr::new(e.code(), e.to_string())
    }
}

impl From<GradeError> for HandlerErr {
    fn from(e: GradeError) -> Self {
        HandlerErr::new(e.code(), e.to_string())
    }
}

impl From<AuthError> for HandlerErr {
    fn from(e: AuthError) -> Self {
        HandlerErr::new(e.code(), e.to_string())
    }
}
