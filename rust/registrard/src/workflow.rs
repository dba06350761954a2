//! Enrollment lifecycle.
//!
//! ```text
//! submit ──► pending ──approve──► approved
//!              │  ▲                 │
//!              │  └──resubmit── returned ◄──return── (pending | approved)
//!              ├──enroll──► enrolled ◄──enroll── approved
//!              └──reject──► rejected ◄──reject── (approved | returned)
//! ```
//!
//! Transferees additionally carry an evaluation status which must reach
//! `evaluation_approved` before the enrollment can become `enrolled`.

use crate::auth::{Actor, Role};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentStatus {
    Pending,
    Approved,
    Rejected,
    Enrolled,
    Returned,
}

impl EnrollmentStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "enrolled" => Some(Self::Enrolled),
            "returned" => Some(Self::Returned),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Enrolled => "enrolled",
            Self::Returned => "returned",
        }
    }

    pub fn is_final(self) -> bool {
        matches!(self, Self::Rejected | Self::Enrolled)
    }

    pub const ALL: [EnrollmentStatus; 5] = [
        Self::Pending,
        Self::Approved,
        Self::Rejected,
        Self::Enrolled,
        Self::Returned,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationStatus {
    Pending,
    Approved,
    Rejected,
}

impl EvaluationStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "evaluation_pending" | "pending" => Some(Self::Pending),
            "evaluation_approved" | "approved" => Some(Self::Approved),
            "evaluation_rejected" | "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "evaluation_pending",
            Self::Approved => "evaluation_approved",
            Self::Rejected => "evaluation_rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentAction {
    Approve,
    Enroll,
    Reject,
    Return,
    Resubmit,
}

impl EnrollmentAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Enroll => "enroll",
            Self::Reject => "reject",
            Self::Return => "return",
            Self::Resubmit => "resubmit",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("cannot {action} an enrollment that is {from}")]
    IllegalTransition {
        action: &'static str,
        from: &'static str,
    },
    #[error("{role} may not {action} this enrollment")]
    Forbidden {
        action: &'static str,
        role: &'static str,
    },
    #[error("transferee evaluation must be approved before enrollment")]
    EvaluationRequired,
    #[error("transferee evaluation is already {0}")]
    EvaluationDecided(&'static str),
    #[error("enrollment is not a transferee")]
    NotTransferee,
    #[error("{0} must not be empty")]
    MissingNote(&'static str),
}

impl WorkflowError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::IllegalTransition { .. } | Self::EvaluationDecided(_) => "illegal_transition",
            Self::EvaluationRequired => "evaluation_required",
            Self::Forbidden { .. } => "forbidden",
            Self::NotTransferee | Self::MissingNote(_) => "bad_params",
        }
    }
}

/// Workflow-relevant columns of one enrollment row.
#[derive(Debug, Clone)]
pub struct EnrollmentState {
    pub student_id: String,
    pub status: EnrollmentStatus,
    pub is_transferee: bool,
    pub evaluation: Option<EvaluationStatus>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkflowPolicy {
    pub require_approval_before_enroll: bool,
}

/// The transition table, with no role or guard checks.
pub fn next_status(
    action: EnrollmentAction,
    from: EnrollmentStatus,
    policy: WorkflowPolicy,
) -> Result<EnrollmentStatus, WorkflowError> {
    use EnrollmentAction as A;
    use EnrollmentStatus as S;
    let to = match (action, from) {
        (A::Approve, S::Pending) => Some(S::Approved),
        (A::Enroll, S::Approved) => Some(S::Enrolled),
        (A::Enroll, S::Pending) if !policy.require_approval_before_enroll => Some(S::Enrolled),
        (A::Reject, S::Pending | S::Approved | S::Returned) => Some(S::Rejected),
        (A::Return, S::Pending | S::Approved) => Some(S::Returned),
        (A::Resubmit, S::Returned) => Some(S::Pending),
        _ => None,
    };
    to.ok_or(WorkflowError::IllegalTransition {
        action: action.as_str(),
        from: from.as_str(),
    })
}

fn authorize(
    action: EnrollmentAction,
    actor: &Actor,
    state: &EnrollmentState,
) -> Result<(), WorkflowError> {
    let allowed = match action {
        EnrollmentAction::Resubmit => {
            actor.role == Role::Student && actor.user_id == state.student_id
        }
        _ => actor.is_reviewer(),
    };
    if allowed {
        Ok(())
    } else {
        Err(WorkflowError::Forbidden {
            action: action.as_str(),
            role: actor.role.as_str(),
        })
    }
}

/// Validates `action` against the actor, the current row and any note the
/// caller supplied. Returns the status the row must move to.
pub fn plan_transition(
    action: EnrollmentAction,
    actor: &Actor,
    state: &EnrollmentState,
    note: Option<&str>,
    policy: WorkflowPolicy,
) -> Result<EnrollmentStatus, WorkflowError> {
    authorize(action, actor, state)?;
    let to = next_status(action, state.status, policy)?;

    let note_blank = note.map(|n| n.trim().is_empty()).unwrap_or(true);
    match action {
        EnrollmentAction::Reject if note_blank => return Err(WorkflowError::MissingNote("reason")),
        EnrollmentAction::Return if note_blank => return Err(WorkflowError::MissingNote("remarks")),
        EnrollmentAction::Enroll
            if state.is_transferee && state.evaluation != Some(EvaluationStatus::Approved) =>
        {
            return Err(WorkflowError::EvaluationRequired)
        }
        _ => {}
    }
    Ok(to)
}

/// Checks a transferee evaluation decision. `decision` must be approved or
/// rejected; the enrollment itself must still be open.
pub fn plan_evaluation(
    actor: &Actor,
    state: &EnrollmentState,
    decision: EvaluationStatus,
) -> Result<(), WorkflowError> {
    if !actor.is_reviewer() {
        return Err(WorkflowError::Forbidden {
            action: "evaluate",
            role: actor.role.as_str(),
        });
    }
    if !state.is_transferee {
        return Err(WorkflowError::NotTransferee);
    }
    if state.status.is_final() {
        return Err(WorkflowError::IllegalTransition {
            action: "evaluate",
            from: state.status.as_str(),
        });
    }
    match state.evaluation {
        Some(EvaluationStatus::Approved) | Some(EvaluationStatus::Rejected) => {
            let decided = state.evaluation.map(|e| e.as_str()).unwrap_or("decided");
            return Err(WorkflowError::EvaluationDecided(decided));
        }
        _ => {}
    }
    if decision == EvaluationStatus::Pending {
        return Err(WorkflowError::IllegalTransition {
            action: "evaluate",
            from: EvaluationStatus::Pending.as_str(),
        });
    }
    Ok(())
}
