use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradeStatus {
    Draft,
    Submitted,
    Approved,
    Returned,
}

impl GradeStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(Self::Draft),
            "submitted" => Some(Self::Submitted),
            "approved" => Some(Self::Approved),
            "returned" => Some(Self::Returned),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::Approved => "approved",
            Self::Returned => "returned",
        }
    }

    pub fn is_editable(self) -> bool {
        matches!(self, Self::Draft | Self::Returned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradeAction {
    Submit,
    Approve,
    Return,
}

impl GradeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::Approve => "approve",
            Self::Return => "return",
        }
    }

    /// Statuses a row must be in for this action to touch it.
    pub fn sources(self) -> &'static [GradeStatus] {
        match self {
            Self::Submit => &[GradeStatus::Draft, GradeStatus::Returned],
            Self::Approve | Self::Return => &[GradeStatus::Submitted],
        }
    }

    pub fn target(self) -> GradeStatus {
        match self {
            Self::Submit => GradeStatus::Submitted,
            Self::Approve => GradeStatus::Approved,
            Self::Return => GradeStatus::Returned,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum GradeError {
    #[error("cannot {action} a grade that is {from}")]
    IllegalTransition {
        action: &'static str,
        from: &'static str,
    },
    #[error("grade is {0} and can no longer be edited")]
    Locked(&'static str),
    #[error("quarter grade {value} must be between {min} and 100")]
    OutOfRange { value: f64, min: f64 },
}

impl GradeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::IllegalTransition { .. } | Self::Locked(_) => "illegal_transition",
            Self::OutOfRange { .. } => "bad_params",
        }
    }
}

pub fn next_grade_status(action: GradeAction, from: GradeStatus) -> Result<GradeStatus, GradeError> {
    if action.sources().contains(&from) {
        Ok(action.target())
    } else {
        Err(GradeError::IllegalTransition {
            action: action.as_str(),
            from: from.as_str(),
        })
    }
}

pub fn ensure_editable(status: GradeStatus) -> Result<(), GradeError> {
    if status.is_editable() {
        Ok(())
    } else {
        Err(GradeError::Locked(status.as_str()))
    }
}

pub fn validate_quarter(value: f64, min: f64) -> Result<f64, GradeError> {
    if !value.is_finite() || value < min || value > 100.0 {
        return Err(GradeError::OutOfRange { value, min });
    }
    Ok(value)
}

/// Average of the two quarters, rounded half up to a whole number.
/// A semester grade only exists once both quarters are in.
pub fn semester_grade(q1: Option<f64>, q2: Option<f64>) -> Option<i64> {
    let (q1, q2) = (q1?, q2?);
    Some(((q1 + q2) / 2.0 + 0.5).floor() as i64)
}

pub fn remarks(semester_grade: Option<i64>, passing_grade: i64) -> Option<&'static str> {
    semester_grade.map(|g| if g >= passing_grade { "Passed" } else { "Failed" })
}

/// Mean of final grades, two decimals. `None` for an empty list.
pub fn general_average(grades: &[i64]) -> Option<f64> {
    if grades.is_empty() {
        return None;
    }
    let sum: i64 = grades.iter().sum();
    let avg = sum as f64 / grades.len() as f64;
    Some((avg * 100.0).round() / 100.0)
}
