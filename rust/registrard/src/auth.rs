use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

const PASSWORD_SCHEME: &str = "sha256";
const PASSWORD_ITERATIONS: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Student,
    Faculty,
    Coordinator,
    Registrar,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Some(Self::Student),
            "faculty" => Some(Self::Faculty),
            "coordinator" => Some(Self::Coordinator),
            "registrar" => Some(Self::Registrar),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Faculty => "faculty",
            Self::Coordinator => "coordinator",
            Self::Registrar => "registrar",
        }
    }
}

/// The authenticated user behind a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub username: String,
    pub role: Role,
    pub is_coordinator: bool,
}

impl Actor {
    /// Faculty flagged as coordinators act as coordinators everywhere a
    /// coordinator is allowed, while keeping their faculty rights.
    pub fn has_any(&self, roles: &[Role]) -> bool {
        roles.iter().any(|r| {
            *r == self.role || (*r == Role::Coordinator && self.role == Role::Faculty && self.is_coordinator)
        })
    }

    pub fn is_reviewer(&self) -> bool {
        self.has_any(&[Role::Coordinator, Role::Registrar])
    }

    pub fn is_staff(&self) -> bool {
        self.role != Role::Student
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("account is deactivated")]
    Inactive,
    #[error("login required")]
    Unauthenticated,
    #[error("session expired, log in again")]
    SessionExpired,
    #[error("{role} may not call {method}")]
    Forbidden { method: String, role: &'static str },
    #[error("password must be at least {0} characters")]
    WeakPassword(usize),
    #[error("reset code is invalid or expired")]
    InvalidOtp,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials | Self::Inactive | Self::InvalidOtp => "invalid_credentials",
            Self::Unauthenticated | Self::SessionExpired => "unauthenticated",
            Self::Forbidden { .. } => "forbidden",
            Self::WeakPassword(_) => "bad_params",
        }
    }
}

pub fn check_password_strength(password: &str, min_len: usize) -> Result<(), AuthError> {
    if password.chars().count() < min_len {
        return Err(AuthError::WeakPassword(min_len));
    }
    Ok(())
}

/// Encodes as `sha256$<iterations>$<salt>$<hex digest>`.
pub fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    let digest = iterated_digest(&salt, password, PASSWORD_ITERATIONS);
    format!(
        "{}${}${}${}",
        PASSWORD_SCHEME,
        PASSWORD_ITERATIONS,
        salt,
        hex::encode(digest)
    )
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(scheme), Some(iterations), Some(salt), Some(expected), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };
    if scheme != PASSWORD_SCHEME {
        return false;
    }
    let Ok(iterations) = iterations.parse::<u32>() else {
        return false;
    };
    let actual = hex::encode(iterated_digest(salt, password, iterations));
    actual.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn iterated_digest(salt: &str, password: &str, iterations: u32) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    let mut out: [u8; 32] = hasher.finalize().into();
    for _ in 1..iterations.max(1) {
        let mut h = Sha256::new();
        h.update(out);
        h.update(salt.as_bytes());
        out = h.finalize().into();
    }
    out
}

/// Opaque bearer token handed to the client. Only its digest is persisted.
pub fn new_session_token() -> String {
    format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

/// Wrong guesses allowed against a reset code before it is spent.
pub const MAX_OTP_ATTEMPTS: i64 = 5;

/// Six-digit code for password resets.
pub fn new_otp() -> String {
    let bytes = Uuid::new_v4().into_bytes();
    let n = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) % 1_000_000;
    format!("{:06}", n)
}

pub fn secret_digest(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}
