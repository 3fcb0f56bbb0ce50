use serde_json::{json, Value};
use thiserror::Error;

/// Errors raised by the schedule engine. Every variant maps to a stable IPC
/// error code so hosts can branch on it.
#[derive(Error, Debug)]
pub enum OrganizerError {
    /// Malformed or unresolvable snapshot data. Nothing was written.
    #[error("{message}")]
    Validation { message: String, details: Value },

    /// The write lock for the scope is held by another operation.
    #[error("{0}")]
    Conflict(String),

    /// A referenced resource vanished while the operation ran.
    #[error("{message}")]
    Integrity { message: String, details: Value },

    #[error("{0}")]
    Authorization(String),

    #[error("{message}")]
    NotFound { message: String, details: Value },

    #[error("{0}")]
    BadParams(String),

    #[error(transparent)]
    Db(rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, OrganizerError>;

impl OrganizerError {
    pub fn validation(message: impl Into<String>, details: Value) -> Self {
        Self::Validation {
            message: message.into(),
            details,
        }
    }

    pub fn integrity(message: impl Into<String>, details: Value) -> Self {
        Self::Integrity {
            message: message.into(),
            details,
        }
    }

    pub fn not_found(message: impl Into<String>, details: Value) -> Self {
        Self::NotFound {
            message: message.into(),
            details,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_failed",
            Self::Conflict(_) => "conflict",
            Self::Integrity { .. } => "integrity_violation",
            Self::Authorization(_) => "forbidden",
            Self::NotFound { .. } => "not_found",
            Self::BadParams(_) => "bad_params",
            Self::Db(_) => "db_query_failed",
            Self::Json(_) => "bad_json",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn details(&self) -> Option<Value> {
        match self {
            Self::Validation { details, .. }
            | Self::Integrity { details, .. }
            | Self::NotFound { details, .. } => Some(details.clone()),
            Self::Db(e) => Some(json!({ "sqlite": e.to_string() })),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for OrganizerError {
    fn from(e: rusqlite::Error) -> Self {
        // Busy/locked means another writer owns the scope; callers retry.
        if let rusqlite::Error::SqliteFailure(inner, _) = &e {
            if matches!(
                inner.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) {
                return Self::Conflict(
                    "another schedule operation holds the write lock; retry later".to_string(),
                );
            }
        }
        Self::Db(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_sqlite_errors_become_conflicts() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        let e = OrganizerError::from(busy);
        assert_eq!(e.code(), "conflict");

        let other = OrganizerError::from(rusqlite::Error::QueryReturnedNoRows);
        assert_eq!(other.code(), "db_query_failed");
    }

    #[test]
    fn validation_keeps_details() {
        let e = OrganizerError::validation("bad", json!({ "unresolved": ["X1"] }));
        assert_eq!(e.code(), "validation_failed");
        assert_eq!(e.details().expect("details")["unresolved"][0], "X1");
    }
}
