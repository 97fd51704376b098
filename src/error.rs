//! Error taxonomy for the sync engine.
//!
//! Transient failures (network, 408/429/5xx) are retried by the caller;
//! everything else is treated as permanent. Conflicts and stale updates are
//! not errors at all and never surface through this type.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("{message} (HTTP {status})")]
    Http { status: u16, message: String },

    #[error("realtime transport error: {0}")]
    Transport(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Too many failed attempts. Try again in {remaining_minutes} minute(s).")]
    Locked { remaining_minutes: i64 },

    #[error("Invalid PIN")]
    InvalidCredentials,

    #[error("missing dependency: {0}")]
    MissingDependency(&'static str),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Database(e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return SyncError::Http {
                status: status.as_u16(),
                message: e.to_string(),
            };
        }
        SyncError::Network(e.to_string())
    }
}

impl SyncError {
    pub(crate) fn lock_poisoned() -> Self {
        SyncError::Database("lock poisoned".into())
    }

    /// Whether a retry with backoff has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Network(_) | SyncError::Transport(_) => true,
            SyncError::Http { status, .. } => {
                matches!(*status, 408 | 425 | 429) || (500..=599).contains(status)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_failures() {
        assert!(SyncError::Network("connection reset".into()).is_transient());
        assert!(SyncError::Http {
            status: 503,
            message: "Admin dashboard server error".into()
        }
        .is_transient());
        assert!(SyncError::Http {
            status: 429,
            message: "Queue is backed up".into()
        }
        .is_transient());
        assert!(!SyncError::Http {
            status: 422,
            message: "Invalid menu items".into()
        }
        .is_transient());
        assert!(!SyncError::InvalidPayload("missing id".into()).is_transient());
    }

    #[test]
    fn lockout_message_carries_remaining_minutes() {
        let err = SyncError::Locked {
            remaining_minutes: 12,
        };
        assert_eq!(
            err.to_string(),
            "Too many failed attempts. Try again in 12 minute(s)."
        );
    }
}
