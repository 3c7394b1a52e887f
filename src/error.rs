//! Unified error handling for the sync engine.
//!
//! Every fallible operation in the crate returns [`SyncResult`], and the
//! public orchestrator surface folds errors into a stable
//! `{ success, error }` shape instead of letting them escape as panics.

use std::io;
use thiserror::Error;

/// Status codes that the retry policy treats as transient.
const TRANSIENT_STATUS: [u16; 5] = [429, 500, 502, 503, 504];

/// Main error type for the sync engine
#[derive(Error, Debug)]
pub enum SyncError {
    /// Authentication errors (not authenticated, refresh failed)
    #[error("Authentication error: {message}")]
    Auth {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Sync target errors (target missing, unshared, insufficient permission)
    #[error("Sync target error: {message}")]
    Target { message: String },

    /// Remote API errors carrying the HTTP status of the failed call
    #[error("Remote API error ({status}): {message}")]
    Remote { status: u16, message: String },

    /// Transport-level network errors with no usable status code
    #[error("Network error: {message}")]
    Network {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Local filesystem errors (backup creation, file replacement)
    #[error("Local I/O error: {message} (path: {path})")]
    LocalIo {
        message: String,
        path: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Input validation errors (malformed target URL or id, bad downloads)
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Persisted sync-state store errors
    #[error("Sync state error: {message}")]
    Config {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl SyncError {
    /// Whether the retry policy may re-attempt the failed operation.
    ///
    /// Only remote failures with a rate-limit or server-side status qualify.
    /// Transport errors and all 4xx responses propagate unchanged.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Remote { status, .. } => TRANSIENT_STATUS.contains(status),
            _ => false,
        }
    }

    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::Auth { .. } => ErrorCategory::Auth,
            SyncError::Target { .. } => ErrorCategory::Target,
            SyncError::Remote { .. } | SyncError::Network { .. } => ErrorCategory::Remote,
            SyncError::LocalIo { .. } => ErrorCategory::LocalIo,
            SyncError::Validation { .. } => ErrorCategory::Validation,
            SyncError::Config { .. } => ErrorCategory::Config,
        }
    }

    /// Get user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            SyncError::Auth { message, .. } => message.clone(),
            SyncError::Target { message } => message.clone(),
            SyncError::Remote { status, message } => {
                format!("Google Drive request failed ({}): {}", status, message)
            }
            SyncError::Network { message, .. } => {
                format!("Network problem: {}", message)
            }
            SyncError::LocalIo { message, path, .. } => {
                format!("Local file problem: {} ({})", message, path)
            }
            SyncError::Validation { message, .. } => message.clone(),
            SyncError::Config { message, .. } => {
                format!("Sync configuration problem: {}", message)
            }
        }
    }
}

impl From<io::Error> for SyncError {
    fn from(err: io::Error) -> Self {
        SyncError::LocalIo {
            message: format!("I/O error: {err}"),
            path: "<io>".to_string(),
            source: Some(Box::new(err)),
        }
    }
}

/// Error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Auth,
    Target,
    Remote,
    LocalIo,
    Validation,
    Config,
}

impl ErrorCategory {
    pub fn display_name(&self) -> &'static str {
        match self {
            ErrorCategory::Auth => "Authentication",
            ErrorCategory::Target => "Sync target",
            ErrorCategory::Remote => "Remote API",
            ErrorCategory::LocalIo => "Local I/O",
            ErrorCategory::Validation => "Validation",
            ErrorCategory::Config => "Configuration",
        }
    }
}

/// Result type alias for convenience
pub type SyncResult<T> = Result<T, SyncError>;

/// Convenience functions for creating common errors
pub mod errors {
    use super::*;

    pub fn auth(message: impl Into<String>) -> SyncError {
        SyncError::Auth {
            message: message.into(),
            source: None,
        }
    }

    pub fn auth_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> SyncError {
        SyncError::Auth {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn target(message: impl Into<String>) -> SyncError {
        SyncError::Target {
            message: message.into(),
        }
    }

    pub fn remote(status: u16, message: impl Into<String>) -> SyncError {
        SyncError::Remote {
            status,
            message: message.into(),
        }
    }

    pub fn network(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> SyncError {
        SyncError::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn local_io(message: impl Into<String>, path: impl Into<String>) -> SyncError {
        SyncError::LocalIo {
            message: message.into(),
            path: path.into(),
            source: None,
        }
    }

    pub fn local_io_with_source(
        message: impl Into<String>,
        path: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> SyncError {
        SyncError::LocalIo {
            message: message.into(),
            path: path.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn validation(message: impl Into<String>, field: Option<String>) -> SyncError {
        SyncError::Validation {
            message: message.into(),
            field,
        }
    }

    pub fn config(message: impl Into<String>) -> SyncError {
        SyncError::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> SyncError {
        SyncError::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_follows_status_code() {
        for status in [429, 500, 502, 503, 504] {
            assert!(errors::remote(status, "boom").is_transient(), "{status}");
        }
        for status in [400, 401, 403, 404, 409] {
            assert!(!errors::remote(status, "boom").is_transient(), "{status}");
        }
        assert!(!errors::auth("no tokens").is_transient());
        assert!(!errors::target("gone").is_transient());
    }

    #[test]
    fn categories_and_messages() {
        let err = errors::remote(503, "backend unavailable");
        assert_eq!(err.category(), ErrorCategory::Remote);
        assert!(err.user_message().contains("503"));

        let err = errors::local_io("copy failed", "/tmp/puffin.db");
        assert_eq!(err.category(), ErrorCategory::LocalIo);
        assert!(err.user_message().contains("/tmp/puffin.db"));
    }
}
