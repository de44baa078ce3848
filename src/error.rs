//! Error handling for Flywheel Core.
//!
//! This module provides:
//! - The crate-wide `FlywheelError` type and `Result` alias
//! - Stable machine-readable error codes for operator tooling
//! - Retryability classification for storage-level faults
//! - Error logging and metrics integration
//!
//! Handler-level failures are a different animal: they are captured as
//! [`crate::job::ExecutionError`] records, not as `FlywheelError`, because a
//! failing job is a normal outcome for the engine, not an engine fault.

use metrics::counter;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::job::JobId;

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Flywheel operations.
pub type Result<T> = std::result::Result<T, FlywheelError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Flywheel Core.
///
/// Everything the engine can reject synchronously lands here: malformed
/// submissions, configuration problems, schedule expressions that do not
/// parse, and faults reported by an [`crate::store::ExecutionStore`]
/// implementation. Claim races, blocked jobs, and handler failures are *not*
/// errors — they are ordinary states of the queue.
#[derive(Error, Debug)]
pub enum FlywheelError {
    /// A submission was rejected at validation time (empty queue name,
    /// overlong queue name, empty class identifier).
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// A job id was required to exist but does not.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// A recurring task schedule expression failed to parse.
    #[error("invalid schedule expression {expression:?}: {message}")]
    InvalidSchedule {
        expression: String,
        message: String,
    },

    /// The engine was asked to start while already running.
    #[error("engine is already running")]
    AlreadyRunning,

    /// Arguments could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration could not be loaded or was invalid.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A storage backend reported a fault. The in-memory store never emits
    /// this; durable implementations map connection and transaction errors
    /// into it.
    #[error("storage error: {message}")]
    Storage { message: String },
}

impl FlywheelError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create an invalid-schedule error from a parse failure.
    pub fn invalid_schedule(expression: impl Into<String>, message: impl ToString) -> Self {
        Self::InvalidSchedule {
            expression: expression.into(),
            message: message.to_string(),
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Classification
    // ─────────────────────────────────────────────────────────────────────────

    /// Stable machine-readable code for this error.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION",
            Self::JobNotFound(_) => "JOB_NOT_FOUND",
            Self::InvalidSchedule { .. } => "INVALID_SCHEDULE",
            Self::AlreadyRunning => "ALREADY_RUNNING",
            Self::Serialization(_) => "SERIALIZATION",
            Self::Config(_) => "CONFIG",
            Self::Storage { .. } => "STORAGE",
        }
    }

    /// Whether retrying the same call may succeed.
    ///
    /// Only storage faults are transient; everything else reflects bad input
    /// or bad state that will not fix itself.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging + Metrics
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error at an appropriate level and bump the error counter.
    ///
    /// Called at the engine API boundary so internal plumbing can use `?`
    /// freely without duplicating log lines.
    pub fn observe(&self) {
        counter!("flywheel_errors_total", "code" => self.code()).increment(1);

        match self {
            Self::Validation { .. } | Self::JobNotFound(_) => {
                debug!(code = self.code(), error = %self, "request rejected");
            }
            Self::InvalidSchedule { .. } | Self::AlreadyRunning | Self::Serialization(_) => {
                warn!(code = self.code(), error = %self, "operation failed");
            }
            Self::Config(_) | Self::Storage { .. } => {
                error!(code = self.code(), error = %self, "engine fault");
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(FlywheelError::validation("x").code(), "VALIDATION");
        assert_eq!(FlywheelError::JobNotFound(JobId(7)).code(), "JOB_NOT_FOUND");
        assert_eq!(
            FlywheelError::invalid_schedule("* *", "bad").code(),
            "INVALID_SCHEDULE"
        );
        assert_eq!(FlywheelError::storage("down").code(), "STORAGE");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(FlywheelError::storage("timeout").is_retryable());
        assert!(!FlywheelError::validation("empty queue").is_retryable());
        assert!(!FlywheelError::AlreadyRunning.is_retryable());
    }

    #[test]
    fn test_display_includes_detail() {
        let err = FlywheelError::validation("queue name must not be empty");
        assert!(err.to_string().contains("queue name must not be empty"));

        let err = FlywheelError::invalid_schedule("x y z", "expected 6 fields");
        assert!(err.to_string().contains("x y z"));
        assert!(err.to_string().contains("expected 6 fields"));
    }

    #[test]
    fn test_from_serde_json() {
        let bad = serde_json::from_str::<serde_json::Value>("{nope");
        let err: FlywheelError = bad.unwrap_err().into();
        assert_eq!(err.code(), "SERIALIZATION");
    }
}
