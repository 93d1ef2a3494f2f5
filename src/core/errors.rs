use thiserror::Error;

/// Unified error type for the entire drover library
#[derive(Debug, Error)]
pub enum DroverError {
    /// Configuration errors: permanent, fail before any side effect
    #[error("configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Arming a watch against an incompatible precondition: caller error
    #[error("invalid state for watch on '{path}': {message}")]
    InvalidState { path: String, message: String },

    /// Terminal failure of a wait, never auto-retried
    #[error("operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Idempotence guard on post-terminal operations: a signaling no-op
    #[error("runtime is stopped")]
    Stopped,

    /// Explicit cancellation of a pending wait
    #[error("operation was cancelled: {operation}")]
    Cancelled { operation: String },

    /// Subprocess ran and failed
    #[error("command failed: {message}")]
    ExecFailed {
        message: String,
        exit_code: Option<i32>,
    },

    /// Subprocess exited but its final state is unavailable
    #[error("command finished in unknown state: {message}")]
    CommandUnknown { message: String },

    /// Store node already exists
    #[error("node already exists: {path}")]
    NodeExists { path: String },

    /// Store node does not exist
    #[error("node does not exist: {path}")]
    NotFound { path: String },

    /// Versioned set lost the race
    #[error("version conflict at '{path}': expected {expected}, actual {actual}")]
    VersionConflict {
        path: String,
        expected: i64,
        actual: i64,
    },

    /// Store communication errors, propagated verbatim
    #[error("store operation failed: {operation} on '{path}': {message}")]
    Store {
        operation: String,
        path: String,
        message: String,
    },

    /// Pub/sub bus errors
    #[error("bus error on topic '{topic}': {message}")]
    Bus { topic: String, message: String },

    /// Internal channel errors (closed forwarding loops, dropped receivers)
    #[error("channel error: {name} - {message}")]
    Channel { name: String, message: String },

    /// Serialization errors
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML descriptor errors
    #[error("descriptor parse failed: {0}")]
    Descriptor(#[from] serde_yaml::Error),

    /// IO errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DroverError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create an invalid-state error for a watch precondition violation
    pub fn invalid_state<P: Into<String>, M: Into<String>>(path: P, message: M) -> Self {
        Self::InvalidState {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a subprocess failure error
    pub fn exec_failed<S: Into<String>>(message: S, exit_code: Option<i32>) -> Self {
        Self::ExecFailed {
            message: message.into(),
            exit_code,
        }
    }

    /// Create an unknown-final-state subprocess error
    pub fn command_unknown<S: Into<String>>(message: S) -> Self {
        Self::CommandUnknown {
            message: message.into(),
        }
    }

    /// Create a store communication error
    pub fn store<O: Into<String>, P: Into<String>, M: Into<String>>(
        operation: O,
        path: P,
        message: M,
    ) -> Self {
        Self::Store {
            operation: operation.into(),
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a bus error
    pub fn bus<T: Into<String>, M: Into<String>>(topic: T, message: M) -> Self {
        Self::Bus {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Create a channel error
    pub fn channel<N: Into<String>, M: Into<String>>(name: N, message: M) -> Self {
        Self::Channel {
            name: name.into(),
            message: message.into(),
        }
    }

    /// True for the idempotence-guard no-op, which callers usually tolerate
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::InvalidState { .. } => "invalid_state",
            Self::Timeout { .. } => "timeout",
            Self::Stopped => "stopped",
            Self::Cancelled { .. } => "cancelled",
            Self::ExecFailed { .. } => "exec_failed",
            Self::CommandUnknown { .. } => "command_unknown",
            Self::NodeExists { .. } => "node_exists",
            Self::NotFound { .. } => "not_found",
            Self::VersionConflict { .. } => "version_conflict",
            Self::Store { .. } => "store",
            Self::Bus { .. } => "bus",
            Self::Channel { .. } => "channel",
            Self::Serialization(_) => "serialization",
            Self::Descriptor(_) => "descriptor",
            Self::Io(_) => "io",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, DroverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = DroverError::configuration("missing namespace");
        assert!(matches!(err, DroverError::Configuration { .. }));
        assert_eq!(err.category(), "configuration");
    }

    #[test]
    fn test_stopped_guard() {
        assert!(DroverError::Stopped.is_stopped());
        assert!(!DroverError::timeout("wait", 1000).is_stopped());
    }

    #[test]
    fn test_display_includes_detail() {
        let err = DroverError::invalid_state("/units/web", "path already exists");
        assert!(err.to_string().contains("/units/web"));

        let err = DroverError::timeout("condition set", 300_000);
        assert!(err.to_string().contains("300000ms"));
    }
}
