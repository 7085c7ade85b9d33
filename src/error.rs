use std::time::Duration;

/// A request was rejected before dispatch: unknown tool, disabled tool, bad
/// parameters, or a dependency cycle in a batch.
///
/// `subject` names what was rejected (a tool name or an operation id).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{subject}: {message}")]
pub struct ValidationError {
    pub subject: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            message: message.into(),
        }
    }
}

/// A host-side handler failed. Only the message crosses process or wire
/// boundaries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for ExecutionError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for ExecutionError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Stable category names used in error envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Connection,
    Timeout,
    Execution,
    Protocol,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Connection => "connection",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Execution => "execution",
            ErrorCategory::Protocol => "protocol",
        }
    }
}

/// Errors surfaced by the transport core
#[derive(Debug, thiserror::Error)]
pub enum HostlinkError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Request {id} timed out after {}ms", .after.as_millis())]
    Timeout { id: String, after: Duration },

    #[error("Execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Remote error: {message}")]
    Remote {
        message: String,
        details: serde_json::Map<String, serde_json::Value>,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{0} has been stopped")]
    Closed(&'static str),
}

impl HostlinkError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            HostlinkError::Validation(_) => ErrorCategory::Validation,
            HostlinkError::Connection(_) | HostlinkError::Closed(_) => ErrorCategory::Connection,
            HostlinkError::Timeout { .. } => ErrorCategory::Timeout,
            HostlinkError::Execution(_) | HostlinkError::Remote { .. } => ErrorCategory::Execution,
            HostlinkError::Protocol(_) => ErrorCategory::Protocol,
        }
    }

    /// Whether a caller may reasonably retry. The core itself never does.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            HostlinkError::Connection(_) | HostlinkError::Timeout { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, HostlinkError::Timeout { .. })
    }
}

impl From<std::io::Error> for HostlinkError {
    fn from(err: std::io::Error) -> Self {
        HostlinkError::Connection(err.to_string())
    }
}

impl From<serde_json::Error> for HostlinkError {
    fn from(err: serde_json::Error) -> Self {
        HostlinkError::Protocol(err.to_string())
    }
}

pub type Result<T, E = HostlinkError> = std::result::Result<T, E>;

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_and_retry_policy() {
        let timeout = HostlinkError::Timeout {
            id: "abc".to_string(),
            after: Duration::from_millis(100),
        };
        assert_eq!(timeout.category().as_str(), "timeout");
        assert!(timeout.is_retriable());
        assert_eq!(timeout.to_string(), "Request abc timed out after 100ms");

        let invalid = HostlinkError::from(ValidationError::new("set_material", "missing field"));
        assert_eq!(invalid.category(), ErrorCategory::Validation);
        assert!(!invalid.is_retriable());

        let failed = HostlinkError::from(ExecutionError::new("boom"));
        assert_eq!(failed.category(), ErrorCategory::Execution);
        assert!(!failed.is_retriable());
    }

    #[test]
    fn test_io_errors_are_connection_errors() {
        let err: HostlinkError =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert!(matches!(err, HostlinkError::Connection(_)));
        assert!(err.is_retriable());
    }
}
