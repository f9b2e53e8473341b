//! Error types shared by the runtime adapter, the generator and the controller

use crate::controller::Lifecycle;
use std::path::PathBuf;

/// Result type alias for proxy-manager operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by proxy-manager.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The container runtime could not be reached or did not answer in time.
    /// Retryable by the caller; never retried internally.
    #[error("container runtime unavailable during {operation}: {reason}")]
    RuntimeUnavailable { operation: String, reason: String },

    /// Image build exited unsuccessfully.
    #[error("image build for '{tag}' failed: {stderr}")]
    BuildFailed { tag: String, stderr: String },

    /// A host port requested by the proxy is held by something else.
    #[error("host port already in use for container '{container}': {reason}")]
    PortInUse { container: String, reason: String },

    /// A container with the requested name already exists.
    #[error("container name '{name}' is already in use")]
    NameConflict { name: String },

    /// The running proxy was built from a different configuration.
    #[error(
        "proxy '{proxy}' is running configuration {running} but declared state renders {declared}; run reload"
    )]
    ConfigDrift {
        proxy: String,
        running: String,
        declared: String,
    },

    /// A referenced container, network or route does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// Declared configuration violates an invariant.
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// The replacement proxy could not be promoted; the previous proxy keeps serving.
    #[error("reload of proxy '{proxy}' failed, previous proxy left in place: {reason}")]
    ReloadFailed { proxy: String, reason: String },

    /// The operation is not valid in the controller's current lifecycle state.
    #[error("cannot {operation} while proxy is {state}")]
    InvalidState {
        operation: &'static str,
        state: Lifecycle,
    },

    /// Any other runtime failure.
    #[error("{operation} failed: {reason}")]
    Runtime { operation: String, reason: String },

    /// Reading or writing a file failed.
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted document could not be parsed.
    #[error("failed to parse {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },

    /// Context added by the controller: what was attempted, on what.
    #[error("{operation} {subject}: {source}")]
    Operation {
        operation: &'static str,
        subject: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn unavailable(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::RuntimeUnavailable {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// The underlying error with all operation context stripped.
    pub fn root(&self) -> &Error {
        match self {
            Error::Operation { source, .. } => source.root(),
            other => other,
        }
    }

    /// True when the root cause is a missing entity.
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound { .. })
    }

    /// True when a caller may reasonably retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self.root(), Error::RuntimeUnavailable { .. })
    }
}

/// Attach operation context to a result.
pub trait ResultExt<T> {
    fn during(self, operation: &'static str, subject: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn during(self, operation: &'static str, subject: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            // already carries context for the same operation
            if let Error::Operation {
                operation: existing,
                ..
            } = &e
            {
                if *existing == operation {
                    return e;
                }
            }
            Error::Operation {
                operation,
                subject: subject.into(),
                source: Box::new(e),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_strips_context() {
        let err: Result<()> = Err(Error::not_found("container", "app-v1"));
        let err = err.during("switch", "route 8000").unwrap_err();

        assert!(matches!(err.root(), Error::NotFound { kind: "container", .. }));
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_message_names_operation_subject_and_cause() {
        let err: Result<()> = Err(Error::unavailable("inspect_container", "timed out after 30s"));
        let message = err.during("reload", "proxy proxy-manager").unwrap_err().to_string();

        assert!(message.starts_with("reload proxy proxy-manager"));
        assert!(message.contains("timed out after 30s"));
    }

    #[test]
    fn test_same_operation_context_is_not_nested() {
        let err: Result<()> = Err(Error::Validation("no routes configured".to_string()));
        let err = err
            .during("start", "proxy p")
            .during("start", "proxy p")
            .unwrap_err();

        match err {
            Error::Operation { source, .. } => {
                assert!(matches!(*source, Error::Validation(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_retryable_only_for_unavailable_runtime() {
        assert!(Error::unavailable("ping", "connection refused").is_retryable());
        assert!(!Error::BuildFailed {
            tag: "p:abc".to_string(),
            stderr: "boom".to_string()
        }
        .is_retryable());
    }
}
