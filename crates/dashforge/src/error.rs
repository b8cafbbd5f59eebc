// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Error types for the build execution engine.

use thiserror::Error;

/// Result type for build engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the scheduler, dispatcher, and executors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A `COPY --from` target or the build target names a stage that does
    /// not exist, or the graph is empty.
    #[error("Build stage '{0}' not found")]
    StageNotFound(String),

    /// A cycle inside a stage's node graph, or among stages after
    /// cross-stage edges are resolved.
    #[error("Cyclic dependency detected: {0}")]
    CyclicDependency(String),

    /// An operation failed after its retry budget was exhausted.
    #[error("Operation '{description}' failed: {source}")]
    OperationFailed {
        /// Single-line rendering of the failing operation.
        description: String,
        #[source]
        source: Box<Error>,
    },

    /// A node could not run because one of its dependencies failed.
    #[error("Dependency '{0}' failed")]
    DependencyFailed(String),

    /// The build was cancelled.
    #[error("Build was cancelled")]
    Cancelled,

    /// No executor claimed the operation.
    #[error("No executor available for operation '{0}'")]
    UnsupportedOperation(String),

    /// A base image could not be realized.
    #[error("Image resolution failed for '{reference}': {reason}")]
    ImageResolution { reference: String, reason: String },

    /// A command exited with a non-zero status.
    #[error("Command '{command}' exited with status {status}")]
    CommandFailed {
        command: String,
        status: i32,
        /// Trailing stderr lines, kept for diagnostics.
        stderr: String,
    },

    /// A filesystem source (context path, URL, git remote, stage snapshot)
    /// could not be resolved.
    #[error("Filesystem source unavailable: {0}")]
    SourceUnavailable(String),

    /// Transient execution failure reported by an executor.
    #[error("Operation execution failed: {0}")]
    Execution(String),

    /// The build graph is malformed (duplicate ids, dangling dependencies).
    #[error("Invalid build graph: {0}")]
    InvalidGraph(String),

    /// An engine invariant was broken.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the retry loop may re-dispatch an operation that failed with
    /// this error. Graph-shape and cancellation errors are never retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ImageResolution { .. }
            | Error::CommandFailed { .. }
            | Error::SourceUnavailable(_)
            | Error::Execution(_) => true,
            Error::OperationFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_not_found_display() {
        let err = Error::StageNotFound("builder".to_string());
        assert_eq!(err.to_string(), "Build stage 'builder' not found");
    }

    #[test]
    fn test_cyclic_dependency_display() {
        let err = Error::CyclicDependency("a -> b -> a".to_string());
        assert_eq!(err.to_string(), "Cyclic dependency detected: a -> b -> a");
    }

    #[test]
    fn test_operation_failed_display_includes_source() {
        let err = Error::OperationFailed {
            description: "RUN make".to_string(),
            source: Box::new(Error::Execution("exit 2".to_string())),
        };
        assert_eq!(
            err.to_string(),
            "Operation 'RUN make' failed: Operation execution failed: exit 2"
        );
    }

    #[test]
    fn test_cancelled_display() {
        assert_eq!(Error::Cancelled.to_string(), "Build was cancelled");
    }

    #[test]
    fn test_command_failed_display() {
        let err = Error::CommandFailed {
            command: "make install".to_string(),
            status: 2,
            stderr: String::new(),
        };
        assert_eq!(err.to_string(), "Command 'make install' exited with status 2");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Execution("flaky".to_string()).is_retryable());
        assert!(Error::ImageResolution {
            reference: "alpine".to_string(),
            reason: "timeout".to_string(),
        }
        .is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::CyclicDependency("x".to_string()).is_retryable());
        assert!(!Error::DependencyFailed("a".to_string()).is_retryable());
        assert!(!Error::UnsupportedOperation("UNKNOWN".to_string()).is_retryable());
    }

    #[test]
    fn test_retryable_propagates_through_wrapping() {
        let wrapped = Error::OperationFailed {
            description: "FROM alpine".to_string(),
            source: Box::new(Error::SourceUnavailable("registry".to_string())),
        };
        assert!(wrapped.is_retryable());
    }
}
