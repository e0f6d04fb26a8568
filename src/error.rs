//! NR-002: Error taxonomy for the convergence engine.
//!
//! Construction errors fail before any host I/O. Run errors describe one
//! command round trip. Resource errors tie a run error (or a parse failure)
//! to the resource that observed it.

use thiserror::Error;

/// Outcome of a single failed command round trip through a [`Runner`].
///
/// [`Runner`]: crate::transport::Runner
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    /// The command ran and exited non-zero. `output` is stdout then stderr.
    #[error("exit code {exit_code}: {}", output.trim())]
    Exit { exit_code: i32, output: String },

    /// The command could not be started or its I/O failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The caller cancelled the context.
    #[error("cancelled")]
    Cancelled,

    /// The context deadline elapsed before the command finished.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl RunError {
    /// Output captured before the failure. Empty for non-exit failures.
    pub fn output(&self) -> &str {
        match self {
            Self::Exit { output, .. } => output,
            _ => "",
        }
    }

    /// True when the failure came from the context, not from the host.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

/// Failure of a resource capability call.
#[derive(Debug, Clone, Error)]
pub enum ResourceError {
    /// Current state could not be determined.
    #[error("query {resource}: {message}")]
    Query {
        resource: String,
        message: String,
        output: String,
    },

    /// A mutating command failed.
    #[error("apply {resource}: `{command}` failed: {source}")]
    Apply {
        resource: String,
        command: String,
        #[source]
        source: RunError,
    },

    /// A reversal command failed.
    #[error("undo {resource}: `{command}` failed: {source}")]
    Undo {
        resource: String,
        command: String,
        #[source]
        source: RunError,
    },

    /// The context was cancelled or timed out mid-call.
    #[error("{resource}: gave up ({reason})")]
    Cancelled { resource: String, reason: RunError },
}

impl ResourceError {
    /// Wrap a failed read-only command. Cancellation stays distinguishable.
    pub fn query(resource: impl Into<String>, err: RunError) -> Self {
        let resource = resource.into();
        if err.is_cancellation() {
            return Self::Cancelled {
                resource,
                reason: err,
            };
        }
        Self::Query {
            resource,
            message: err.to_string(),
            output: err.output().to_string(),
        }
    }

    /// Query output that could not be parsed.
    pub fn malformed(
        resource: impl Into<String>,
        message: impl Into<String>,
        output: &str,
    ) -> Self {
        Self::Query {
            resource: resource.into(),
            message: message.into(),
            output: output.to_string(),
        }
    }

    /// Wrap a failed mutating command.
    pub fn apply(resource: impl Into<String>, command: impl Into<String>, err: RunError) -> Self {
        let resource = resource.into();
        if err.is_cancellation() {
            return Self::Cancelled {
                resource,
                reason: err,
            };
        }
        Self::Apply {
            resource,
            command: command.into(),
            source: err,
        }
    }

    /// Wrap a failed reversal command.
    pub fn undo(resource: impl Into<String>, command: impl Into<String>, err: RunError) -> Self {
        let resource = resource.into();
        if err.is_cancellation() {
            return Self::Cancelled {
                resource,
                reason: err,
            };
        }
        Self::Undo {
            resource,
            command: command.into(),
            source: err,
        }
    }

    /// Raw host output attached to this error, for diagnostics.
    pub fn output(&self) -> &str {
        match self {
            Self::Query { output, .. } => output,
            Self::Apply { source, .. } | Self::Undo { source, .. } => source.output(),
            Self::Cancelled { .. } => "",
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Invalid resource or plan specification. Raised before any host I/O.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConstructionError {
    #[error("{kind} '{name}': release '{release}' given without a version")]
    ReleaseWithoutVersion {
        kind: &'static str,
        name: String,
        release: String,
    },

    #[error("{kind}: field '{field}' must not be empty")]
    EmptyField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("{kind}: invalid fields: {message}")]
    InvalidFields { kind: String, message: String },

    #[error("unknown resource kind '{0}'")]
    UnknownKind(String),

    #[error("duplicate resource id '{0}'")]
    DuplicateId(String),

    #[error("dependency edge {from} -> {to} references unknown resource '{missing}'")]
    UnknownDependency {
        from: String,
        to: String,
        missing: String,
    },

    #[error("resource '{0}' depends on itself")]
    SelfDependency(String),

    #[error("dependency cycle detected involving: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nr002_run_error_output_kept() {
        let e = RunError::Exit {
            exit_code: 1,
            output: "package httpd is not installed\n".into(),
        };
        assert!(e.output().contains("is not installed"));
        assert!(!e.is_cancellation());
        assert_eq!(e.to_string(), "exit code 1: package httpd is not installed");
    }

    #[test]
    fn test_nr002_cancellation_is_distinguished() {
        let q = ResourceError::query("rpm:httpd", RunError::DeadlineExceeded);
        assert!(q.is_cancellation());
        let a = ResourceError::apply("rpm:httpd", "yum -y install httpd", RunError::Cancelled);
        assert!(a.is_cancellation());
        let host = ResourceError::apply(
            "rpm:httpd",
            "yum -y install httpd",
            RunError::Exit {
                exit_code: 1,
                output: "No package httpd available.".into(),
            },
        );
        assert!(!host.is_cancellation());
        assert_eq!(host.output(), "No package httpd available.");
    }

    #[test]
    fn test_nr002_cycle_message() {
        let e = ConstructionError::Cycle(vec!["a".into(), "b".into()]);
        assert_eq!(e.to_string(), "dependency cycle detected involving: a, b");
    }
}
