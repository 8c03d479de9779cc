use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while turning YAML documents into a `Blueprint`.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("schema error: {0}")]
    Schema(String),

    #[error("type '{type_name}' from {incoming} conflicts with the definition from {existing}")]
    ImportConflict {
        type_name: String,
        existing: String,
        incoming: String,
    },

    #[error("cannot resolve import '{reference}' (imported by {importer})")]
    UnresolvedImport { reference: String, importer: String },
}

impl LoadError {
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }
}

/// Errors raised while building the dependency graph from a loaded blueprint.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("relationship cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("node '{node}' has a relationship to unknown node '{target}'")]
    UnresolvedReference { node: String, target: String },

    #[error("node '{node}' is ordered before its dependency '{dependency}'")]
    Unordered { node: String, dependency: String },

    #[error("required input '{0}' was not supplied")]
    MissingInput(String),

    #[error("input '{0}' is not declared by the blueprint")]
    UnknownInput(String),

    #[error("input '{name}' expects a {expected} value, got {value}")]
    InputTypeMismatch {
        name: String,
        expected: String,
        value: serde_json::Value,
    },
}

/// Failure reported by a provider adapter or a lifecycle script.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ProviderError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    pub fn retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn timeout(operation: &str, after: std::time::Duration) -> Self {
        Self::retryable("timeout", format!("{} timed out after {:?}", operation, after))
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if !self.retryable {
            write!(f, " (non-retryable)")?;
        }
        Ok(())
    }
}

/// Top-level error for a reconciler run.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("no provider adapter handles node '{node}' of type '{node_type}'")]
    NoAdapter { node: String, node_type: String },

    #[error("deployment '{0}' not found")]
    DeploymentNotFound(String),

    #[error("{phase} of deployment '{deployment}' did not complete: {status}")]
    Execution {
        deployment: String,
        phase: String,
        status: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ReconcileError {
    /// Process exit code for this error, as used by the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Load(LoadError::Parse { .. }) => 2,
            Self::Load(LoadError::Io { .. }) => 1,
            Self::Load(_) | Self::Plan(_) | Self::NoAdapter { .. } => 3,
            Self::Execution { .. } => 4,
            Self::DeploymentNotFound(_) | Self::Other(_) => 1,
        }
    }
}

pub type Result<T, E = ReconcileError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_by_category() {
        let parse = serde_yaml::from_str::<serde_yaml::Value>("a: [").unwrap_err();
        let err = ReconcileError::from(LoadError::Parse {
            origin: "bp.yaml".into(),
            source: parse,
        });
        assert_eq!(err.exit_code(), 2);

        let err = ReconcileError::from(PlanError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        });
        assert_eq!(err.exit_code(), 3);
        assert_eq!(err.to_string(), "relationship cycle: a -> b -> a");

        let err = ReconcileError::Execution {
            deployment: "d".into(),
            phase: "install".into(),
            status: "failed".into(),
        };
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_provider_error_display() {
        let err = ProviderError::fatal("AuthFailure", "bad credentials");
        assert_eq!(err.to_string(), "[AuthFailure] bad credentials (non-retryable)");
        assert!(ProviderError::timeout("create", std::time::Duration::from_secs(1)).retryable);
    }
}
