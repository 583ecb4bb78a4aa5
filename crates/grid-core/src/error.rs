//! Error types for structural validation, signing, and configuration.

use thiserror::Error;

/// A deployment or workload is structurally invalid.
///
/// These are never retried: the same content would be rejected again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("deployment has no workloads")]
    Empty,

    #[error("invalid workload name {0:?}: must be 1-50 ascii alphanumerics or '_'")]
    InvalidName(String),

    #[error("duplicate workload name {0:?}")]
    DuplicateName(String),

    #[error("deployment version {deployment} is lower than workload {workload:?} version {version}")]
    VersionRegression {
        deployment: u32,
        workload: String,
        version: u32,
    },

    #[error("workload {workload:?}: {reason}")]
    InvalidWorkload { workload: String, reason: String },

    #[error("workload {workload:?} references unknown {kind} {target:?}")]
    DanglingReference {
        workload: String,
        kind: &'static str,
        target: String,
    },
}

impl ValidationError {
    pub(crate) fn workload(workload: &str, reason: impl Into<String>) -> Self {
        Self::InvalidWorkload {
            workload: workload.to_string(),
            reason: reason.into(),
        }
    }
}

/// Signing a deployment failed.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("failed to compute challenge: {0}")]
    Challenge(#[from] serde_json::Error),

    #[error("identity failed to sign: {0}")]
    Identity(#[source] anyhow::Error),
}

/// Configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
