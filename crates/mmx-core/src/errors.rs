//! Error taxonomy shared by every MERRA/Max crate.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MmxError>;

#[derive(Debug, Error)]
pub enum MmxError {
    /// Malformed or out-of-domain arguments (point lists, sample sizes, tables).
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// A run descriptor field violates one of its invariants.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("trial {index} not found in {}", .trials_dir.display())]
    TrialNotFound { index: usize, trials_dir: PathBuf },
    #[error("no trials found in {}", .0.display())]
    NoTrialsFound(PathBuf),
    /// An external command exited badly or did not produce its output file.
    #[error("external tool failed: {command}: {reason}")]
    ExternalTool { command: String, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl MmxError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        MmxError::InvalidInput(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        MmxError::InvalidConfiguration(msg.into())
    }

    /// Stable machine readable code, used by the CLI's JSON error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            MmxError::InvalidInput(_) => "invalid_input",
            MmxError::InvalidConfiguration(_) => "invalid_configuration",
            MmxError::TrialNotFound { .. } => "trial_not_found",
            MmxError::NoTrialsFound(_) => "no_trials_found",
            MmxError::ExternalTool { .. } => "external_tool_failure",
            MmxError::Io(_) => "io_error",
            MmxError::Json(_) => "json_error",
            MmxError::Csv(_) => "csv_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(MmxError::invalid_input("x").code(), "invalid_input");
        assert_eq!(MmxError::invalid_config("x").code(), "invalid_configuration");
        let err = MmxError::TrialNotFound {
            index: 3,
            trials_dir: PathBuf::from("/tmp/TRIALS"),
        };
        assert_eq!(err.code(), "trial_not_found");
        assert_eq!(err.to_string(), "trial 3 not found in /tmp/TRIALS");
    }
}
