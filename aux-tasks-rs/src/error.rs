//! Error types for aux-tasks-rs.
//!
//! Numerical problems inside a training step are deliberately *not* errors:
//! a singular covariance estimate shows up as NaN values in the feature
//! matrix and in the metric stream, and the run keeps going. The errors
//! below cover everything around the step: configuration, persistence and
//! progress display.
//!
//! # Example - Pattern Matching
//!
//! ```rust
//! use aux_tasks_rs::{AuxTasksError, SyntheticConfig};
//!
//! match SyntheticConfig::from_preset("adam") {
//!     Ok(_) => println!("Loaded config"),
//!     Err(AuxTasksError::Config(msg)) => eprintln!("Configuration error: {msg}"),
//!     Err(e) => eprintln!("Other error: {e}"),
//! }
//! ```

use thiserror::Error;

/// Result type alias for aux-tasks-rs operations.
pub type Result<T> = std::result::Result<T, AuxTasksError>;

/// Errors that can occur in aux-tasks-rs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AuxTasksError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// JSON serialization error (checkpoints, metrics, trajectories).
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A decomposition needed before training (not inside a step) failed.
    #[error("numerical error: {0}")]
    Numerical(String),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl From<indicatif::style::TemplateError> for AuxTasksError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        AuxTasksError::Template(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_creation() {
        let error = AuxTasksError::Config("num_states must be > 0".to_string());
        assert_eq!(
            error.to_string(),
            "configuration error: num_states must be > 0"
        );
    }

    #[test]
    fn test_checkpoint_error_creation() {
        let error = AuxTasksError::Checkpoint("version mismatch".to_string());
        assert_eq!(error.to_string(), "checkpoint error: version mismatch");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: AuxTasksError = io_error.into();
        assert!(error.to_string().contains("IO error"));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_config_parse_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("invalid: yaml: :::")
            .unwrap_err();
        let error: AuxTasksError = yaml_error.into();
        assert!(error.to_string().contains("invalid config file"));
    }

    #[test]
    fn test_serialization_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error: AuxTasksError = json_error.into();
        assert!(matches!(error, AuxTasksError::Serialization(_)));
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error;

        let error: AuxTasksError =
            io::Error::new(io::ErrorKind::NotFound, "phis.json not found").into();
        assert!(error.source().is_some());
    }

    #[test]
    fn test_template_error_conversion() {
        use indicatif::ProgressStyle;

        let result = ProgressStyle::default_bar().template("{invalid_placeholder");
        if let Err(template_error) = result {
            let error: AuxTasksError = template_error.into();
            assert!(error.to_string().contains("template error"));
        }
    }
}
