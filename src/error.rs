//! Error kinds raised by the role-discovery stages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the modeling stages.
///
/// Row-level defects are never skipped: population statistics (percentiles,
/// variance, scaling) depend on every record, so any defect fails the batch.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineError {
    /// A required input column is missing or carries the wrong type.
    #[error("schema mismatch at {location} column '{column}': {reason}")]
    SchemaMismatch {
        /// `"header"` for table-level defects, otherwise `"row N"`.
        location: String,
        column: String,
        reason: String,
    },

    /// A per-90 rate was requested for a record without playing time.
    #[error("division by zero computing '{field}' for player '{player}'")]
    DivideByZero { player: String, field: String },

    /// No shortlisted configuration was accepted by the interpretability review.
    #[error("no interpretable configuration: {reason}")]
    NoInterpretableConfiguration { reason: String },

    /// Shapley and permutation importance disagree sharply for one feature.
    ///
    /// Surfaced as a warning in the attribution report, never returned as a
    /// stage failure.
    #[error(
        "attribution disagreement on '{feature}': shapley share {shapley_share:.3} vs permutation share {permutation_share:.3}"
    )]
    AttributionDisagreement {
        feature: String,
        shapley_share: f64,
        permutation_share: f64,
    },

    #[error("insufficient data: required {required}, actual {actual}")]
    InsufficientData { required: usize, actual: usize },

    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Bundles are write-once; a version directory is never overwritten.
    #[error("artifact bundle already exists for version {version}")]
    ArtifactExists { version: String },
}

impl PipelineError {
    pub fn schema_header(column: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            location: "header".to_string(),
            column: column.into(),
            reason: reason.into(),
        }
    }

    pub fn schema_row(row: usize, column: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            location: format!("row {row}"),
            column: column.into(),
            reason: reason.into(),
        }
    }

    pub fn insufficient_data(required: usize, actual: usize) -> Self {
        Self::InsufficientData { required, actual }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Whether this kind ends the run. Disagreement flags are report entries.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::AttributionDisagreement { .. })
    }
}
