//! Error types for pkgsentry.
//!
//! Per-file extraction problems never surface here; they are logged and
//! skipped by the corpus collector. These variants cover configuration,
//! artifact and dataset failures.

use thiserror::Error;

/// Main error type for pkgsentry operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Artifact columns disagree with the compiled-in feature schema
    #[error("schema mismatch: artifact has {found} columns, expected {expected}{}", detail_suffix(.detail))]
    SchemaMismatch {
        expected: usize,
        found: usize,
        detail: Option<String>,
    },

    /// Artifact parsed but its contents are unusable
    #[error("corrupt model artifact: {0}")]
    CorruptArtifact(String),

    /// Threshold pair does not partition [0, 1]
    #[error("invalid thresholds: safe_max ({safe_max}) must be below malicious_min ({malicious_min}), both within [0, 1]")]
    InvalidThresholds { safe_max: f64, malicious_min: f64 },

    /// Classifier input contained NaN or infinity
    #[error("non-finite value in feature '{feature}'")]
    NonFiniteFeature { feature: String },

    /// Packed package could not be opened or held nothing readable
    #[error("archive error: {0}")]
    Archive(String),

    /// Training dataset problem
    #[error("dataset error: {0}")]
    Dataset(String),
}

fn detail_suffix(detail: &Option<String>) -> String {
    detail
        .as_ref()
        .map(|d| format!(" ({d})"))
        .unwrap_or_default()
}

/// Result type alias for pkgsentry operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors that must stop the process instead of degrading to rule-only scoring.
    pub fn is_fatal_config(&self) -> bool {
        matches!(self, Error::SchemaMismatch { .. } | Error::InvalidThresholds { .. })
    }
}
