//! Error types for differential expression analysis.
//!
//! Public functions return `anyhow::Result`; the typed variants below are raised
//! through `anyhow` so callers can recover them with `downcast_ref::<DeError>()`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    #[error("Missing column '{0}' in sample description")]
    MissingColumn(String),

    #[error("Formula parse error: {0}")]
    FormulaParse(String),

    #[error("Empty data: {0}")]
    EmptyData(String),

    #[error("Numerical error: {0}")]
    Numerical(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

impl DeError {
    pub fn dimension(what: &str, expected: usize, actual: usize) -> Self {
        DeError::DimensionMismatch {
            what: what.to_string(),
            expected,
            actual,
        }
    }
}
