use thiserror::Error;

/// Fatal pipeline errors. Per-point numeric failures are not errors; they
/// surface as [`crate::hybrid_imputer::FillOutcome::Skipped`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{table} table is missing required column '{column}'")]
    MissingColumn { table: String, column: String },

    #[error("station count mismatch: {observations} stations in observations, {details} rows in station details")]
    StationCountMismatch { observations: usize, details: usize },

    #[error("too few pollutant columns: found {found}, need at least {required}")]
    TooFewPollutants { found: usize, required: usize },

    #[error("row {row}: cannot parse timestamp '{value}'")]
    InvalidTimestamp { row: usize, value: String },

    #[error("row {row}, column '{column}': cannot parse '{value}' as a number")]
    InvalidValue {
        row: usize,
        column: String,
        value: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
