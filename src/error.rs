use thiserror::Error;

/// Error taxonomy for the analysis pipeline
///
/// Per-chromosome and per-cell data problems are not errors; they are isolated into the skip
/// diagnostics carried by each stage's result structure. Only conditions that invalidate a whole
/// stage surface here.
///
#[derive(Debug, Error)]
pub enum TarponError {
    /// Invalid parameter combination, reported before any computation begins
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Malformed or inconsistent input that empties or contradicts the working set
    #[error("invalid input: {0}")]
    Input(String),

    /// Mixture model fit failure; all downstream stages depend on the fitted model, so this
    /// aborts the run
    #[error("deviance model fit failed: {0}")]
    Fit(String),

    /// The run was stopped through an external cancel token
    #[error("operation cancelled")]
    Cancelled,
}

pub type TarponResult<T> = Result<T, TarponError>;
