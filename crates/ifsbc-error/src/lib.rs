//! Error taxonomy for the calibration harness.
//!
//! Two families of failure exist and they never mix:
//!
//! - [`CalibrationError`] is returned to the caller of a batch. Configuration
//!   problems surface before any replication starts; scoring problems surface
//!   when a ranks table cannot support a discrepancy statistic.
//! - [`OracleError`] is raised by the inference oracle (or by the harness on
//!   its behalf, e.g. on timeout) inside one replication. The replication
//!   runner downgrades it to a failed-state record; it never reaches the
//!   batch caller.
//!
//! A rank that cannot be determined within numeric bounds is not an error at
//! all: it is recorded as NA in the ranks table.

use thiserror::Error;

/// Fatal or caller-visible harness errors.
#[derive(Debug, Error)]
pub enum CalibrationError {
    /// Invalid spec, bounds, sample sizes, or an unusable precondition fit.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No valid (non-NA) ranks remain for a variable.
    #[error("insufficient data for variable `{variable}`: no valid ranks ({excluded} excluded)")]
    InsufficientData { variable: String, excluded: usize },

    /// The per-record draw counts admit no common exact rank grid.
    #[error("incompatible draw counts for variable `{variable}`: {draw_counts:?}")]
    IncompatibleDrawCounts {
        variable: String,
        draw_counts: Vec<u32>,
    },

    /// Filesystem failure while writing or reading run artifacts.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Artifact or config (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal invariant violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CalibrationError {
    /// Shorthand for a [`CalibrationError::Configuration`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Whether this error aborts a batch before any replication runs.
    #[must_use]
    pub const fn is_fatal_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

/// Per-replication inference failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    /// The sampler did not converge.
    #[error("non-convergence: {0}")]
    NonConvergence(String),

    /// Overflow, NaN, or another numeric breakdown inside the oracle.
    #[error("numeric failure: {0}")]
    Numeric(String),

    /// The data or prior configuration handed to the oracle is malformed.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// The oracle does not know a requested variable.
    #[error("unknown variable `{0}`")]
    UnknownVariable(String),

    /// The per-replication deadline expired.
    #[error("timeout")]
    Timeout,

    /// The enclosing batch was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// The oracle panicked; the payload message is captured when available.
    #[error("oracle panicked: {0}")]
    Panicked(String),
}

/// Harness result alias.
pub type Result<T> = std::result::Result<T, CalibrationError>;
