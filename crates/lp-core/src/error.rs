//! Error types for LiverPerf

use thiserror::Error;

/// LiverPerf error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Validation error (shapes, lengths, configuration)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Numerical-domain error: log/division of a non-positive or zero argument,
    /// or a forward model producing non-finite output.
    #[error("Numerical domain error: {0}")]
    Domain(String),

    /// The least-squares solver stopped without meeting its convergence criteria.
    #[error("Optimization did not converge: {0}")]
    NonConvergence(String),

    /// Computation error (linear algebra failures)
    #[error("Computation error: {0}")]
    Computation(String),
}

impl Error {
    /// True for errors raised by a forward model or inversion hitting a
    /// numerical-domain failure.
    pub fn is_domain(&self) -> bool {
        matches!(self, Error::Domain(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
