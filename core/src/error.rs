//! Error types shared across the simulation, estimation, and synthesis modules.
//!
//! Nothing in this crate is fatal. Numerical failures (singular inversions, bad
//! dimensions) are surfaced as [`SimError`] so that the caller can log the
//! condition, keep its previous valid state, and carry on with the next step.
//! Solver non-convergence is reported as data (`converged: false`) instead.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Singular matrix: {0}")]
    SingularMatrix(String),

    #[error("Dimension mismatch in {context}: expected {expected}, found {found}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        found: usize,
    },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Unknown aircraft id '{0}'")]
    UnknownAircraft(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl SimError {
    pub(crate) fn singular(context: impl Into<String>) -> Self {
        SimError::SingularMatrix(context.into())
    }

    pub(crate) fn dimension(context: impl Into<String>, expected: usize, found: usize) -> Self {
        SimError::DimensionMismatch {
            context: context.into(),
            expected,
            found,
        }
    }
}

pub type Result<T> = std::result::Result<T, SimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singular_message_carries_context() {
        let err = SimError::singular("innovation covariance");
        assert_eq!(err.to_string(), "Singular matrix: innovation covariance");
    }

    #[test]
    fn dimension_message() {
        let err = SimError::dimension("lqr input matrix", 12, 9);
        assert_eq!(
            err.to_string(),
            "Dimension mismatch in lqr input matrix: expected 12, found 9"
        );
    }

    #[test]
    fn io_errors_convert() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err: SimError = io_err.into();
        assert!(matches!(err, SimError::Io(_)));
    }
}
