//! Module containing code defining the [`CrfError`] type and conversions.

use permutohedral::FilterError;

/// Errors surfaced by the inference engine and its potentials. All of them are caller
/// contract violations, nothing in here is transient.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CrfError {
    /// Shapes, dimensions or values handed to the engine are inconsistent, i.e. a unary
    /// table that is not `N x K` or a feature set with the wrong number of points.
    #[error("Incorrect parameters passed to the CRF: {0}")]
    ParameterError(String),
    /// An operation was invoked in a state that does not allow it, i.e. stepping before
    /// inference was started.
    #[error("CRF operation not allowed in the current state: {0}")]
    StateError(String),
    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),
}

pub type CrfResult<T> = Result<T, CrfError>;
