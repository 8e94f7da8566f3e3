//! Error enum for the [`crate::Filter`] implementations and their construction.

use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
};

#[derive(Debug, Clone, PartialEq)]
pub enum FilterError {
    /// Returned when the feature set handed to a filter is unusable, i.e. empty,
    /// zero dimensional or containing non-finite coordinates.
    ParameterError(String),
    /// Returned when the signal or output buffer passed to [`crate::Filter::apply`]
    /// does not line up with the number of points the filter was built for.
    ShapeError(String),
}

impl Display for FilterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            FilterError::ParameterError(s) => {
                write!(f, "Parameters to filter construction were incorrect: {}", s)
            }
            FilterError::ShapeError(s) => {
                write!(f, "Buffer shape did not match the filter: {}", s)
            }
        }
    }
}

impl Error for FilterError {}
