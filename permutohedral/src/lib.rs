//! Gaussian filtering in high dimensional feature space.
//!
//! Given `N` points with `D` dimensional features and an `N x V` signal, a [`Filter`]
//! computes for every point `i`
//!
//! `out[i] = SUM_j exp(-0.5 * |f_i - f_j|^2) * in[j]`
//!
//! Two backends are provided:
//! - [`Permutohedral`], the sparse permutohedral lattice of Adams et al., which runs in
//!   time linear in `N * D` at the price of an approximation error.
//! - [`ExactGaussian`], the quadratic brute force sum, used for small problems and as a
//!   ground truth.
//!
//! Kernel bandwidths are not parameters of the filters: callers scale their features
//! by the inverse standard deviation of each dimension before building a filter.

mod error;
mod exact;
mod lattice;

pub use error::FilterError;
pub use exact::ExactGaussian;
pub use lattice::Permutohedral;

use std::fmt::Debug;

/// Trait implemented by every filtering backend. A filter is built once for a fixed set
/// of feature points and then applied to many signals.
pub trait Filter: Debug + Send + Sync {
    /// Number of points the filter was built for.
    fn n_points(&self) -> usize;

    /// Dimensionality of the feature space.
    fn dim(&self) -> usize;

    /// Filters `input`, an `n_points x value_size` row-major signal, and writes the
    /// result into `output` (same shape). The self term `j == i` is part of the sum.
    fn apply(&self, input: &[f32], value_size: usize, output: &mut [f32])
    -> Result<(), FilterError>;

    /// The weight with which point `i` contributes to its own output.
    fn self_weight(&self, i: usize) -> f32;
}

/// Checks that a flat feature buffer describes a non empty set of finite `dim` dimensional
/// points and returns the number of points.
pub(crate) fn check_features(features: &[f32], dim: usize) -> Result<usize, FilterError> {
    if dim == 0 {
        return Err(FilterError::ParameterError(
            "feature dimension must be at least 1".to_string(),
        ));
    }
    if features.is_empty() || features.len() % dim != 0 {
        return Err(FilterError::ParameterError(format!(
            "feature buffer of length {} cannot hold a non empty set of {}-dimensional points",
            features.len(),
            dim
        )));
    }
    if let Some(pos) = features.iter().position(|f| !f.is_finite()) {
        return Err(FilterError::ParameterError(format!(
            "feature {} of point {} is not finite",
            pos % dim,
            pos / dim
        )));
    }
    Ok(features.len() / dim)
}

/// Checks the buffers passed to [`Filter::apply`].
pub(crate) fn check_signal(
    n_points: usize,
    input: &[f32],
    value_size: usize,
    output: &[f32],
) -> Result<(), FilterError> {
    if value_size == 0 {
        return Err(FilterError::ShapeError(
            "value size must be at least 1".to_string(),
        ));
    }
    let expected = n_points * value_size;
    if input.len() != expected {
        return Err(FilterError::ShapeError(format!(
            "expected input of length {} ({} points x {} values), got {}",
            expected,
            n_points,
            value_size,
            input.len()
        )));
    }
    if output.len() != expected {
        return Err(FilterError::ShapeError(format!(
            "expected output of length {} ({} points x {} values), got {}",
            expected,
            n_points,
            value_size,
            output.len()
        )));
    }
    Ok(())
}
