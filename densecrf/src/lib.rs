//! Approximate inference in fully connected conditional random fields.
//!
//! Every node of a [`DenseCrf`] is connected to every other node through pairwise
//! potentials of the form `w * mu(l_i, l_j) * exp(-0.5 * |f_i - f_j|^2)`. Mean-field
//! inference turns each update into a Gaussian filtering pass over the current label
//! distribution, which the [`permutohedral`] lattice evaluates in linear time.
//!
//! ```
//! use densecrf::DenseCrf;
//!
//! let mut crf = DenseCrf::new(4, 2).unwrap();
//! crf.set_unary(&[0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0]).unwrap();
//! crf.add_pairwise_energy(&[0.0, 0.0, 1.0, 1.0], 1, 1.0, None).unwrap();
//! let labels = crf.decode(5, 1.0).unwrap();
//! assert_eq!(labels.len(), 4);
//! ```

pub mod compatibility;
mod config;
mod crf;
mod error;
pub mod grid;
pub mod normalize;
pub mod potential;
#[cfg(test)]
pub(crate) mod testing;

use std::env;

use once_cell::sync::Lazy;

pub use compatibility::{Compatibility, FnCompatibility, LabelCompatibility, Potts};
pub use config::InferenceConfig;
pub use crf::{DenseCrf, InferenceState};
pub use error::{CrfError, CrfResult};
pub use grid::DenseCrf2D;
pub use potential::{FeaturePotential, KernelNormalization, PairwisePotential};

/// A label index. Label counts are limited to what fits in a `Label`.
pub type Label = u16;

/// Minimum number of nodes handled by a single rayon task in per node loops. Only
/// changes scheduling, results are identical for any value.
pub(crate) static PAR_MIN_ROWS: Lazy<usize> = Lazy::new(|| {
    env::var("DENSECRF_PAR_MIN_ROWS")
        .ok()
        .and_then(|val| val.parse::<usize>().ok())
        .filter(|&val| val > 0)
        .unwrap_or(256)
});
