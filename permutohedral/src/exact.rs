//! Brute force Gaussian filtering.

use rayon::prelude::*;

use crate::{check_features, check_signal, Filter, FilterError};

/// Evaluates the Gaussian kernel sum exactly, in `O(N^2 * (D + V))`.
#[derive(Debug, Clone)]
pub struct ExactGaussian {
    features: Vec<f32>,
    dim: usize,
    n_points: usize,
}

impl ExactGaussian {
    pub fn new(features: &[f32], dim: usize) -> Result<Self, FilterError> {
        let n_points = check_features(features, dim)?;
        Ok(Self {
            features: features.to_vec(),
            dim,
            n_points,
        })
    }

    fn point(&self, i: usize) -> &[f32] {
        &self.features[i * self.dim..(i + 1) * self.dim]
    }

    /// Kernel value between points `i` and `j`.
    pub fn kernel(&self, i: usize, j: usize) -> f32 {
        let dist2 = self
            .point(i)
            .iter()
            .zip(self.point(j))
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>();
        (-0.5 * dist2).exp()
    }
}

impl Filter for ExactGaussian {
    fn n_points(&self) -> usize {
        self.n_points
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn apply(
        &self,
        input: &[f32],
        value_size: usize,
        output: &mut [f32],
    ) -> Result<(), FilterError> {
        check_signal(self.n_points, input, value_size, output)?;
        output
            .par_chunks_mut(value_size)
            .enumerate()
            .for_each(|(i, out)| {
                out.fill(0.0);
                for (j, signal) in input.chunks(value_size).enumerate() {
                    let k = self.kernel(i, j);
                    out.iter_mut().zip(signal).for_each(|(o, s)| *o += k * s);
                }
            });
        Ok(())
    }

    fn self_weight(&self, _i: usize) -> f32 {
        1.0
    }
}
