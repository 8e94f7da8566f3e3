//! Pairwise potentials over a feature space.
//!
//! A pairwise potential couples every pair of nodes `(i, j)` with weight
//! `w * k(f_i, f_j)`, `k` being a unit Gaussian kernel over the node features. The
//! kernel bandwidth is folded into the features by the caller (see [`crate::grid`]).

use std::fmt::Debug;

use permutohedral::{ExactGaussian, Filter, Permutohedral};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    compatibility::{Compatibility, Potts},
    CrfError, CrfResult, Label, PAR_MIN_ROWS,
};

/// Trait implemented by every pairwise term the engine can hold. Both methods work on
/// row-major `N x K` buffers.
pub trait PairwisePotential: Debug + Send + Sync {
    /// Number of nodes the potential was built for.
    fn n_nodes(&self) -> usize;

    /// The scalar weight `w` of the potential.
    fn weight(&self) -> f32;

    /// Computes the mean-field message of this potential for the label `distribution`
    /// and ADDS it to `energy`. `scratch` is working memory of the same size.
    fn apply(
        &self,
        distribution: &[f32],
        n_labels: usize,
        scratch: &mut [f32],
        energy: &mut [f32],
    ) -> CrfResult<()>;

    /// Per node energy of a hard assignment. Every edge's energy is split evenly
    /// between its endpoints, so the entries sum to the total pairwise energy.
    fn energy(&self, assignment: &[Label], n_labels: usize) -> CrfResult<Vec<f32>> {
        let n = self.n_nodes();
        check_assignment(assignment, n, n_labels)?;
        let mut one_hot = vec![0.0f32; n * n_labels];
        for (i, &label) in assignment.iter().enumerate() {
            one_hot[i * n_labels + label as usize] = 1.0;
        }
        let mut scratch = vec![0.0f32; n * n_labels];
        let mut energy = vec![0.0f32; n * n_labels];
        self.apply(&one_hot, n_labels, &mut scratch, &mut energy)?;
        Ok(assignment
            .iter()
            .enumerate()
            .map(|(i, &label)| 0.5 * energy[i * n_labels + label as usize])
            .collect())
    }
}

pub(crate) fn check_assignment(
    assignment: &[Label],
    n_nodes: usize,
    n_labels: usize,
) -> CrfResult<()> {
    if assignment.len() != n_nodes {
        return Err(CrfError::ParameterError(format!(
            "assignment has {} entries, expected one per node ({})",
            assignment.len(),
            n_nodes
        )));
    }
    if let Some(i) = assignment.iter().position(|&l| l as usize >= n_labels) {
        return Err(CrfError::ParameterError(format!(
            "node {} is assigned label {} but only {} labels exist",
            i, assignment[i], n_labels
        )));
    }
    Ok(())
}

/// How the filtered messages of a [`FeaturePotential`] are rescaled per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum KernelNormalization {
    /// Raw kernel sums. Symmetric, so per node energies add up exactly.
    #[default]
    Unnormalized,
    /// One global factor making the average kernel mass per node equal to one.
    Mean,
    /// Every node's kernel mass is scaled to one. Not symmetric: nodes in sparse regions
    /// of feature space weigh their few neighbours more.
    PerNode,
}

/// The generic pairwise potential: a [`Filter`] over the node features, a weight, and a
/// label [`Compatibility`] ([`Potts`] unless replaced).
#[derive(Debug)]
pub struct FeaturePotential<F = Permutohedral> {
    filter: F,
    weight: f32,
    compatibility: Box<dyn Compatibility>,
    normalization: KernelNormalization,
    /// Per node factor applied to the filtered message, see [`KernelNormalization`].
    norm: Vec<f32>,
}

impl FeaturePotential<Permutohedral> {
    /// Builds a potential over `features` (`N x dim`, row-major) filtered with the
    /// permutohedral lattice.
    pub fn new(features: &[f32], dim: usize, weight: f32) -> CrfResult<Self> {
        Self::from_filter(Permutohedral::new(features, dim)?, weight)
    }
}

impl FeaturePotential<ExactGaussian> {
    /// Builds a potential over `features` evaluating the kernel sums exactly. Quadratic
    /// in the number of nodes.
    pub fn exact(features: &[f32], dim: usize, weight: f32) -> CrfResult<Self> {
        Self::from_filter(ExactGaussian::new(features, dim)?, weight)
    }
}

impl<F: Filter> FeaturePotential<F> {
    pub fn from_filter(filter: F, weight: f32) -> CrfResult<Self> {
        if !weight.is_finite() || weight < 0.0 {
            return Err(CrfError::ParameterError(format!(
                "pairwise weight must be finite and non negative, got {}",
                weight
            )));
        }
        debug!(
            "pairwise potential over {} nodes, {} feature dims, weight {}",
            filter.n_points(),
            filter.dim(),
            weight
        );
        Ok(FeaturePotential {
            norm: vec![1.0; filter.n_points()],
            filter,
            weight,
            compatibility: Box::new(Potts),
            normalization: KernelNormalization::Unnormalized,
        })
    }

    /// Replaces the label compatibility transform.
    pub fn with_compatibility(mut self, compatibility: Box<dyn Compatibility>) -> Self {
        self.compatibility = compatibility;
        self
    }

    /// Switches the kernel normalization, computing the per node factors once.
    pub fn with_normalization(mut self, normalization: KernelNormalization) -> CrfResult<Self> {
        let n = self.filter.n_points();
        self.norm = match normalization {
            KernelNormalization::Unnormalized => vec![1.0; n],
            _ => {
                let mut mass = vec![0.0f32; n];
                self.filter.apply(&vec![1.0f32; n], 1, &mut mass)?;
                mass.iter_mut()
                    .enumerate()
                    .for_each(|(i, m)| *m = (*m - self.filter.self_weight(i)).max(0.0));
                if normalization == KernelNormalization::PerNode {
                    mass.iter().map(|m| 1.0 / (m + f32::EPSILON)).collect()
                } else {
                    let total = mass.iter().sum::<f32>();
                    let factor = if total > 0.0 { n as f32 / total } else { 1.0 };
                    vec![factor; n]
                }
            }
        };
        self.normalization = normalization;
        Ok(self)
    }

    pub fn normalization(&self) -> KernelNormalization {
        self.normalization
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }
}

impl<F: Filter> PairwisePotential for FeaturePotential<F> {
    fn n_nodes(&self) -> usize {
        self.filter.n_points()
    }

    fn weight(&self) -> f32 {
        self.weight
    }

    fn apply(
        &self,
        distribution: &[f32],
        n_labels: usize,
        scratch: &mut [f32],
        energy: &mut [f32],
    ) -> CrfResult<()> {
        let expected = self.n_nodes() * n_labels;
        if energy.len() != expected || scratch.len() != expected {
            return Err(CrfError::ParameterError(format!(
                "energy and scratch buffers must hold {} values, got {} and {}",
                expected,
                energy.len(),
                scratch.len()
            )));
        }
        if let Some(k) = self.compatibility.n_labels() {
            if k != n_labels {
                return Err(CrfError::ParameterError(format!(
                    "compatibility built for {} labels applied to {} labels",
                    k, n_labels
                )));
            }
        }
        self.filter.apply(distribution, n_labels, scratch)?;

        energy
            .par_chunks_mut(n_labels)
            .zip(scratch.par_chunks_mut(n_labels))
            .zip(distribution.par_chunks(n_labels))
            .enumerate()
            .with_min_len(*PAR_MIN_ROWS)
            .for_each_init(
                || vec![0.0f32; n_labels],
                |penalty, (i, ((e, m), q))| {
                    // Drop the node's own contribution, mean-field only sees the others.
                    let s = self.filter.self_weight(i);
                    let norm = self.norm[i];
                    m.iter_mut()
                        .zip(q)
                        .for_each(|(m, q)| *m = norm * (*m - s * q));
                    self.compatibility.transform(q, m, penalty);
                    e.iter_mut()
                        .zip(penalty.iter())
                        .for_each(|(e, p)| *e += self.weight * p);
                },
            );
        Ok(())
    }
}
