//! Label compatibility transforms.
//!
//! A pairwise potential first filters the current label distribution, producing for
//! every node `i` and label `l` the kernel weighted mass `m_i(l) = SUM_j k(f_i, f_j) Q_j(l)`
//! of the other nodes on label `l`. A [`Compatibility`] turns that mass into the penalty
//! paid by node `i` for each of its own labels:
//!
//! `penalty_i(k) = SUM_l mu(k, l) * m_i(l)`
//!
//! For mean-field to keep approximating a well posed energy, `mu` has to behave like a
//! semi-metric: non negative, symmetric and zero on the diagonal.

use std::fmt::{Debug, Formatter, Result as FmtResult};

use itertools::Itertools;
use tracing::warn;

use crate::{CrfError, CrfResult};

/// Trait implemented by label compatibility transforms. Implementations must be pure
/// functions of their inputs so repeated inference runs are reproducible.
pub trait Compatibility: Debug + Send + Sync {
    /// Computes the penalty of every label of a single node. `distribution` is the
    /// node's current label distribution, `filtered` the aggregated mass of its
    /// neighbours per label; all three slices have length `K`.
    fn transform(&self, distribution: &[f32], filtered: &[f32], out: &mut [f32]);

    /// The number of labels this transform was built for, `None` if it works for any.
    fn n_labels(&self) -> Option<usize> {
        None
    }
}

/// The Potts model: a node pays for all neighbouring mass that sits on another label.
#[derive(Debug, Clone, Copy, Default)]
pub struct Potts;

impl Compatibility for Potts {
    fn transform(&self, _distribution: &[f32], filtered: &[f32], out: &mut [f32]) {
        let total = filtered.iter().sum::<f32>();
        out.iter_mut()
            .zip(filtered)
            .for_each(|(o, f)| *o = total - f);
    }
}

/// A dense `K x K` compatibility matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelCompatibility {
    n_labels: usize,
    /// Row-major, `matrix[k * n_labels + l] = mu(k, l)`.
    matrix: Vec<f32>,
}

impl LabelCompatibility {
    /// Validates and wraps a row-major `K x K` matrix. The matrix must be finite, non
    /// negative, symmetric and zero on its diagonal. Violations of the triangle
    /// inequality are accepted but reported.
    pub fn new(n_labels: usize, matrix: Vec<f32>) -> CrfResult<Self> {
        if n_labels == 0 || matrix.len() != n_labels * n_labels {
            return Err(CrfError::ParameterError(format!(
                "compatibility matrix for {} labels needs {} entries, got {}",
                n_labels,
                n_labels * n_labels,
                matrix.len()
            )));
        }
        if let Some(pos) = matrix.iter().position(|v| !v.is_finite() || *v < 0.0) {
            return Err(CrfError::ParameterError(format!(
                "compatibility entry ({}, {}) = {} must be finite and non negative",
                pos / n_labels,
                pos % n_labels,
                matrix[pos]
            )));
        }
        let compat = LabelCompatibility { n_labels, matrix };
        for k in 0..n_labels {
            if compat.get(k, k) != 0.0 {
                return Err(CrfError::ParameterError(format!(
                    "compatibility of label {} with itself must be 0, got {}",
                    k,
                    compat.get(k, k)
                )));
            }
        }
        if let Some((k, l)) = (0..n_labels)
            .tuple_combinations()
            .find(|&(k, l)| (compat.get(k, l) - compat.get(l, k)).abs() > 1e-6)
        {
            return Err(CrfError::ParameterError(format!(
                "compatibility matrix is not symmetric: mu({k}, {l}) = {} but mu({l}, {k}) = {}",
                compat.get(k, l),
                compat.get(l, k)
            )));
        }
        if let Some((a, b, c)) = compat.triangle_violation() {
            warn!(
                "compatibility matrix violates the triangle inequality: \
                 mu({a}, {c}) > mu({a}, {b}) + mu({b}, {c}), mean-field may not converge"
            );
        }
        Ok(compat)
    }

    /// The Potts matrix `1 - I`.
    pub fn potts(n_labels: usize) -> CrfResult<Self> {
        let matrix = (0..n_labels)
            .cartesian_product(0..n_labels)
            .map(|(k, l)| if k == l { 0.0 } else { 1.0 })
            .collect_vec();
        Self::new(n_labels, matrix)
    }

    pub fn get(&self, k: usize, l: usize) -> f32 {
        self.matrix[k * self.n_labels + l]
    }

    /// First triple `(a, b, c)` with `mu(a, c) > mu(a, b) + mu(b, c)`, if any.
    pub fn triangle_violation(&self) -> Option<(usize, usize, usize)> {
        let n = self.n_labels;
        (0..n)
            .cartesian_product(0..n)
            .cartesian_product(0..n)
            .map(|((a, b), c)| (a, b, c))
            .find(|&(a, b, c)| self.get(a, c) > self.get(a, b) + self.get(b, c) + 1e-6)
    }
}

impl Compatibility for LabelCompatibility {
    fn transform(&self, _distribution: &[f32], filtered: &[f32], out: &mut [f32]) {
        for (k, o) in out.iter_mut().enumerate() {
            let row = &self.matrix[k * self.n_labels..(k + 1) * self.n_labels];
            *o = row.iter().zip(filtered).map(|(mu, f)| mu * f).sum();
        }
    }

    fn n_labels(&self) -> Option<usize> {
        Some(self.n_labels)
    }
}

/// Wraps a closure `(distribution, filtered, out)` into a [`Compatibility`].
#[derive(Clone)]
pub struct FnCompatibility<F> {
    name: String,
    f: F,
}

impl<F> FnCompatibility<F>
where
    F: Fn(&[f32], &[f32], &mut [f32]) + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        FnCompatibility {
            name: name.into(),
            f,
        }
    }
}

impl<F> Debug for FnCompatibility<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("FnCompatibility")
            .field("name", &self.name)
            .finish()
    }
}

impl<F> Compatibility for FnCompatibility<F>
where
    F: Fn(&[f32], &[f32], &mut [f32]) + Send + Sync,
{
    fn transform(&self, distribution: &[f32], filtered: &[f32], out: &mut [f32]) {
        (self.f)(distribution, filtered, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_potts_counts_cross_label_mass() {
        let mut out = vec![0.0; 3];
        Potts.transform(&[0.2, 0.3, 0.5], &[1.0, 2.0, 4.0], &mut out);
        assert_eq!(out, vec![6.0, 5.0, 3.0]);
    }

    #[test]
    fn test_potts_matrix_matches_potts() -> anyhow::Result<()> {
        let matrix = LabelCompatibility::potts(4)?;
        let filtered = [0.5, 1.5, 0.25, 3.0];
        let mut a = vec![0.0; 4];
        let mut b = vec![0.0; 4];
        matrix.transform(&[0.25; 4], &filtered, &mut a);
        Potts.transform(&[0.25; 4], &filtered, &mut b);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
        assert_eq!(matrix.n_labels(), Some(4));
        Ok(())
    }

    #[test]
    fn test_matrix_validation() {
        assert!(LabelCompatibility::new(2, vec![0.0, 1.0, 1.0]).is_err());
        assert!(LabelCompatibility::new(2, vec![0.0, 1.0, 2.0, 0.0]).is_err());
        assert!(LabelCompatibility::new(2, vec![1.0, 1.0, 1.0, 0.0]).is_err());
        assert!(LabelCompatibility::new(2, vec![0.0, -1.0, -1.0, 0.0]).is_err());
        assert!(LabelCompatibility::new(2, vec![0.0, 0.5, 0.5, 0.0]).is_ok());
    }

    #[test]
    fn test_triangle_violation_is_reported_not_rejected() -> anyhow::Result<()> {
        // mu(0, 2) = 5 > mu(0, 1) + mu(1, 2) = 2
        let matrix = vec![0.0, 1.0, 5.0, 1.0, 0.0, 1.0, 5.0, 1.0, 0.0];
        let compat = LabelCompatibility::new(3, matrix)?;
        assert_eq!(compat.triangle_violation(), Some((0, 1, 2)));
        assert_eq!(LabelCompatibility::potts(3)?.triangle_violation(), None);
        Ok(())
    }

    #[test]
    fn test_closure_compatibility() {
        let scaled = FnCompatibility::new("double potts", |q: &[f32], m: &[f32], out: &mut [f32]| {
            Potts.transform(q, m, out);
            out.iter_mut().for_each(|o| *o *= 2.0);
        });
        let mut out = vec![0.0; 2];
        scaled.transform(&[0.5, 0.5], &[1.0, 3.0], &mut out);
        assert_eq!(out, vec![6.0, 2.0]);
        assert!(format!("{:?}", scaled).contains("double potts"));
    }
}
