//! Row-wise helpers over `N x K` label buffers.

use rayon::prelude::*;

use crate::{Label, PAR_MIN_ROWS};

/// Writes `softmax(-energy)` of every row into `out`.
///
/// Each row is shifted by its minimum energy before exponentiating, so a row whose
/// energies are all equal comes out uniform.
pub(crate) fn exp_and_normalize(out: &mut [f32], energy: &[f32], n_labels: usize) {
    out.par_chunks_mut(n_labels)
        .zip(energy.par_chunks(n_labels))
        .with_min_len(*PAR_MIN_ROWS)
        .for_each(|(q, e)| {
            let min = e.iter().copied().fold(f32::INFINITY, f32::min);
            let total = e.iter().map(|&v| (min - v).exp()).sum::<f32>();
            q.iter_mut()
                .zip(e)
                .for_each(|(qk, &v)| *qk = (min - v).exp() / total);
        });
}

/// Damps an update: `next = (1 - relax) * prev + relax * next`.
pub(crate) fn relax_toward(next: &mut [f32], prev: &[f32], relax: f32) {
    next.par_iter_mut()
        .zip(prev.par_iter())
        .with_min_len(*PAR_MIN_ROWS)
        .for_each(|(n, p)| *n = (1.0 - relax) * p + relax * *n);
}

/// Divides every row by its sum. Rows summing to zero become uniform.
pub fn renormalize(distribution: &mut [f32], n_labels: usize) {
    distribution
        .par_chunks_mut(n_labels)
        .with_min_len(*PAR_MIN_ROWS)
        .for_each(|row| {
            let total = row.iter().sum::<f32>();
            if total > 0.0 {
                row.iter_mut().for_each(|v| *v /= total);
            } else {
                row.fill(1.0 / n_labels as f32);
            }
        });
}

/// Index of the largest entry of each row, ties going to the lowest label.
pub(crate) fn argmax_rows(distribution: &[f32], n_labels: usize, out: &mut [Label]) {
    out.par_iter_mut()
        .zip(distribution.par_chunks(n_labels))
        .with_min_len(*PAR_MIN_ROWS)
        .for_each(|(label, row)| {
            let mut best = 0;
            for (k, &v) in row.iter().enumerate().skip(1) {
                if v > row[best] {
                    best = k;
                }
            }
            *label = best as Label;
        });
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_softmax_rows() {
        let energy = [0.0, 1.0, 2.0, 2.0];
        let mut out = vec![0.0; 4];
        exp_and_normalize(&mut out, &energy, 2);
        let e = (-1.0f32).exp();
        assert!((out[0] - 1.0 / (1.0 + e)).abs() < 1e-6);
        assert!((out[1] - e / (1.0 + e)).abs() < 1e-6);
        assert_eq!(out[2], 0.5);
        assert_eq!(out[3], 0.5);
    }

    #[test]
    fn test_large_energies_stay_finite() {
        let energy = [1.0e4, 1.0e4 + 1.0, -3.0e4];
        let mut out = vec![0.0; 3];
        exp_and_normalize(&mut out, &energy, 3);
        assert!(out.iter().all(|v| v.is_finite()));
        assert!((out[2] - 1.0).abs() < 1e-6);
    }

    #[rstest]
    #[case(0.5)]
    #[case(0.1)]
    fn test_relaxation_blends(#[case] relax: f32) {
        let energy = [0.0, 0.0];
        let prev = [1.0, 0.0];
        let mut out = vec![0.0; 2];
        exp_and_normalize(&mut out, &energy, 2);
        relax_toward(&mut out, &prev, relax);
        assert!((out[0] - ((1.0 - relax) + relax * 0.5)).abs() < 1e-6);
        assert!((out.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_renormalize() {
        let mut rows = vec![2.0, 2.0, 0.0, 0.0, 0.0, 0.0];
        renormalize(&mut rows, 3);
        assert_eq!(&rows[..3], &[0.5, 0.5, 0.0]);
        assert!(rows[3..].iter().all(|v| (*v - 1.0 / 3.0).abs() < 1e-7));
    }

    #[test]
    fn test_argmax_ties_go_low() {
        let rows = [0.25, 0.5, 0.25, 0.4, 0.2, 0.4, 0.1, 0.1, 0.8];
        let mut labels = vec![0; 3];
        argmax_rows(&rows, 3, &mut labels);
        assert_eq!(labels, vec![1, 0, 2]);
    }
}
