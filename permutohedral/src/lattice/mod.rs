//! Sparse permutohedral lattice.
//!
//! Every feature point is lifted onto the hyperplane `H_d = { x in R^(d+1) : SUM x = 0 }`,
//! where the permutohedral lattice `A*_d` tiles space with congruent simplices. A point
//! is represented by the `d + 1` vertices of its enclosing simplex together with its
//! barycentric coordinates. Filtering then is:
//!
//! 1. splat: accumulate every point's signal onto its vertices, weighted barycentrically,
//! 2. blur: convolve along each of the `d + 1` lattice axes with `[1/2, 1, 1/2]`,
//! 3. slice: read the blurred values back at every point, again barycentrically.
//!
//! Only vertices touched by at least one point are materialised, so the cost of a pass
//! is linear in `N * (d + 1)` rather than quadratic in `N`.

mod hash;

use std::collections::BTreeMap;

use itertools::Itertools;
use rayon::prelude::*;
use tracing::debug;

use crate::{check_features, check_signal, Filter, FilterError};
use hash::HashTable;

/// Index reserved for missing blur neighbours. Vertex `v` is stored at index `v + 1` in
/// the value buffers, slot `0` always holds zeros.
const MISSING: usize = 0;

/// Bound on the partial sums of lattice coordinates, keeps every key inside `i32`.
const MAX_COORDINATE: f32 = (i32::MAX / 2) as f32;

#[derive(Debug, Clone)]
pub struct Permutohedral {
    n_points: usize,
    dim: usize,
    /// Number of lattice vertices touched by the points.
    n_vertices: usize,
    /// `n_points x (dim + 1)` vertex indices, already shifted by one.
    offsets: Vec<usize>,
    /// `n_points x (dim + 1)` barycentric weights matching `offsets`.
    barycentric: Vec<f32>,
    /// `(dim + 1) x n_vertices` pairs of shifted neighbour indices, one pair per axis.
    blur_neighbors: Vec<(usize, usize)>,
    /// Output scaling compensating the blur's mass gain.
    alpha: f32,
    /// Response of every point to a unit signal placed on itself.
    self_response: Vec<f32>,
}

/// Per point scratch space used while embedding points in the lattice.
struct Embedding {
    elevated: Vec<f32>,
    rem0: Vec<i32>,
    rank: Vec<i32>,
    barycentric: Vec<f32>,
    key: Vec<i32>,
}

impl Embedding {
    fn new(d: usize) -> Self {
        Embedding {
            elevated: vec![0.0; d + 1],
            rem0: vec![0; d + 1],
            rank: vec![0; d + 1],
            barycentric: vec![0.0; d + 2],
            key: vec![0; d + 1],
        }
    }
}

impl Permutohedral {
    /// Builds the lattice for `features.len() / dim` points of dimension `dim`.
    pub fn new(features: &[f32], dim: usize) -> Result<Self, FilterError> {
        let n_points = check_features(features, dim)?;
        let d = dim;
        let d1 = d + 1;

        // Scale so that the blur approximates a unit variance Gaussian.
        let inv_std_dev = (2.0f32 / 3.0).sqrt() * d1 as f32;
        let scale_factor = (0..d)
            .map(|i| inv_std_dev / (((i + 1) * (i + 2)) as f32).sqrt())
            .collect_vec();
        let canonical = canonical_simplex(d);

        let mut table = HashTable::new(d, n_points * d1);
        let mut offsets = vec![0usize; n_points * d1];
        let mut barycentric = vec![0.0f32; n_points * d1];
        let mut emb = Embedding::new(d);

        for (k, point) in features.chunks(d).enumerate() {
            let reach = d1 as f32
                * point
                    .iter()
                    .zip(&scale_factor)
                    .map(|(f, s)| (f * s).abs())
                    .sum::<f32>();
            if reach * d1 as f32 >= MAX_COORDINATE {
                return Err(FilterError::ParameterError(format!(
                    "point {} is too far from the origin to be embedded in the lattice \
                     (scaled magnitude {})",
                    k, reach
                )));
            }
            embed_point(point, &scale_factor, &mut emb);
            for remainder in 0..d1 {
                for i in 0..d {
                    emb.key[i] = emb.rem0[i] + canonical[remainder * d1 + emb.rank[i] as usize];
                }
                offsets[k * d1 + remainder] = table.find_or_insert(&emb.key) + 1;
                barycentric[k * d1 + remainder] = emb.barycentric[remainder];
            }
        }

        let n_vertices = table.len();
        let blur_neighbors = blur_neighbors(&table, d);
        debug!(
            "permutohedral lattice: {} points of dim {} mapped to {} vertices",
            n_points, d, n_vertices
        );

        let mut lattice = Permutohedral {
            n_points,
            dim,
            n_vertices,
            offsets,
            barycentric,
            blur_neighbors,
            alpha: 1.0 / (1.0 + 2f32.powi(-(d as i32))),
            self_response: vec![],
        };
        let self_response: Vec<f32> = (0..n_points)
            .into_par_iter()
            .map(|i| lattice.own_response(i))
            .collect();
        lattice.self_response = self_response;
        Ok(lattice)
    }

    /// Filters a unit signal on point `i` and reads the result back at `i`, touching
    /// only the vertices the signal reaches.
    ///
    /// Every per-axis blur is symmetric, so `s^T B_d ... B_0 s` is evaluated as the dot
    /// product of `B_(h-1) ... B_0 s` and `B_h ... B_d s`, which keeps both supports
    /// around the square root of the full one.
    fn own_response(&self, i: usize) -> f32 {
        let d1 = self.dim + 1;
        let mut splat = BTreeMap::new();
        for j in i * d1..(i + 1) * d1 {
            *splat.entry(self.offsets[j]).or_insert(0.0) += self.barycentric[j];
        }
        let half = d1 / 2;
        let forward = (0..half).fold(splat.clone(), |acc, axis| self.blur_sparse(axis, &acc));
        let backward = (half..d1)
            .rev()
            .fold(splat, |acc, axis| self.blur_sparse(axis, &acc));
        backward
            .iter()
            .filter_map(|(v, b)| forward.get(v).map(|f| f * b))
            .sum::<f32>()
            * self.alpha
    }

    /// One blur pass along `axis` over a sparse set of shifted vertex values.
    fn blur_sparse(&self, axis: usize, values: &BTreeMap<usize, f32>) -> BTreeMap<usize, f32> {
        let neighbors = &self.blur_neighbors[axis * self.n_vertices..];
        let mut out = BTreeMap::new();
        for (&v, &x) in values {
            *out.entry(v).or_insert(0.0) += x;
            let (n1, n2) = neighbors[v - 1];
            for n in [n1, n2] {
                if n != MISSING {
                    *out.entry(n).or_insert(0.0) += 0.5 * x;
                }
            }
        }
        out
    }

    /// Number of lattice vertices the points were splatted onto.
    pub fn n_vertices(&self) -> usize {
        self.n_vertices
    }

    fn splat(&self, input: &[f32], value_size: usize, values: &mut [f32]) {
        let d1 = self.dim + 1;
        // Sequential on purpose: the accumulation order fixes the rounding.
        for (i, signal) in input.chunks(value_size).enumerate() {
            for j in 0..d1 {
                let o = self.offsets[i * d1 + j] * value_size;
                let w = self.barycentric[i * d1 + j];
                values[o..o + value_size]
                    .iter_mut()
                    .zip(signal)
                    .for_each(|(v, s)| *v += w * s);
            }
        }
    }

    fn blur(&self, value_size: usize, values: &mut Vec<f32>, scratch: &mut Vec<f32>) {
        let m = self.n_vertices;
        for axis in 0..=self.dim {
            let neighbors = &self.blur_neighbors[axis * m..(axis + 1) * m];
            let old = &*values;
            scratch[value_size..]
                .par_chunks_mut(value_size)
                .zip(neighbors.par_iter())
                .enumerate()
                .for_each(|(i, (new, &(n1, n2)))| {
                    let own = &old[(i + 1) * value_size..(i + 2) * value_size];
                    let left = &old[n1 * value_size..(n1 + 1) * value_size];
                    let right = &old[n2 * value_size..(n2 + 1) * value_size];
                    for k in 0..value_size {
                        new[k] = own[k] + 0.5 * (left[k] + right[k]);
                    }
                });
            std::mem::swap(values, scratch);
        }
    }

    fn slice(&self, values: &[f32], value_size: usize, output: &mut [f32]) {
        let d1 = self.dim + 1;
        output
            .par_chunks_mut(value_size)
            .enumerate()
            .for_each(|(i, out)| {
                out.fill(0.0);
                for j in 0..d1 {
                    let o = self.offsets[i * d1 + j] * value_size;
                    let w = self.barycentric[i * d1 + j] * self.alpha;
                    out.iter_mut()
                        .zip(&values[o..o + value_size])
                        .for_each(|(acc, v)| *acc += w * v);
                }
            });
    }
}

impl Filter for Permutohedral {
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
        let len = (self.n_vertices + 1) * value_size;
        let mut values = vec![0.0f32; len];
        let mut scratch = vec![0.0f32; len];
        self.splat(input, value_size, &mut values);
        self.blur(value_size, &mut values, &mut scratch);
        self.slice(&values, value_size, output);
        Ok(())
    }

    /// Computed once at construction, see `own_response`.
    fn self_weight(&self, i: usize) -> f32 {
        self.self_response[i]
    }
}

/// Coordinates of the canonical simplex: row `i` holds vertex `i`, whose coordinates
/// are `i` for the first `d + 1 - i` entries and `i - (d + 1)` for the rest.
fn canonical_simplex(d: usize) -> Vec<i32> {
    let d1 = d + 1;
    let mut canonical = vec![0i32; d1 * d1];
    for i in 0..d1 {
        for j in 0..d1 {
            canonical[i * d1 + j] = if j <= d - i {
                i as i32
            } else {
                i as i32 - d1 as i32
            };
        }
    }
    canonical
}

/// Finds the enclosing simplex of `point` and its barycentric coordinates.
fn embed_point(point: &[f32], scale_factor: &[f32], emb: &mut Embedding) {
    let d = point.len();
    let d1 = d + 1;
    let down_factor = 1.0 / d1 as f32;

    // Elevate onto H_d.
    let mut sm = 0.0f32;
    for j in (1..=d).rev() {
        let cf = point[j - 1] * scale_factor[j - 1];
        emb.elevated[j] = sm - j as f32 * cf;
        sm += cf;
    }
    emb.elevated[0] = sm;

    // Closest remainder-0 lattice point.
    let mut sum = 0i32;
    for i in 0..d1 {
        let v = down_factor * emb.elevated[i];
        let up = v.ceil() * d1 as f32;
        let down = v.floor() * d1 as f32;
        emb.rem0[i] = if up - emb.elevated[i] < emb.elevated[i] - down {
            up as i32
        } else {
            down as i32
        };
        sum += emb.rem0[i];
    }
    sum /= d1 as i32;

    // Rank the differential, i.e. the permutation sorting it in decreasing order.
    emb.rank.fill(0);
    for i in 0..d {
        let di = emb.elevated[i] - emb.rem0[i] as f32;
        for j in i + 1..d1 {
            if di < emb.elevated[j] - emb.rem0[j] as f32 {
                emb.rank[i] += 1;
            } else {
                emb.rank[j] += 1;
            }
        }
    }

    // Bring the remainder-0 point back onto the hyperplane if it left it.
    for i in 0..d1 {
        emb.rank[i] += sum;
        if emb.rank[i] < 0 {
            emb.rank[i] += d1 as i32;
            emb.rem0[i] += d1 as i32;
        } else if emb.rank[i] > d as i32 {
            emb.rank[i] -= d1 as i32;
            emb.rem0[i] -= d1 as i32;
        }
    }

    emb.barycentric.fill(0.0);
    for i in 0..d1 {
        let v = (emb.elevated[i] - emb.rem0[i] as f32) * down_factor;
        let r = emb.rank[i] as usize;
        emb.barycentric[d - r] += v;
        emb.barycentric[d - r + 1] -= v;
    }
    emb.barycentric[0] += 1.0 + emb.barycentric[d1];
}

/// For each axis and each vertex, the shifted indices of its two neighbours along the
/// axis, or [`MISSING`] when no point touched them.
fn blur_neighbors(table: &HashTable, d: usize) -> Vec<(usize, usize)> {
    let m = table.len();
    let mut neighbors = vec![(MISSING, MISSING); (d + 1) * m];
    let mut n1 = vec![0i32; d + 1];
    let mut n2 = vec![0i32; d + 1];
    for i in 0..m {
        let key = table.key(i);
        for axis in 0..=d {
            for k in 0..d {
                n1[k] = key[k] - 1;
                n2[k] = key[k] + 1;
            }
            n1[axis] = if axis < d { key[axis] + d as i32 } else { 0 };
            n2[axis] = if axis < d { key[axis] - d as i32 } else { 0 };
            neighbors[axis * m + i] = (
                table.find(&n1).map_or(MISSING, |v| v + 1),
                table.find(&n2).map_or(MISSING, |v| v + 1),
            );
        }
    }
    neighbors
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use rstest::rstest;

    use super::*;
    use crate::ExactGaussian;

    fn random_features(n: usize, dim: usize, spread: f32, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n * dim).map(|_| rng.gen_range(0.0..spread)).collect()
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(3)]
    #[case(5)]
    fn test_barycentric_weights_are_convex(#[case] dim: usize) -> anyhow::Result<()> {
        let features = random_features(200, dim, 10.0, 7);
        let lattice = Permutohedral::new(&features, dim)?;
        for point in lattice.barycentric.chunks(dim + 1) {
            assert!(point.iter().all(|&b| b >= -1e-5), "{:?}", point);
            assert!((point.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        }
        Ok(())
    }

    #[test]
    fn test_identical_points_share_output() -> anyhow::Result<()> {
        let features = [0.3, 1.2, 0.3, 1.2, 5.0, -2.0];
        let lattice = Permutohedral::new(&features, 2)?;
        let mut out = vec![0.0; 3];
        lattice.apply(&[1.0, 2.0, 3.0], 1, &mut out)?;
        assert_eq!(out[0], out[1]);
        assert!(out.iter().all(|o| *o > 0.0));
        Ok(())
    }

    #[test]
    fn test_distant_clusters_do_not_interact() -> anyhow::Result<()> {
        let features = [0.0, 0.0, 0.2, 0.1, 100.0, 100.0, 100.3, 99.9];
        let lattice = Permutohedral::new(&features, 2)?;
        let mut out = vec![0.0; 4];
        lattice.apply(&[1.0, 1.0, 0.0, 0.0], 1, &mut out)?;
        assert!(out[0] > 0.0 && out[1] > 0.0);
        assert_eq!(out[2], 0.0);
        assert_eq!(out[3], 0.0);
        Ok(())
    }

    #[test]
    fn test_filter_is_linear_and_deterministic() -> anyhow::Result<()> {
        let features = random_features(300, 3, 4.0, 11);
        let lattice = Permutohedral::new(&features, 3)?;
        let a = random_features(300, 2, 1.0, 12);
        let b = random_features(300, 2, 1.0, 13);
        let sum = a.iter().zip(&b).map(|(x, y)| x + y).collect_vec();

        let mut out_a = vec![0.0; 600];
        let mut out_b = vec![0.0; 600];
        let mut out_sum = vec![0.0; 600];
        lattice.apply(&a, 2, &mut out_a)?;
        lattice.apply(&b, 2, &mut out_b)?;
        lattice.apply(&sum, 2, &mut out_sum)?;
        for i in 0..600 {
            assert!((out_a[i] + out_b[i] - out_sum[i]).abs() < 1e-3 * out_sum[i].max(1.0));
        }

        let mut again = vec![0.0; 600];
        lattice.apply(&a, 2, &mut again)?;
        assert_eq!(again, out_a);
        Ok(())
    }

    #[test]
    fn test_tracks_exact_filter_shape() -> anyhow::Result<()> {
        // A dense 1D chain: the lattice response should be strongly correlated with the
        // exact kernel sum, up to a global scale.
        let features = (0..200).map(|i| i as f32 * 0.05).collect_vec();
        let lattice = Permutohedral::new(&features, 1)?;
        let exact = ExactGaussian::new(&features, 1)?;
        let signal = (0..200).map(|i| if i < 100 { 1.0 } else { 0.0 }).collect_vec();
        let mut approx = vec![0.0; 200];
        let mut truth = vec![0.0; 200];
        lattice.apply(&signal, 1, &mut approx)?;
        exact.apply(&signal, 1, &mut truth)?;

        let ratio = approx.iter().sum::<f32>() / truth.iter().sum::<f32>();
        let err = approx
            .iter()
            .zip(&truth)
            .map(|(a, t)| (a / ratio - t).abs())
            .fold(0.0f32, f32::max);
        let peak = truth.iter().copied().fold(0.0f32, f32::max);
        assert!(err < 0.25 * peak, "max error {} vs peak {}", err, peak);
        Ok(())
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(5)]
    fn test_self_weight_is_own_response(#[case] dim: usize) -> anyhow::Result<()> {
        let n = 40;
        let features = random_features(n, dim, 3.0, 3);
        let lattice = Permutohedral::new(&features, dim)?;
        let mut unit = vec![0.0; n];
        let mut out = vec![0.0; n];
        for i in 0..n {
            unit.fill(0.0);
            unit[i] = 1.0;
            lattice.apply(&unit, 1, &mut out)?;
            let w = lattice.self_weight(i);
            assert!(w > 0.0);
            assert!((out[i] - w).abs() < 1e-5, "point {}: {} vs {}", i, out[i], w);
        }
        Ok(())
    }

    #[test]
    fn test_isolated_points_only_see_themselves() -> anyhow::Result<()> {
        let lattice = Permutohedral::new(&[0.0, 1000.0], 1)?;
        let mut out = vec![0.0; 2];
        lattice.apply(&[1.0, 1.0], 1, &mut out)?;
        for (i, o) in out.iter().enumerate() {
            assert!((o - lattice.self_weight(i)).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_rejects_coordinates_beyond_lattice_range() -> anyhow::Result<()> {
        assert!(matches!(
            Permutohedral::new(&[0.0, 3.0e9], 1),
            Err(FilterError::ParameterError(_))
        ));
        assert!(Permutohedral::new(&[1.0, 2.0, -4.0e9, 0.5], 2).is_err());
        let far = Permutohedral::new(&[0.0, 1.0e6], 1)?;
        assert_eq!(far.n_points(), 2);
        Ok(())
    }

    #[test]
    fn test_canonical_simplex() {
        assert_eq!(canonical_simplex(2), vec![0, 0, 0, 1, 1, -2, 2, -1, -1]);
    }
}
