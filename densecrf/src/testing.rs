use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use crate::Label;

/// Installs a `RUST_LOG` driven subscriber, once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn random_unary(n_nodes: usize, n_labels: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n_nodes * n_labels)
        .map(|_| rng.gen_range(0.0..4.0))
        .collect()
}

pub fn random_features(n_nodes: usize, dim: usize, spread: f32, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n_nodes * dim).map(|_| rng.gen_range(0.0..spread)).collect()
}

pub fn random_assignment(n_nodes: usize, n_labels: usize, seed: u64) -> Vec<Label> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n_nodes)
        .map(|_| rng.gen_range(0..n_labels) as Label)
        .collect()
}

/// Per node arg-min of a unary table, ties going to the lowest label.
pub fn unary_argmin(unary: &[f32], n_labels: usize) -> Vec<Label> {
    unary
        .chunks(n_labels)
        .map(|row| {
            let mut best = 0;
            for (k, &v) in row.iter().enumerate() {
                if v < row[best] {
                    best = k;
                }
            }
            best as Label
        })
        .collect()
}
