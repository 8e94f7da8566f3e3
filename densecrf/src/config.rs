//! Run parameters for mean-field inference.

use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::{CrfError, CrfResult};

/// How many mean-field steps to take and how strongly to damp each of them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Number of calls to [`crate::DenseCrf::step_inference`] after initialisation.
    /// `0` returns the softmax of the unary energies.
    pub iterations: usize,
    /// Relaxation factor in `(0, 1]`, `1` disables damping.
    pub relax: f32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            iterations: 5,
            relax: 1.0,
        }
    }
}

impl InferenceConfig {
    pub fn new(iterations: usize, relax: f32) -> Self {
        Self { iterations, relax }
    }

    pub fn validate(&self) -> CrfResult<()> {
        check_relax(self.relax)
    }

    /// Reads a JSON encoded configuration, missing fields take their default value.
    pub fn from_reader<R: Read>(reader: R) -> CrfResult<Self> {
        let config: InferenceConfig = serde_json::from_reader(reader).map_err(|e| {
            CrfError::ParameterError(format!("could not parse inference config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }
}

pub(crate) fn check_relax(relax: f32) -> CrfResult<()> {
    if relax > 0.0 && relax <= 1.0 {
        Ok(())
    } else {
        Err(CrfError::ParameterError(format!(
            "relax must lie in (0, 1], got {}",
            relax
        )))
    }
}
