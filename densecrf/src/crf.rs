//! The mean-field inference engine.

use rayon::prelude::*;
use tracing::{debug, instrument, trace, warn};

use crate::{
    compatibility::Compatibility,
    config::{check_relax, InferenceConfig},
    normalize::{argmax_rows, exp_and_normalize, relax_toward},
    potential::{check_assignment, FeaturePotential, PairwisePotential},
    CrfError, CrfResult, Label, PAR_MIN_ROWS,
};

/// Lifecycle of a [`DenseCrf`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceState {
    /// Constructed, no unary energies yet.
    Unconfigured,
    /// Unary energies set; potentials may be added and inference started.
    Ready,
    /// Inference started, [`DenseCrf::step_inference`] may be called.
    Iterating,
}

/// A fully connected CRF over `n_nodes` nodes taking one of `n_labels` labels each.
///
/// The engine owns the unary table, every registered pairwise potential and the label
/// distribution buffers. Distributions are stored row-major, node-major and label-minor:
/// the `K` probabilities of node 0 first, then node 1 and so on.
#[derive(Debug)]
pub struct DenseCrf {
    n_nodes: usize,
    n_labels: usize,
    state: InferenceState,
    unary: Vec<f32>,
    /// Extra unary term added on top of `unary` during inference, zero unless set.
    additional_unary: Vec<f32>,
    /// Double buffered label distributions, `buffers[current]` is the live one.
    buffers: [Vec<f32>; 2],
    current: usize,
    /// Whether `buffers[current]` holds a distribution computed from the current unary.
    has_distribution: bool,
    /// Accumulates unary and pairwise energies during a step.
    energy: Vec<f32>,
    /// Working memory handed to the potentials.
    scratch: Vec<f32>,
    pairwise: Vec<Box<dyn PairwisePotential>>,
    n_steps: usize,
}

impl DenseCrf {
    pub fn new(n_nodes: usize, n_labels: usize) -> CrfResult<Self> {
        if n_nodes == 0 {
            return Err(CrfError::ParameterError(
                "a CRF needs at least one node".to_string(),
            ));
        }
        if n_labels == 0 || n_labels > Label::MAX as usize + 1 {
            return Err(CrfError::ParameterError(format!(
                "the number of labels must lie in [1, {}], got {}",
                Label::MAX as usize + 1,
                n_labels
            )));
        }
        let size = n_nodes * n_labels;
        Ok(DenseCrf {
            n_nodes,
            n_labels,
            state: InferenceState::Unconfigured,
            unary: vec![0.0; size],
            additional_unary: vec![0.0; size],
            buffers: [vec![0.0; size], vec![0.0; size]],
            current: 0,
            has_distribution: false,
            energy: vec![0.0; size],
            scratch: vec![0.0; size],
            pairwise: vec![],
            n_steps: 0,
        })
    }

    pub fn n_nodes(&self) -> usize {
        self.n_nodes
    }

    pub fn n_labels(&self) -> usize {
        self.n_labels
    }

    pub fn state(&self) -> InferenceState {
        self.state
    }

    /// Number of registered pairwise potentials.
    pub fn n_pairwise(&self) -> usize {
        self.pairwise.len()
    }

    /// Number of mean-field steps taken since the last [`DenseCrf::start_inference`].
    pub fn n_steps(&self) -> usize {
        self.n_steps
    }

    pub fn unary(&self) -> &[f32] {
        &self.unary
    }

    /// The current label distribution, if inference has been started since the unary
    /// energies were last set.
    pub fn distribution(&self) -> Option<&[f32]> {
        self.has_distribution
            .then(|| self.buffers[self.current].as_slice())
    }

    fn check_table(&self, table: &[f32], what: &str) -> CrfResult<()> {
        let expected = self.n_nodes * self.n_labels;
        if table.len() != expected {
            return Err(CrfError::ParameterError(format!(
                "{} must have {} x {} = {} entries, got {}",
                what,
                self.n_nodes,
                self.n_labels,
                expected,
                table.len()
            )));
        }
        if let Some(pos) = table.iter().position(|v| !v.is_finite()) {
            return Err(CrfError::ParameterError(format!(
                "{} entry for node {} label {} is not finite",
                what,
                pos / self.n_labels,
                pos % self.n_labels
            )));
        }
        Ok(())
    }

    /// Sets the unary energy of every node and label (lower is more likely). Can be
    /// called again at any time, which resets inference.
    pub fn set_unary(&mut self, unary: &[f32]) -> CrfResult<()> {
        self.check_table(unary, "unary table")?;
        self.unary.copy_from_slice(unary);
        self.state = InferenceState::Ready;
        self.has_distribution = false;
        self.n_steps = 0;
        Ok(())
    }

    /// Sets an extra unary term that is added to the unary table during inference
    /// without modifying it. It takes effect from the next initialisation or step.
    pub fn set_additional_unary(&mut self, additional: &[f32]) -> CrfResult<()> {
        self.check_table(additional, "additional unary table")?;
        self.additional_unary.copy_from_slice(additional);
        Ok(())
    }

    pub fn clear_additional_unary(&mut self) {
        self.additional_unary.fill(0.0);
    }

    fn check_can_add(&self) -> CrfResult<()> {
        match self.state {
            InferenceState::Ready => Ok(()),
            InferenceState::Unconfigured => Err(CrfError::StateError(
                "set the unary energies before adding pairwise potentials".to_string(),
            )),
            InferenceState::Iterating => Err(CrfError::StateError(
                "cannot add pairwise potentials while inference is running".to_string(),
            )),
        }
    }

    /// Adds a pairwise potential `w * mu(l_i, l_j) * exp(-0.5 * |f_i - f_j|^2)` over the
    /// `dim` dimensional `features` (one row per node, copied). The kernel shape is
    /// controlled by scaling the features beforehand. `compatibility` defaults to
    /// [`crate::Potts`].
    pub fn add_pairwise_energy(
        &mut self,
        features: &[f32],
        dim: usize,
        weight: f32,
        compatibility: Option<Box<dyn Compatibility>>,
    ) -> CrfResult<()> {
        self.check_can_add()?;
        if dim == 0 || features.len() != self.n_nodes * dim {
            return Err(CrfError::ParameterError(format!(
                "expected {} features of dimension {}, got a buffer of length {}",
                self.n_nodes,
                dim,
                features.len()
            )));
        }
        let mut potential = FeaturePotential::new(features, dim, weight)?;
        if let Some(compatibility) = compatibility {
            potential = potential.with_compatibility(compatibility);
        }
        self.add_pairwise_potential(Box::new(potential))
    }

    /// Registers a caller built potential, the engine takes ownership of it.
    pub fn add_pairwise_potential(
        &mut self,
        potential: Box<dyn PairwisePotential>,
    ) -> CrfResult<()> {
        self.check_can_add()?;
        if potential.n_nodes() != self.n_nodes {
            return Err(CrfError::ParameterError(format!(
                "potential was built for {} nodes, the CRF has {}",
                potential.n_nodes(),
                self.n_nodes
            )));
        }
        debug!(
            "registered pairwise potential #{}: {:?}",
            self.pairwise.len(),
            potential
        );
        self.pairwise.push(potential);
        Ok(())
    }

    /// Writes `unary + additional_unary` into the energy buffer.
    fn load_unary_energy(&mut self) {
        self.energy
            .par_iter_mut()
            .zip(self.unary.par_iter().zip(self.additional_unary.par_iter()))
            .with_min_len(*PAR_MIN_ROWS)
            .for_each(|(e, (u, a))| *e = u + a);
    }

    /// Initialises the label distribution with the softmax of the negated unary
    /// energies.
    pub fn start_inference(&mut self) -> CrfResult<()> {
        if self.state == InferenceState::Unconfigured {
            return Err(CrfError::StateError(
                "unary energies must be set before starting inference".to_string(),
            ));
        }
        self.load_unary_energy();
        exp_and_normalize(&mut self.buffers[self.current], &self.energy, self.n_labels);
        self.state = InferenceState::Iterating;
        self.has_distribution = true;
        self.n_steps = 0;
        debug!(
            "inference started: {} nodes, {} labels, {} pairwise potentials",
            self.n_nodes,
            self.n_labels,
            self.pairwise.len()
        );
        Ok(())
    }

    /// Performs one mean-field update. `relax` in `(0, 1]` blends the new distribution
    /// with the previous one, `1` taking the update as is.
    pub fn step_inference(&mut self, relax: f32) -> CrfResult<()> {
        if self.state != InferenceState::Iterating {
            return Err(CrfError::StateError(
                "start_inference must be called before step_inference".to_string(),
            ));
        }
        check_relax(relax)?;
        self.load_unary_energy();

        let [first, second] = &mut self.buffers;
        let (current, next) = if self.current == 0 {
            (&*first, second)
        } else {
            (&*second, first)
        };
        for potential in &self.pairwise {
            potential.apply(current, self.n_labels, &mut self.scratch, &mut self.energy)?;
        }
        exp_and_normalize(&mut next[..], &self.energy, self.n_labels);
        if relax < 1.0 {
            relax_toward(&mut next[..], current, relax);
        }

        self.current = 1 - self.current;
        self.n_steps += 1;
        trace!("mean-field step {} done (relax {})", self.n_steps, relax);
        Ok(())
    }

    /// Largest absolute change of any probability during the last step. `None` before
    /// the first step.
    pub fn last_change(&self) -> Option<f32> {
        if !self.has_distribution || self.n_steps == 0 {
            return None;
        }
        let change = self.buffers[0]
            .par_iter()
            .zip(self.buffers[1].par_iter())
            .map(|(a, b)| (a - b).abs())
            .reduce(|| 0.0, f32::max);
        Some(change)
    }

    fn run_inference(&mut self, n_iterations: usize, relax: f32) -> CrfResult<()> {
        check_relax(relax)?;
        if relax < 0.1 {
            warn!("relax {} damps every update heavily, inference will be slow", relax);
        }
        self.start_inference()?;
        for _ in 0..n_iterations {
            self.step_inference(relax)?;
        }
        self.state = InferenceState::Ready;
        Ok(())
    }

    /// Runs [`DenseCrf::start_inference`] and `n_iterations` steps, returning the final
    /// label distribution. The returned buffer belongs to the engine and stays valid
    /// until the next mutating call.
    #[instrument(level = "debug", skip(self), fields(nodes = self.n_nodes, labels = self.n_labels))]
    pub fn infer(&mut self, n_iterations: usize, relax: f32) -> CrfResult<&[f32]> {
        self.run_inference(n_iterations, relax)?;
        Ok(&self.buffers[self.current])
    }

    /// Like [`DenseCrf::infer`] but copies the distribution into `result`.
    pub fn infer_into(
        &mut self,
        n_iterations: usize,
        relax: f32,
        result: &mut [f32],
    ) -> CrfResult<()> {
        if result.len() != self.n_nodes * self.n_labels {
            return Err(CrfError::ParameterError(format!(
                "result buffer must hold {} values, got {}",
                self.n_nodes * self.n_labels,
                result.len()
            )));
        }
        let distribution = self.infer(n_iterations, relax)?;
        result.copy_from_slice(distribution);
        Ok(())
    }

    pub fn infer_with(&mut self, config: &InferenceConfig) -> CrfResult<&[f32]> {
        config.validate()?;
        self.infer(config.iterations, config.relax)
    }

    /// Runs inference and returns, per node, the label of highest marginal probability.
    /// This is the usual approximation of the MAP labelling, not the exact one.
    #[instrument(level = "debug", skip(self), fields(nodes = self.n_nodes, labels = self.n_labels))]
    pub fn decode(&mut self, n_iterations: usize, relax: f32) -> CrfResult<Vec<Label>> {
        self.run_inference(n_iterations, relax)?;
        self.current_map()
    }

    pub fn decode_with(&mut self, config: &InferenceConfig) -> CrfResult<Vec<Label>> {
        config.validate()?;
        self.decode(config.iterations, config.relax)
    }

    /// Arg-max labelling of the current distribution, ties going to the lowest label.
    pub fn current_map(&self) -> CrfResult<Vec<Label>> {
        let mut labels = vec![0; self.n_nodes];
        self.current_map_into(&mut labels)?;
        Ok(labels)
    }

    pub fn current_map_into(&self, result: &mut [Label]) -> CrfResult<()> {
        let distribution = self.distribution().ok_or_else(|| {
            CrfError::StateError("no label distribution, start inference first".to_string())
        })?;
        if result.len() != self.n_nodes {
            return Err(CrfError::ParameterError(format!(
                "result buffer must hold {} labels, got {}",
                self.n_nodes,
                result.len()
            )));
        }
        argmax_rows(distribution, self.n_labels, result);
        Ok(())
    }

    fn check_energy_query(&self, assignment: &[Label]) -> CrfResult<()> {
        if self.state == InferenceState::Unconfigured {
            return Err(CrfError::StateError(
                "unary energies must be set before evaluating energies".to_string(),
            ));
        }
        check_assignment(assignment, self.n_nodes, self.n_labels)
    }

    /// Unary energy of every node under a hard `assignment`. The additional unary term
    /// is not included.
    pub fn unary_energy(&self, assignment: &[Label]) -> CrfResult<Vec<f32>> {
        self.check_energy_query(assignment)?;
        Ok(assignment
            .iter()
            .enumerate()
            .map(|(i, &label)| self.unary[i * self.n_labels + label as usize])
            .collect())
    }

    /// Pairwise energy of every node under a hard `assignment`, half of each edge going
    /// to either endpoint. `term` restricts the sum to a single potential, `None` sums
    /// over all of them.
    pub fn pairwise_energy(
        &self,
        assignment: &[Label],
        term: Option<usize>,
    ) -> CrfResult<Vec<f32>> {
        self.check_energy_query(assignment)?;
        let selected: &[Box<dyn PairwisePotential>] = match term {
            None => &self.pairwise,
            Some(t) if t < self.pairwise.len() => &self.pairwise[t..t + 1],
            Some(t) => {
                return Err(CrfError::ParameterError(format!(
                    "pairwise term {} requested but only {} are registered",
                    t,
                    self.pairwise.len()
                )))
            }
        };
        let mut total = vec![0.0f32; self.n_nodes];
        for potential in selected {
            let energy = potential.energy(assignment, self.n_labels)?;
            total.iter_mut().zip(energy).for_each(|(t, e)| *t += e);
        }
        Ok(total)
    }

    /// Total unary plus pairwise energy of an assignment.
    pub fn total_energy(&self, assignment: &[Label]) -> CrfResult<f32> {
        let unary = self.unary_energy(assignment)?.iter().sum::<f32>();
        let pairwise = self.pairwise_energy(assignment, None)?.iter().sum::<f32>();
        Ok(unary + pairwise)
    }
}
