//! The step controller: one invocation closes the pending step (if any) and
//! opens the next one.
//!
//! Each invocation follows the same state machine:
//!
//! 1. **Resolve** the step to resume from the manifest, or by probing step
//!    directories for runs written without one.
//! 2. **Bootstrap** a fresh run, or **close** the resumed step: evaluate its
//!    rollouts, update the distribution and persist both.
//! 3. **Open** the next step: persist the distribution in effect, draw the
//!    batch and write one rollout directory per sample plus the evaluation
//!    rollout.
//!
//! The manifest is written last in every phase, so a process killed at any
//! point leaves it describing the last consistent state and the next
//! invocation redoes the incomplete work.

use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sb_store::{DistributionSlot, Manifest, RunStore};
use sb_types::{
    resumption_error, Cost, DistributionGaussian, ResumptionError, Rollout, RolloutId, SbResult,
    TaskError,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::bootstrap;
use crate::evaluator::evaluate_batch;
use crate::setup::RunSetup;

/// Where an invocation picks up the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePoint {
    /// No step has been opened yet.
    Uninitialized,
    /// Close this step, then open the one after it.
    Step(usize),
}

/// Result of closing a step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSummary {
    pub step: usize,
    pub eval_cost: Cost,
    pub costs: Vec<Cost>,
    pub weights: DVector<f64>,
    pub distribution_new: DistributionGaussian,
}

/// What one call to [`StepController::advance`] did.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvanceOutcome {
    /// The step that was opened.
    pub step: usize,
    pub samples_path: PathBuf,
    /// Regular rollouts plus the evaluation rollout.
    pub rollouts_required: usize,
    /// Present unless the run was bootstrapped by this call.
    pub closed: Option<StepSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepStatus {
    pub step: usize,
    pub closed: bool,
    pub eval_cost: Option<f64>,
    /// Largest eigenvalue of the covariance the step sampled from.
    pub max_eigenvalue: Option<f64>,
    pub pending_rollouts: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub root: PathBuf,
    pub manifest: Option<Manifest>,
    pub n_samples_per_update: usize,
    pub steps: Vec<StepStatus>,
}

/// Drives a run rooted at one directory.
#[derive(Debug, Clone)]
pub struct StepController {
    store: RunStore,
}

impl StepController {
    pub fn new<P: AsRef<Path>>(run_root: P) -> Self {
        Self {
            store: RunStore::new(run_root),
        }
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// Determine which step this invocation resumes.
    ///
    /// Without an explicit index this is the highest opened step. An explicit
    /// index may name that step or the one before it. Older steps already
    /// have later steps sampled from their result.
    pub fn resolve_step(&self, explicit: Option<usize>) -> SbResult<ResumePoint> {
        let highest_open = self.load_manifest()?.highest_open;
        if let Some(step) = highest_open {
            if !self.store.step_exists(step) {
                return Err(resumption_error!(
                    step,
                    "manifest records the step as open but {} is missing",
                    self.store.layout().rollout_dir(step, RolloutId::Eval).display()
                ));
            }
        }

        match (explicit, highest_open) {
            (None, None) => Ok(ResumePoint::Uninitialized),
            (None, Some(step)) => Ok(ResumePoint::Step(step)),
            (Some(requested), Some(open)) if requested == open || requested + 1 == open => {
                Ok(ResumePoint::Step(requested))
            }
            (Some(requested), highest_open) => Err(ResumptionError::StepOutOfRange {
                requested,
                highest_open,
            }
            .into()),
        }
    }

    /// Run one step of the loop.
    ///
    /// `setup` bootstraps the run when it is uninitialized. For a run that
    /// already exists the persisted setup is authoritative.
    pub fn advance(&self, setup: &RunSetup, step_index: Option<usize>) -> SbResult<AdvanceOutcome> {
        let resume = self.resolve_step(step_index)?;
        info!("Resolved {} to {:?}", self.store.root().display(), resume);

        let (setup, next_step, distribution, closed) = match resume {
            ResumePoint::Uninitialized => {
                bootstrap::prepare(&self.store, setup)?;
                (setup.clone(), 0, setup.initial_distribution.clone(), None)
            }
            ResumePoint::Step(step) => {
                let persisted = RunSetup::load(&self.store)?;
                if persisted != *setup {
                    warn!("Run was bootstrapped with a different setup; using the persisted one");
                }
                let summary = self.close_step(&persisted, step)?;
                let distribution = summary.distribution_new.clone();
                (persisted, step + 1, distribution, Some(summary))
            }
        };

        let samples_path = self.open_step(&setup, next_step, &distribution)?;
        Ok(AdvanceOutcome {
            step: next_step,
            samples_path,
            rollouts_required: setup.n_samples_per_update + 1,
            closed,
        })
    }

    /// Advance a run using only what is persisted under its root.
    pub fn resume(&self, step_index: Option<usize>) -> SbResult<AdvanceOutcome> {
        let setup = RunSetup::load(&self.store)?;
        self.advance(&setup, step_index)
    }

    /// Evaluate and update `step`. Nothing is written unless every rollout
    /// has been executed and the update succeeded.
    fn close_step(&self, setup: &RunSetup, step: usize) -> SbResult<StepSummary> {
        info!("Closing step {}", step);
        let batch_size = setup.n_samples_per_update;
        let distribution = self.store.read_step_distribution(step, DistributionSlot::Start)?;
        let samples = self.store.read_samples(step)?;
        if samples.shape() != (batch_size, distribution.dim()) {
            return Err(resumption_error!(
                step,
                "samples are {}x{}, expected {}x{}",
                samples.nrows(),
                samples.ncols(),
                batch_size,
                distribution.dim()
            ));
        }

        let (eval, rollouts) = self.store.load_rollouts(step, batch_size)?;
        check_rollout_parameters(step, &distribution, &samples, &eval, &rollouts)?;

        let task = setup.task.build()?;
        let evaluation = evaluate_batch(task.as_ref(), step, eval, rollouts)?;
        info!(
            "Evaluated {} rollouts of step {}",
            evaluation.rollouts.len() + 1,
            step
        );

        let updater = setup.updater.build()?;
        let update = updater.update_distribution(&distribution, &samples, &evaluation.costs)?;
        info!(
            "Updated distribution of step {} with {} updater",
            step,
            updater.name()
        );

        let eval_cost = evaluation
            .eval
            .cost
            .clone()
            .ok_or_else(|| resumption_error!(step, "evaluation rollout was not evaluated"))?;
        for rollout in &evaluation.rollouts {
            if let Some(cost) = &rollout.cost {
                self.store.write_cost(step, rollout.id, cost)?;
            }
        }
        self.store.write_cost(step, RolloutId::Eval, &eval_cost)?;
        self.store.write_costs(step, &evaluation.costs)?;
        self.store.write_cost_eval(step, &eval_cost)?;
        self.store.write_weights(step, &update.weights)?;
        self.store
            .write_step_distribution(step, DistributionSlot::New, &update.distribution)?;

        let mut manifest = self.load_manifest()?;
        manifest.mark_closed(step);
        self.store.write_manifest(&manifest)?;
        info!("Closed step {}: evaluation cost {}", step, eval_cost.total);

        Ok(StepSummary {
            step,
            eval_cost,
            costs: evaluation.costs,
            weights: update.weights,
            distribution_new: update.distribution,
        })
    }

    /// Persist everything the executor needs for `step`.
    fn open_step(
        &self,
        setup: &RunSetup,
        step: usize,
        distribution: &DistributionGaussian,
    ) -> SbResult<PathBuf> {
        let batch_size = setup.n_samples_per_update;
        let dir = self.store.create_step_dir(step)?;
        info!("Opening step {} in {}", step, dir.display());

        let samples = match self.reusable_samples(step, batch_size, distribution)? {
            Some(samples) => {
                debug!("Keeping the samples already drawn for step {}", step);
                samples
            }
            None => {
                let mut rng = sampling_rng(setup.seed, step);
                distribution.generate_samples(batch_size, &mut rng)
            }
        };

        self.store
            .write_step_distribution(step, DistributionSlot::Start, distribution)?;
        self.store.write_samples(step, &samples)?;
        self.store
            .write_policy_parameters(step, RolloutId::Eval, distribution.mean())?;
        for (i, row) in samples.row_iter().enumerate() {
            let parameters = row.transpose();
            self.store
                .write_policy_parameters(step, RolloutId::Sample(i + 1), &parameters)?;
        }

        let mut manifest = self.load_manifest()?;
        manifest.mark_open(step);
        self.store.write_manifest(&manifest)?;

        let samples_path = self.store.layout().samples(step);
        info!(
            "Wrote {} samples to {}; {} rollouts required",
            batch_size,
            samples_path.display(),
            batch_size + 1
        );
        Ok(samples_path)
    }

    /// Samples already on disk for `step`, if they were drawn from `distribution`.
    ///
    /// Samples drawn from a different distribution are discarded together with
    /// everything derived from them.
    fn reusable_samples(
        &self,
        step: usize,
        batch_size: usize,
        distribution: &DistributionGaussian,
    ) -> SbResult<Option<DMatrix<f64>>> {
        if !self.store.layout().samples(step).is_file() {
            return Ok(None);
        }

        if self.store.has_step_distribution(step, DistributionSlot::Start) {
            let stored = self.store.read_step_distribution(step, DistributionSlot::Start)?;
            let samples = self.store.read_samples(step)?;
            if stored == *distribution && samples.shape() == (batch_size, distribution.dim()) {
                return Ok(Some(samples));
            }
        }

        warn!(
            "Step {} was opened with a different distribution; discarding its samples and results",
            step
        );
        self.store.clear_step_outputs(step, batch_size)?;
        Ok(None)
    }

    /// Write `cost_vars` for every pending rollout of the open step using the
    /// task's own simulation. Returns the rollouts that were simulated.
    pub fn simulate_pending(&self) -> SbResult<Vec<RolloutId>> {
        let step = match self.load_manifest()?.highest_open {
            Some(step) => step,
            None => {
                return Err(ResumptionError::NotInitialized {
                    root: self.store.root().to_path_buf(),
                }
                .into())
            }
        };
        let setup = RunSetup::load(&self.store)?;
        let task = setup.task.build()?;

        let pending = self.store.pending_rollouts(step, setup.n_samples_per_update);
        for id in &pending {
            let parameters = self.store.read_policy_parameters(step, *id)?;
            let cost_vars = task.simulate(&parameters).ok_or_else(|| TaskError::InvalidConfig {
                message: format!("{:?} cannot be simulated in-process", setup.task),
            })?;
            self.store.write_cost_vars(step, *id, &cost_vars)?;
        }
        info!("Simulated {} rollouts of step {}", pending.len(), step);
        Ok(pending)
    }

    pub fn status(&self) -> SbResult<RunStatus> {
        let manifest = self.store.read_manifest()?;
        let n_samples_per_update = self.store.read_batch_size()?;

        let mut steps = Vec::new();
        for step in self.store.list_step_dirs()? {
            let closed = self.store.has_step_distribution(step, DistributionSlot::New);
            let max_eigenvalue = if self.store.has_step_distribution(step, DistributionSlot::Start) {
                Some(
                    self.store
                        .read_step_distribution(step, DistributionSlot::Start)?
                        .max_eigenvalue(),
                )
            } else {
                None
            };
            let pending_rollouts = if closed {
                Vec::new()
            } else {
                self.store
                    .pending_rollouts(step, n_samples_per_update)
                    .iter()
                    .map(RolloutId::to_string)
                    .collect()
            };
            steps.push(StepStatus {
                step,
                closed,
                eval_cost: self.store.read_cost_eval(step)?.map(|c| c.total),
                max_eigenvalue,
                pending_rollouts,
            });
        }

        Ok(RunStatus {
            root: self.store.root().to_path_buf(),
            manifest,
            n_samples_per_update,
            steps,
        })
    }

    /// The persisted manifest, or one reconstructed from the step directories
    /// for runs that predate it.
    fn load_manifest(&self) -> SbResult<Manifest> {
        if let Some(manifest) = self.store.read_manifest()? {
            return Ok(manifest);
        }
        let mut manifest = Manifest::new();
        if let Some(open) = self.store.scan_open_steps() {
            debug!("No manifest; scanned step directories up to {}", open);
            manifest.mark_open(open);
            if let Some(closed) = open.checked_sub(1) {
                manifest.mark_closed(closed);
            }
        }
        Ok(manifest)
    }
}

/// Step `k` of a seeded run always draws from stream `k` of the seed.
fn sampling_rng(seed: Option<u64>, step: usize) -> ChaCha8Rng {
    match seed {
        Some(seed) => {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            rng.set_stream(step as u64);
            rng
        }
        None => ChaCha8Rng::from_entropy(),
    }
}

/// The rollout directories must hold the parameters the step was opened with.
fn check_rollout_parameters(
    step: usize,
    distribution: &DistributionGaussian,
    samples: &DMatrix<f64>,
    eval: &Rollout,
    rollouts: &[Rollout],
) -> SbResult<()> {
    if eval.policy_parameters != *distribution.mean() {
        return Err(resumption_error!(
            step,
            "{} does not hold the distribution mean",
            eval.id
        ));
    }
    for (rollout, row) in rollouts.iter().zip(samples.row_iter()) {
        if rollout.policy_parameters != row.transpose() {
            return Err(resumption_error!(
                step,
                "{} does not match its row of samples",
                rollout.id
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TaskSpec, UpdaterSpec, WeightingMethod};
    use sb_types::SbError;
    use tempfile::tempdir;

    fn setup() -> RunSetup {
        RunSetup::new(
            TaskSpec::DistanceToPoint {
                point: vec![1.0, 1.0],
            },
            UpdaterSpec::Mean {
                eliteness: 10.0,
                weighting: WeightingMethod::PiBb,
            },
            DistributionGaussian::isotropic(DVector::zeros(2), 1.0).unwrap(),
            3,
        )
        .with_seed(3)
    }

    #[test]
    fn fresh_root_is_uninitialized() {
        let dir = tempdir().unwrap();
        let controller = StepController::new(dir.path());
        assert_eq!(controller.resolve_step(None).unwrap(), ResumePoint::Uninitialized);
    }

    #[test]
    fn explicit_index_is_bounded_by_the_open_step() {
        let dir = tempdir().unwrap();
        let controller = StepController::new(dir.path());
        let err = controller.resolve_step(Some(0)).unwrap_err();
        assert!(matches!(
            err,
            SbError::Resumption(ResumptionError::StepOutOfRange {
                requested: 0,
                highest_open: None
            })
        ));

        controller.advance(&setup(), None).unwrap();
        assert_eq!(controller.resolve_step(Some(0)).unwrap(), ResumePoint::Step(0));
        assert!(controller.resolve_step(Some(1)).is_err());
    }

    #[test]
    fn seeded_sampling_depends_on_step() {
        let distribution = DistributionGaussian::isotropic(DVector::zeros(2), 1.0).unwrap();
        let a = distribution.generate_samples(3, &mut sampling_rng(Some(9), 0));
        let b = distribution.generate_samples(3, &mut sampling_rng(Some(9), 0));
        let c = distribution.generate_samples(3, &mut sampling_rng(Some(9), 1));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn manifest_pointing_at_missing_step_is_an_error() {
        let dir = tempdir().unwrap();
        let controller = StepController::new(dir.path());
        let mut manifest = Manifest::new();
        manifest.mark_open(2);
        controller.store().write_manifest(&manifest).unwrap();

        let err = controller.resolve_step(None).unwrap_err();
        assert!(matches!(
            err,
            SbError::Resumption(ResumptionError::Inconsistent { step: 2, .. })
        ));
    }

    #[test]
    fn tampered_policy_parameters_are_detected() {
        let dir = tempdir().unwrap();
        let controller = StepController::new(dir.path());
        controller.advance(&setup(), None).unwrap();
        controller.simulate_pending().unwrap();
        controller
            .store()
            .write_policy_parameters(0, RolloutId::Sample(2), &DVector::from_element(2, 9.0))
            .unwrap();

        let err = controller.resume(None).unwrap_err();
        assert!(matches!(
            err,
            SbError::Resumption(ResumptionError::Inconsistent { step: 0, .. })
        ));
        assert!(!controller.store().layout().step_dir(1).exists());
    }
}
