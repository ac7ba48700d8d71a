use sb_store::{RunStore, RUN_FILE, TASK_FILE, UPDATER_FILE};
use sb_types::{setup_error, DistributionGaussian, SbResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::bootstrap::{RunDocument, RUN_SCHEMA_VERSION};
use crate::task::{TaskDocument, TASK_SCHEMA_VERSION};
use crate::{TaskSpec, UpdaterDocument, UpdaterSpec, UPDATER_SCHEMA_VERSION};

/// Everything needed to start a run.
///
/// ```json
/// {
///   "task": {"type": "distance_to_point", "point": [1.0, 2.0]},
///   "updater": {"type": "covar_decay", "eliteness": 10, "weighting": "pi_bb", "decay": 0.8},
///   "initial_distribution": {"mean": [0.0, 0.0], "covar": [[1.0, 0.0], [0.0, 1.0]]},
///   "n_samples_per_update": 10,
///   "seed": 42
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSetup {
    pub task: TaskSpec,
    pub updater: UpdaterSpec,
    pub initial_distribution: DistributionGaussian,
    pub n_samples_per_update: usize,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl RunSetup {
    pub fn new(
        task: TaskSpec,
        updater: UpdaterSpec,
        initial_distribution: DistributionGaussian,
        n_samples_per_update: usize,
    ) -> Self {
        Self {
            task,
            updater,
            initial_distribution,
            n_samples_per_update,
            seed: None,
        }
    }

    /// Make sampling reproducible: step `k` draws from stream `k` of this seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> SbResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| setup_error!("cannot read {}: {e}", path.display()))?;
        serde_json::from_str(&text).map_err(|e| setup_error!("invalid setup {}: {e}", path.display()))
    }

    /// Check everything that can be checked before touching the run root.
    pub fn validate(&self) -> SbResult<()> {
        if self.n_samples_per_update == 0 {
            return Err(setup_error!("n_samples_per_update must be at least 1"));
        }
        self.task
            .build()
            .map_err(|e| setup_error!("invalid task: {e}"))?;
        self.updater
            .build()
            .map_err(|e| setup_error!("invalid updater: {e}"))?;

        let dim = self.initial_distribution.dim();
        if let Some(expected) = self.task.parameter_dim() {
            if expected != dim {
                return Err(setup_error!(
                    "task expects {expected} parameters but the initial distribution has dimension {dim}"
                ));
            }
        }
        Ok(())
    }

    /// Recover the setup persisted by bootstrap.
    pub fn load(store: &RunStore) -> SbResult<Self> {
        let task: TaskDocument = store.read_document(TASK_FILE, TASK_SCHEMA_VERSION)?;
        let updater: UpdaterDocument = store.read_document(UPDATER_FILE, UPDATER_SCHEMA_VERSION)?;
        let run: RunDocument = store.read_document(RUN_FILE, RUN_SCHEMA_VERSION)?;
        Ok(Self {
            task: task.task,
            updater: updater.updater,
            initial_distribution: store.read_initial_distribution()?,
            n_samples_per_update: store.read_batch_size()?,
            seed: run.seed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WeightingMethod;
    use nalgebra::DVector;
    use sb_types::SbError;

    fn setup(dim: usize) -> RunSetup {
        RunSetup::new(
            TaskSpec::DistanceToPoint {
                point: vec![1.0, 2.0],
            },
            UpdaterSpec::Mean {
                eliteness: 10.0,
                weighting: WeightingMethod::PiBb,
            },
            DistributionGaussian::isotropic(DVector::zeros(dim), 1.0).unwrap(),
            5,
        )
    }

    #[test]
    fn valid_setup_passes() {
        assert!(setup(2).with_seed(1).validate().is_ok());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut bad = setup(2);
        bad.n_samples_per_update = 0;
        assert!(matches!(bad.validate(), Err(SbError::Setup(_))));
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let err = setup(3).validate().unwrap_err();
        assert!(err.to_string().contains("expects 2 parameters"));
    }

    #[test]
    fn setup_json_round_trip() {
        let json = r#"{
            "task": {"type": "distance_to_point", "point": [1.0, 2.0]},
            "updater": {"type": "mean", "eliteness": 10, "weighting": "pi_bb"},
            "initial_distribution": {"mean": [0.0, 0.0], "covar": [[1.0, 0.0], [0.0, 1.0]]},
            "n_samples_per_update": 5
        }"#;
        let parsed: RunSetup = serde_json::from_str(json).unwrap();
        assert_eq!(parsed, setup(2));

        let back: RunSetup = serde_json::from_str(&serde_json::to_string(&parsed).unwrap()).unwrap();
        assert_eq!(back, parsed);
    }

    #[test]
    fn invalid_covariance_fails_to_parse() {
        let json = r#"{
            "task": {"type": "distance_to_point", "point": [1.0]},
            "updater": {"type": "mean", "eliteness": 10, "weighting": "pi_bb"},
            "initial_distribution": {"mean": [0.0], "covar": [[-1.0]]},
            "n_samples_per_update": 5
        }"#;
        assert!(serde_json::from_str::<RunSetup>(json).is_err());
    }
}
