//! Paths of every file in a run directory.
//!
//! ```text
//! <root>/
//!   the_task.txt  task.json  updater.json  run.json  manifest.json
//!   n_samples_per_update.txt
//!   distribution_initial_mean.txt  distribution_initial_covar.txt
//!   update00000/
//!     distribution_mean.txt  distribution_covar.txt  samples.txt
//!     distribution_new_mean.txt  distribution_new_covar.txt
//!     weights.txt  costs.txt  cost_eval.txt
//!     rollout_eval/  rollout001/ ...
//!       policy_parameters.txt  cost_vars.txt  cost.txt
//! ```

use sb_types::RolloutId;
use std::path::{Path, PathBuf};

pub const TASK_SNAPSHOT_FILE: &str = "the_task.txt";
pub const TASK_FILE: &str = "task.json";
pub const UPDATER_FILE: &str = "updater.json";
pub const RUN_FILE: &str = "run.json";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const BATCH_SIZE_FILE: &str = "n_samples_per_update.txt";
pub const POLICY_PARAMETERS_FILE: &str = "policy_parameters.txt";
pub const COST_VARS_FILE: &str = "cost_vars.txt";
pub const COST_FILE: &str = "cost.txt";

/// Which distribution of a step a file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionSlot {
    /// In effect when the step's samples were drawn.
    Start,
    /// Produced by closing the step.
    New,
}

impl DistributionSlot {
    fn prefix(&self) -> &'static str {
        match self {
            Self::Start => "distribution",
            Self::New => "distribution_new",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn initial_mean(&self) -> PathBuf {
        self.root.join("distribution_initial_mean.txt")
    }

    pub fn initial_covar(&self) -> PathBuf {
        self.root.join("distribution_initial_covar.txt")
    }

    pub fn step_dir(&self, step: usize) -> PathBuf {
        self.root.join(step_dir_name(step))
    }

    pub fn step_mean(&self, step: usize, slot: DistributionSlot) -> PathBuf {
        self.step_dir(step).join(format!("{}_mean.txt", slot.prefix()))
    }

    pub fn step_covar(&self, step: usize, slot: DistributionSlot) -> PathBuf {
        self.step_dir(step).join(format!("{}_covar.txt", slot.prefix()))
    }

    pub fn samples(&self, step: usize) -> PathBuf {
        self.step_dir(step).join("samples.txt")
    }

    pub fn weights(&self, step: usize) -> PathBuf {
        self.step_dir(step).join("weights.txt")
    }

    pub fn costs(&self, step: usize) -> PathBuf {
        self.step_dir(step).join("costs.txt")
    }

    pub fn cost_eval(&self, step: usize) -> PathBuf {
        self.step_dir(step).join("cost_eval.txt")
    }

    pub fn rollout_dir(&self, step: usize, rollout: RolloutId) -> PathBuf {
        self.step_dir(step).join(rollout.dir_name())
    }

    pub fn rollout_file(&self, step: usize, rollout: RolloutId, name: &str) -> PathBuf {
        self.rollout_dir(step, rollout).join(name)
    }
}

pub fn step_dir_name(step: usize) -> String {
    format!("update{step:05}")
}

/// Inverse of [`step_dir_name`]; `None` for anything that is not a step directory.
pub fn parse_step_dir_name(name: &str) -> Option<usize> {
    let digits = name.strip_prefix("update")?;
    if digits.len() < 5 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_paths_are_zero_padded() {
        let layout = RunLayout::new("/runs/a");
        assert_eq!(layout.step_dir(3), PathBuf::from("/runs/a/update00003"));
        assert_eq!(
            layout.step_mean(12, DistributionSlot::New),
            PathBuf::from("/runs/a/update00012/distribution_new_mean.txt")
        );
        assert_eq!(
            layout.rollout_file(0, RolloutId::Sample(7), COST_VARS_FILE),
            PathBuf::from("/runs/a/update00000/rollout007/cost_vars.txt")
        );
    }

    #[test]
    fn parses_step_dir_names() {
        assert_eq!(parse_step_dir_name("update00000"), Some(0));
        assert_eq!(parse_step_dir_name("update00042"), Some(42));
        assert_eq!(parse_step_dir_name("update123456"), Some(123456));
        assert_eq!(parse_step_dir_name("update1"), None);
        assert_eq!(parse_step_dir_name("rollout001"), None);
        assert_eq!(parse_step_dir_name("update0000x"), None);
    }
}
