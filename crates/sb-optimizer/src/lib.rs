//! # sb-optimizer
//!
//! Black-box optimization one step per invocation: the task and updater
//! collaborators, batch evaluation, run bootstrap and the step controller
//! that ties them to a run directory.

pub mod bootstrap;
pub mod controller;
pub mod evaluator;
pub mod setup;
pub mod task;
pub mod updater;

pub use bootstrap::{prepare, RunDocument, RUN_SCHEMA_VERSION};
pub use controller::{AdvanceOutcome, ResumePoint, RunStatus, StepController, StepStatus, StepSummary};
pub use evaluator::{evaluate_batch, BatchEvaluation};
pub use setup::RunSetup;
pub use task::{DistanceToPoint, Task, TaskDocument, TaskSpec, Viapoint, TASK_SCHEMA_VERSION};
pub use updater::{
    costs_to_weights, UpdateResult, Updater, UpdaterCovarAdaptation, UpdaterCovarDecay,
    UpdaterDocument, UpdaterMean, UpdaterSpec, WeightingMethod, UPDATER_SCHEMA_VERSION,
};
