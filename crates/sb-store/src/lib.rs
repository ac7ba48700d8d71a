//! # sb-store
//!
//! The run directory is both the durable state of an optimization run and
//! the channel through which an external executor receives policy
//! parameters and returns `cost_vars`. This crate owns its layout, the
//! numeric file format and the atomic-write discipline.

pub mod array_io;
pub mod atomic;
pub mod layout;
pub mod manifest;
pub mod store;

pub use array_io::{read_matrix, read_vector, write_matrix, write_vector, ARRAY_FORMAT_VERSION};
pub use atomic::write_atomic;
pub use layout::{
    step_dir_name, DistributionSlot, RunLayout, BATCH_SIZE_FILE, COST_FILE, COST_VARS_FILE,
    MANIFEST_FILE, POLICY_PARAMETERS_FILE, RUN_FILE, TASK_FILE, TASK_SNAPSHOT_FILE, UPDATER_FILE,
};
pub use manifest::{Manifest, MANIFEST_SCHEMA_VERSION};
pub use store::RunStore;
