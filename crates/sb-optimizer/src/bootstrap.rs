use chrono::{DateTime, Utc};
use sb_store::{Manifest, RunStore, RUN_FILE, TASK_FILE, TASK_SNAPSHOT_FILE, UPDATER_FILE};
use sb_types::{setup_error, SbResult};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::setup::RunSetup;
use crate::task::TaskDocument;
use crate::updater::UpdaterDocument;

pub const RUN_SCHEMA_VERSION: u32 = 1;

/// `run.json` contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDocument {
    pub schema_version: u32,
    pub run_id: Uuid,
    #[serde(default)]
    pub seed: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl RunDocument {
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            schema_version: RUN_SCHEMA_VERSION,
            run_id: Uuid::new_v4(),
            seed,
            created_at: Utc::now(),
        }
    }
}

/// Write the run-level files of a new run.
///
/// The setup is validated before anything is written. The manifest goes last,
/// so a run root without one has not finished bootstrapping. Calling this on
/// an existing root overwrites its bootstrap files.
pub fn prepare(store: &RunStore, setup: &RunSetup) -> SbResult<RunDocument> {
    setup.validate()?;
    let task = setup
        .task
        .build()
        .map_err(|e| setup_error!("invalid task: {e}"))?;

    info!("Bootstrapping run at {}", store.root().display());
    store.create_root()?;

    store.write_text(TASK_SNAPSHOT_FILE, &task.describe())?;
    store.write_document(TASK_FILE, &TaskDocument::new(setup.task.clone()))?;
    store.write_document(UPDATER_FILE, &UpdaterDocument::new(setup.updater.clone()))?;

    let run = RunDocument::new(setup.seed);
    store.write_document(RUN_FILE, &run)?;
    store.write_batch_size(setup.n_samples_per_update)?;
    store.write_initial_distribution(&setup.initial_distribution)?;

    store.write_manifest(&Manifest::new())?;
    info!(
        "Run {} initialized: dimension {}, {} samples per update",
        run.run_id,
        setup.initial_distribution.dim(),
        setup.n_samples_per_update
    );
    Ok(run)
}
