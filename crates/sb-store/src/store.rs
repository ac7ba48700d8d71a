use nalgebra::{DMatrix, DVector};
use sb_types::{
    Cost, DistributionGaussian, ResumptionError, Rollout, RolloutId, SbError, SbResult,
    StorageError,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::array_io::{read_matrix, read_vector, write_matrix, write_vector};
use crate::atomic::write_atomic;
use crate::layout::{
    parse_step_dir_name, DistributionSlot, RunLayout, BATCH_SIZE_FILE, COST_FILE, COST_VARS_FILE,
    MANIFEST_FILE, POLICY_PARAMETERS_FILE,
};
use crate::manifest::{Manifest, MANIFEST_SCHEMA_VERSION};

/// Typed access to the files of one run directory.
#[derive(Debug, Clone)]
pub struct RunStore {
    layout: RunLayout,
}

impl RunStore {
    pub fn new<P: AsRef<Path>>(run_root: P) -> Self {
        Self {
            layout: RunLayout::new(run_root),
        }
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    /// Create the run root; a no-op when it already exists.
    pub fn create_root(&self) -> SbResult<()> {
        std::fs::create_dir_all(self.root()).map_err(|source| StorageError::Write {
            path: self.root().to_path_buf(),
            source,
        })?;
        Ok(())
    }

    // ---- run-level documents ----

    pub fn write_text(&self, name: &str, text: &str) -> SbResult<()> {
        write_atomic(&self.layout.run_file(name), text.as_bytes())?;
        Ok(())
    }

    pub fn write_document<T: Serialize>(&self, name: &str, document: &T) -> SbResult<()> {
        let json = serde_json::to_string_pretty(document)?;
        self.write_text(name, &json)
    }

    /// Read a JSON document carrying a `schema_version` field no newer than `supported`.
    pub fn read_document<T: DeserializeOwned>(&self, name: &str, supported: u32) -> SbResult<T> {
        let path = self.layout.run_file(name);
        if !path.is_file() {
            return Err(ResumptionError::NotInitialized {
                root: self.root().to_path_buf(),
            }
            .into());
        }
        let text = read_text(&path)?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        // absent reads as 0, anything past u32 saturates; both are rejected
        let found = value
            .get("schema_version")
            .and_then(serde_json::Value::as_u64)
            .map_or(0, |v| u32::try_from(v).unwrap_or(u32::MAX));
        if found == 0 || found > supported {
            return Err(StorageError::UnsupportedSchema {
                path,
                found,
                supported,
            }
            .into());
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn write_batch_size(&self, n_samples_per_update: usize) -> SbResult<()> {
        let path = self.layout.run_file(BATCH_SIZE_FILE);
        write_vector(&path, &DVector::from_element(1, n_samples_per_update as f64))?;
        Ok(())
    }

    pub fn read_batch_size(&self) -> SbResult<usize> {
        let path = self.layout.run_file(BATCH_SIZE_FILE);
        if !path.is_file() {
            return Err(ResumptionError::NotInitialized {
                root: self.root().to_path_buf(),
            }
            .into());
        }
        let values = read_vector(&path)?;
        match values.as_slice() {
            [n] if *n >= 1.0 && n.fract() == 0.0 => Ok(*n as usize),
            _ => Err(StorageError::Parse {
                path,
                line: 1,
                message: "expected a single positive integer".to_string(),
            }
            .into()),
        }
    }

    pub fn write_initial_distribution(&self, distribution: &DistributionGaussian) -> SbResult<()> {
        write_vector(&self.layout.initial_mean(), distribution.mean())?;
        write_matrix(&self.layout.initial_covar(), distribution.covar())?;
        Ok(())
    }

    pub fn read_initial_distribution(&self) -> SbResult<DistributionGaussian> {
        let mean = read_vector(&self.layout.initial_mean())?;
        let covar = read_matrix(&self.layout.initial_covar())?;
        DistributionGaussian::new(mean, covar)
    }

    // ---- manifest ----

    pub fn read_manifest(&self) -> SbResult<Option<Manifest>> {
        let path = self.layout.run_file(MANIFEST_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let manifest: Manifest = self
            .read_document(MANIFEST_FILE, MANIFEST_SCHEMA_VERSION)
            .map_err(|e| match e {
                SbError::Serialization(err) => SbError::Resumption(
                    ResumptionError::CorruptManifest {
                        message: err.to_string(),
                    },
                ),
                other => other,
            })?;
        Ok(Some(manifest))
    }

    pub fn write_manifest(&self, manifest: &Manifest) -> SbResult<()> {
        self.write_document(MANIFEST_FILE, manifest)
    }

    // ---- step discovery ----

    pub fn step_exists(&self, step: usize) -> bool {
        self.layout.rollout_dir(step, RolloutId::Eval).is_dir()
    }

    /// Walk `update%05d/rollout_eval` from step 0 upwards and return the last one found.
    ///
    /// Only used for runs without a manifest.
    pub fn scan_open_steps(&self) -> Option<usize> {
        let mut highest = None;
        let mut step = 0;
        while self.step_exists(step) {
            highest = Some(step);
            step += 1;
        }
        highest
    }

    /// All step directories present under the root, sorted.
    pub fn list_step_dirs(&self) -> SbResult<Vec<usize>> {
        let mut steps = Vec::new();
        if !self.root().exists() {
            return Ok(steps);
        }
        for entry in std::fs::read_dir(self.root())? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(step) = entry.file_name().to_str().and_then(parse_step_dir_name) {
                steps.push(step);
            }
        }
        steps.sort_unstable();
        Ok(steps)
    }

    // ---- per-step distribution and samples ----

    pub fn create_step_dir(&self, step: usize) -> SbResult<PathBuf> {
        let dir = self.layout.step_dir(step);
        std::fs::create_dir_all(&dir).map_err(|source| StorageError::Write {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }

    pub fn write_step_distribution(
        &self,
        step: usize,
        slot: DistributionSlot,
        distribution: &DistributionGaussian,
    ) -> SbResult<()> {
        write_vector(&self.layout.step_mean(step, slot), distribution.mean())?;
        write_matrix(&self.layout.step_covar(step, slot), distribution.covar())?;
        Ok(())
    }

    pub fn read_step_distribution(
        &self,
        step: usize,
        slot: DistributionSlot,
    ) -> SbResult<DistributionGaussian> {
        let mean = read_vector(&require(step, self.layout.step_mean(step, slot))?)?;
        let covar = read_matrix(&require(step, self.layout.step_covar(step, slot))?)?;
        DistributionGaussian::new(mean, covar).map_err(|e| {
            sb_types::resumption_error!(step, "stored distribution is invalid: {e}")
        })
    }

    pub fn has_step_distribution(&self, step: usize, slot: DistributionSlot) -> bool {
        self.layout.step_mean(step, slot).is_file() && self.layout.step_covar(step, slot).is_file()
    }

    pub fn write_samples(&self, step: usize, samples: &DMatrix<f64>) -> SbResult<()> {
        write_matrix(&self.layout.samples(step), samples)?;
        Ok(())
    }

    pub fn read_samples(&self, step: usize) -> SbResult<DMatrix<f64>> {
        Ok(read_matrix(&require(step, self.layout.samples(step))?)?)
    }

    pub fn write_weights(&self, step: usize, weights: &DVector<f64>) -> SbResult<()> {
        write_vector(&self.layout.weights(step), weights)?;
        Ok(())
    }

    pub fn read_weights(&self, step: usize) -> SbResult<Option<DVector<f64>>> {
        read_optional(&self.layout.weights(step), read_vector)
    }

    /// One `[total, components...]` row per regular rollout.
    pub fn write_costs(&self, step: usize, costs: &[Cost]) -> SbResult<()> {
        write_matrix(&self.layout.costs(step), &cost_matrix(step, costs)?)?;
        Ok(())
    }

    pub fn write_cost_eval(&self, step: usize, cost: &Cost) -> SbResult<()> {
        write_vector(&self.layout.cost_eval(step), &DVector::from_vec(cost.as_row()))?;
        Ok(())
    }

    pub fn read_cost_eval(&self, step: usize) -> SbResult<Option<Cost>> {
        let row = read_optional(&self.layout.cost_eval(step), read_vector)?;
        Ok(row.and_then(|r| Cost::from_row(r.as_slice())))
    }

    // ---- rollouts ----

    pub fn write_policy_parameters(
        &self,
        step: usize,
        rollout: RolloutId,
        parameters: &DVector<f64>,
    ) -> SbResult<()> {
        let path = self.layout.rollout_file(step, rollout, POLICY_PARAMETERS_FILE);
        write_vector(&path, parameters)?;
        Ok(())
    }

    pub fn read_policy_parameters(&self, step: usize, rollout: RolloutId) -> SbResult<DVector<f64>> {
        let path = self.layout.rollout_file(step, rollout, POLICY_PARAMETERS_FILE);
        Ok(read_vector(&require(step, path)?)?)
    }

    /// `None` until the external executor has produced the file.
    pub fn read_cost_vars(&self, step: usize, rollout: RolloutId) -> SbResult<Option<DMatrix<f64>>> {
        let path = self.layout.rollout_file(step, rollout, COST_VARS_FILE);
        read_optional(&path, read_matrix)
    }

    pub fn write_cost_vars(
        &self,
        step: usize,
        rollout: RolloutId,
        cost_vars: &DMatrix<f64>,
    ) -> SbResult<()> {
        let path = self.layout.rollout_file(step, rollout, COST_VARS_FILE);
        write_matrix(&path, cost_vars)?;
        Ok(())
    }

    pub fn write_cost(&self, step: usize, rollout: RolloutId, cost: &Cost) -> SbResult<()> {
        let path = self.layout.rollout_file(step, rollout, COST_FILE);
        write_vector(&path, &DVector::from_vec(cost.as_row()))?;
        Ok(())
    }

    pub fn read_cost(&self, step: usize, rollout: RolloutId) -> SbResult<Option<Cost>> {
        let path = self.layout.rollout_file(step, rollout, COST_FILE);
        let row = read_optional(&path, read_vector)?;
        Ok(row.and_then(|r| Cost::from_row(r.as_slice())))
    }

    pub fn load_rollout(&self, step: usize, rollout: RolloutId) -> SbResult<Rollout> {
        let mut loaded = Rollout::new(rollout, self.read_policy_parameters(step, rollout)?);
        loaded.cost_vars = self.read_cost_vars(step, rollout)?;
        loaded.cost = self.read_cost(step, rollout)?;
        Ok(loaded)
    }

    /// Load the evaluation rollout and exactly `batch_size` regular rollouts.
    pub fn load_rollouts(&self, step: usize, batch_size: usize) -> SbResult<(Rollout, Vec<Rollout>)> {
        let eval = self.load_rollout(step, RolloutId::Eval)?;
        let rollouts = (1..=batch_size)
            .map(|n| self.load_rollout(step, RolloutId::Sample(n)))
            .collect::<SbResult<Vec<_>>>()?;

        let extra = RolloutId::Sample(batch_size + 1);
        if self.layout.rollout_dir(step, extra).exists() {
            return Err(sb_types::resumption_error!(
                step,
                "found {extra} but the batch size is {batch_size}"
            ));
        }
        Ok((eval, rollouts))
    }

    /// Regular rollouts of `step` that still lack `cost_vars`, plus the evaluation rollout if it does.
    /// A zero-length `cost_vars.txt` counts as missing.
    pub fn pending_rollouts(&self, step: usize, batch_size: usize) -> Vec<RolloutId> {
        RolloutId::batch(batch_size)
            .filter(|id| {
                let path = self.layout.rollout_file(step, *id, COST_VARS_FILE);
                std::fs::metadata(&path).map_or(true, |m| !m.is_file() || m.len() == 0)
            })
            .collect()
    }

    /// Delete every step directory and the manifest, leaving only the
    /// bootstrap files.
    pub fn remove_steps(&self) -> SbResult<()> {
        for step in self.list_step_dirs()? {
            let dir = self.layout.step_dir(step);
            std::fs::remove_dir_all(&dir)
                .map_err(|source| StorageError::Write { path: dir, source })?;
        }
        let manifest = self.layout.run_file(MANIFEST_FILE);
        if manifest.is_file() {
            std::fs::remove_file(&manifest).map_err(|source| StorageError::Write {
                path: manifest,
                source,
            })?;
        }
        Ok(())
    }

    /// Remove everything derived from a step's samples: costs, weights, the
    /// updated distribution and any `cost_vars` produced for them.
    pub fn clear_step_outputs(&self, step: usize, batch_size: usize) -> SbResult<()> {
        let mut stale = vec![
            self.layout.step_mean(step, DistributionSlot::New),
            self.layout.step_covar(step, DistributionSlot::New),
            self.layout.weights(step),
            self.layout.costs(step),
            self.layout.cost_eval(step),
        ];
        for id in RolloutId::batch(batch_size) {
            stale.push(self.layout.rollout_file(step, id, COST_VARS_FILE));
            stale.push(self.layout.rollout_file(step, id, COST_FILE));
        }
        for path in stale {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed stale {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(StorageError::Write { path, source }.into()),
            }
        }
        Ok(())
    }
}

fn require(step: usize, path: PathBuf) -> SbResult<PathBuf> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(ResumptionError::MissingFile { step, path }.into())
    }
}

fn read_optional<T>(
    path: &Path,
    read: impl FnOnce(&Path) -> Result<T, StorageError>,
) -> SbResult<Option<T>> {
    if path.is_file() {
        Ok(Some(read(path)?))
    } else {
        Ok(None)
    }
}

fn read_text(path: &Path) -> SbResult<String> {
    std::fs::read_to_string(path).map_err(|source| {
        StorageError::Read {
            path: path.to_path_buf(),
            source,
        }
        .into()
    })
}

fn cost_matrix(step: usize, costs: &[Cost]) -> SbResult<DMatrix<f64>> {
    let width = costs.first().map_or(1, |c| 1 + c.components.len());
    if costs.iter().any(|c| 1 + c.components.len() != width) {
        return Err(sb_types::resumption_error!(
            step,
            "rollout costs have differing numbers of components"
        ));
    }
    let flat: Vec<f64> = costs.iter().flat_map(Cost::as_row).collect();
    Ok(DMatrix::from_row_slice(costs.len(), width, &flat))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::TASK_FILE;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        schema_version: u32,
        name: String,
    }

    fn dist() -> DistributionGaussian {
        DistributionGaussian::new(
            DVector::from_vec(vec![1.0, -2.0]),
            DMatrix::from_row_slice(2, 2, &[2.0, 0.3, 0.3, 1.0]),
        )
        .unwrap()
    }

    #[test]
    fn distribution_round_trip() {
        let dir = tempdir().unwrap();
        let store = RunStore::new(dir.path());
        store.write_step_distribution(0, DistributionSlot::Start, &dist()).unwrap();
        let back = store.read_step_distribution(0, DistributionSlot::Start).unwrap();
        assert_eq!(back, dist());
        assert!(!store.has_step_distribution(0, DistributionSlot::New));
    }

    #[test]
    fn missing_step_files_are_resumption_errors() {
        let dir = tempdir().unwrap();
        let store = RunStore::new(dir.path());
        let err = store.read_samples(3).unwrap_err();
        match err {
            SbError::Resumption(ResumptionError::MissingFile { step, path }) => {
                assert_eq!(step, 3);
                assert!(path.ends_with("update00003/samples.txt"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn batch_size_round_trip() {
        let dir = tempdir().unwrap();
        let store = RunStore::new(dir.path());
        assert!(store.read_batch_size().is_err());
        store.write_batch_size(12).unwrap();
        assert_eq!(store.read_batch_size().unwrap(), 12);
    }

    #[test]
    fn batch_size_accepts_numpy_format() {
        let dir = tempdir().unwrap();
        let store = RunStore::new(dir.path());
        std::fs::write(dir.path().join(BATCH_SIZE_FILE), "1.000000000000000000e+01\n").unwrap();
        assert_eq!(store.read_batch_size().unwrap(), 10);
    }

    #[test]
    fn documents_check_schema_version() {
        let dir = tempdir().unwrap();
        let store = RunStore::new(dir.path());
        let doc = Doc {
            schema_version: 1,
            name: "x".into(),
        };
        store.write_document(TASK_FILE, &doc).unwrap();
        let back: Doc = store.read_document(TASK_FILE, 1).unwrap();
        assert_eq!(back, doc);

        let newer = Doc {
            schema_version: 2,
            name: "y".into(),
        };
        store.write_document(TASK_FILE, &newer).unwrap();
        let err = store.read_document::<Doc>(TASK_FILE, 1).unwrap_err();
        assert!(matches!(
            err,
            SbError::Storage(StorageError::UnsupportedSchema { found: 2, .. })
        ));
    }

    #[test]
    fn oversized_schema_version_is_rejected() {
        let dir = tempdir().unwrap();
        let store = RunStore::new(dir.path());
        // 2^32 + 1 would wrap to 1 under a plain cast
        store
            .write_text(TASK_FILE, r#"{"schema_version": 4294967297, "name": "z"}"#)
            .unwrap();
        let err = store.read_document::<Doc>(TASK_FILE, 1).unwrap_err();
        assert!(matches!(
            err,
            SbError::Storage(StorageError::UnsupportedSchema {
                found: u32::MAX,
                supported: 1,
                ..
            })
        ));

        store.write_text(TASK_FILE, r#"{"name": "z"}"#).unwrap();
        let err = store.read_document::<Doc>(TASK_FILE, 1).unwrap_err();
        assert!(matches!(
            err,
            SbError::Storage(StorageError::UnsupportedSchema { found: 0, .. })
        ));
    }

    #[test]
    fn scan_stops_at_first_gap() {
        let dir = tempdir().unwrap();
        let store = RunStore::new(dir.path());
        assert_eq!(store.scan_open_steps(), None);

        for step in [0, 1, 3] {
            let params = DVector::zeros(2);
            store.write_policy_parameters(step, RolloutId::Eval, &params).unwrap();
        }
        assert_eq!(store.scan_open_steps(), Some(1));
        assert_eq!(store.list_step_dirs().unwrap(), vec![0, 1, 3]);
    }

    #[test]
    fn rollouts_load_with_optional_cost_vars() {
        let dir = tempdir().unwrap();
        let store = RunStore::new(dir.path());
        for id in RolloutId::batch(2) {
            store.write_policy_parameters(0, id, &DVector::from_element(2, 1.0)).unwrap();
        }
        store
            .write_cost_vars(0, RolloutId::Sample(2), &DMatrix::from_element(1, 2, 0.5))
            .unwrap();

        let (eval, rollouts) = store.load_rollouts(0, 2).unwrap();
        assert!(!eval.is_ready());
        assert!(!rollouts[0].is_ready());
        assert!(rollouts[1].is_ready());
        assert_eq!(
            store.pending_rollouts(0, 2),
            vec![RolloutId::Eval, RolloutId::Sample(1)]
        );
    }

    #[test]
    fn empty_cost_vars_file_is_pending() {
        let dir = tempdir().unwrap();
        let store = RunStore::new(dir.path());
        for id in RolloutId::batch(1) {
            store.write_policy_parameters(0, id, &DVector::zeros(2)).unwrap();
            store.write_cost_vars(0, id, &DMatrix::zeros(1, 2)).unwrap();
        }
        std::fs::write(
            store.layout().rollout_file(0, RolloutId::Sample(1), COST_VARS_FILE),
            "",
        )
        .unwrap();

        assert_eq!(store.pending_rollouts(0, 1), vec![RolloutId::Sample(1)]);
        let (eval, rollouts) = store.load_rollouts(0, 1).unwrap();
        assert!(eval.is_ready());
        assert!(!rollouts[0].is_ready());
    }

    #[test]
    fn extra_rollout_directory_is_inconsistent() {
        let dir = tempdir().unwrap();
        let store = RunStore::new(dir.path());
        for id in RolloutId::batch(3) {
            store.write_policy_parameters(0, id, &DVector::zeros(1)).unwrap();
        }
        let err = store.load_rollouts(0, 2).unwrap_err();
        assert!(matches!(
            err,
            SbError::Resumption(ResumptionError::Inconsistent { step: 0, .. })
        ));
    }

    #[test]
    fn costs_matrix_layout() {
        let dir = tempdir().unwrap();
        let store = RunStore::new(dir.path());
        let costs = vec![
            Cost::from_components(vec![1.0, 2.0]),
            Cost::from_components(vec![0.5, 0.5]),
        ];
        store.write_costs(0, &costs).unwrap();
        let matrix = read_matrix(&store.layout().costs(0)).unwrap();
        assert_eq!(matrix, DMatrix::from_row_slice(2, 3, &[3.0, 1.0, 2.0, 1.0, 0.5, 0.5]));

        let ragged = vec![Cost::scalar(1.0), Cost::from_components(vec![1.0])];
        assert!(store.write_costs(1, &ragged).is_err());
    }

    #[test]
    fn clear_step_outputs_keeps_inputs() {
        let dir = tempdir().unwrap();
        let store = RunStore::new(dir.path());
        store.write_step_distribution(0, DistributionSlot::Start, &dist()).unwrap();
        store.write_step_distribution(0, DistributionSlot::New, &dist()).unwrap();
        store.write_samples(0, &DMatrix::zeros(1, 2)).unwrap();
        store.write_weights(0, &DVector::from_element(1, 1.0)).unwrap();
        for id in RolloutId::batch(1) {
            store.write_policy_parameters(0, id, &DVector::zeros(2)).unwrap();
            store.write_cost_vars(0, id, &DMatrix::zeros(1, 2)).unwrap();
            store.write_cost(0, id, &Cost::scalar(1.0)).unwrap();
        }

        store.clear_step_outputs(0, 1).unwrap();
        assert!(store.has_step_distribution(0, DistributionSlot::Start));
        assert!(!store.has_step_distribution(0, DistributionSlot::New));
        assert_eq!(store.read_weights(0).unwrap(), None);
        assert_eq!(store.pending_rollouts(0, 1).len(), 2);
        assert_eq!(store.read_cost(0, RolloutId::Sample(1)).unwrap(), None);
        assert!(store.read_samples(0).is_ok());

        // clearing twice is harmless
        store.clear_step_outputs(0, 1).unwrap();
    }

    #[test]
    fn remove_steps_clears_step_dirs_and_manifest() {
        let dir = tempdir().unwrap();
        let store = RunStore::new(dir.path());
        store.write_batch_size(2).unwrap();
        for step in 0..3 {
            store.write_samples(step, &DMatrix::zeros(2, 1)).unwrap();
        }
        store.write_manifest(&Manifest::new()).unwrap();

        store.remove_steps().unwrap();
        assert!(store.list_step_dirs().unwrap().is_empty());
        assert_eq!(store.read_manifest().unwrap(), None);
        assert_eq!(store.read_batch_size().unwrap(), 2);
    }

    #[test]
    fn manifest_absent_then_present() {
        let dir = tempdir().unwrap();
        let store = RunStore::new(dir.path());
        assert_eq!(store.read_manifest().unwrap(), None);

        let mut manifest = Manifest::new();
        manifest.mark_open(0);
        store.write_manifest(&manifest).unwrap();
        assert_eq!(store.read_manifest().unwrap(), Some(manifest));
    }

    #[test]
    fn corrupt_manifest_is_reported() {
        let dir = tempdir().unwrap();
        let store = RunStore::new(dir.path());
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{"schema_version": 1, "highest_open": "zero"}"#,
        )
        .unwrap();
        let err = store.read_manifest().unwrap_err();
        assert!(matches!(
            err,
            SbError::Resumption(ResumptionError::CorruptManifest { .. })
        ));
    }
}
