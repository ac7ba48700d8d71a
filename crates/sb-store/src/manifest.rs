//! Run manifest: the single record of how far the loop has progressed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Highest opened and closed step of a run.
///
/// A step is *open* once all of its inputs (distribution, samples, rollout
/// parameters) are on disk and *closed* once its update has been written.
/// The manifest is always the last file written in a phase, so it never
/// points at a step that is only partially written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub highest_open: Option<usize>,
    pub highest_closed: Option<usize>,
    pub updated_at: DateTime<Utc>,
}

impl Manifest {
    /// Manifest of a freshly bootstrapped run with no steps.
    pub fn new() -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            highest_open: None,
            highest_closed: None,
            updated_at: Utc::now(),
        }
    }

    pub fn mark_open(&mut self, step: usize) {
        self.highest_open = Some(self.highest_open.map_or(step, |open| open.max(step)));
        self.updated_at = Utc::now();
    }

    pub fn mark_closed(&mut self, step: usize) {
        self.highest_closed = Some(self.highest_closed.map_or(step, |closed| closed.max(step)));
        self.updated_at = Utc::now();
    }

    /// The open step still waiting for rollouts, if any.
    pub fn pending_step(&self) -> Option<usize> {
        match (self.highest_open, self.highest_closed) {
            (Some(open), Some(closed)) if closed >= open => None,
            (open, _) => open,
        }
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_lifecycle() {
        let mut manifest = Manifest::new();
        assert_eq!(manifest.pending_step(), None);

        manifest.mark_open(0);
        assert_eq!(manifest.pending_step(), Some(0));

        manifest.mark_closed(0);
        manifest.mark_open(1);
        assert_eq!(manifest.highest_closed, Some(0));
        assert_eq!(manifest.pending_step(), Some(1));
    }

    #[test]
    fn reopening_an_earlier_step_never_lowers_the_marks() {
        let mut manifest = Manifest::new();
        manifest.mark_open(4);
        manifest.mark_closed(3);
        manifest.mark_open(2);
        manifest.mark_closed(1);
        assert_eq!(manifest.highest_open, Some(4));
        assert_eq!(manifest.highest_closed, Some(3));
    }

    #[test]
    fn manifest_json_round_trip() {
        let mut manifest = Manifest::new();
        manifest.mark_open(2);
        let json = serde_json::to_string(&manifest).unwrap();
        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(manifest, back);
    }
}
