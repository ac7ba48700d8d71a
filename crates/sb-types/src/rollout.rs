//! Rollouts and their costs.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Cost of a single rollout: the total used for ranking plus optional components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cost {
    pub total: f64,
    pub components: Vec<f64>,
}

impl Cost {
    pub fn scalar(total: f64) -> Self {
        Self {
            total,
            components: Vec::new(),
        }
    }

    /// Total is the sum of the components.
    pub fn from_components(components: Vec<f64>) -> Self {
        Self {
            total: components.iter().sum(),
            components,
        }
    }

    /// `[total, components...]`, the on-disk row layout.
    pub fn as_row(&self) -> Vec<f64> {
        let mut row = Vec::with_capacity(1 + self.components.len());
        row.push(self.total);
        row.extend_from_slice(&self.components);
        row
    }

    pub fn from_row(row: &[f64]) -> Option<Self> {
        let (total, components) = row.split_first()?;
        Some(Self {
            total: *total,
            components: components.to_vec(),
        })
    }
}

/// Identifies a rollout inside a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RolloutId {
    /// The unperturbed rollout executed with the distribution mean.
    Eval,
    /// Regular sample, numbered from 1.
    Sample(usize),
}

impl RolloutId {
    pub fn dir_name(&self) -> String {
        match self {
            Self::Eval => "rollout_eval".to_string(),
            Self::Sample(n) => format!("rollout{n:03}"),
        }
    }

    /// Ids of a full batch: the evaluation rollout followed by samples `1..=batch_size`.
    pub fn batch(batch_size: usize) -> impl Iterator<Item = RolloutId> {
        std::iter::once(Self::Eval).chain((1..=batch_size).map(Self::Sample))
    }
}

impl fmt::Display for RolloutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dir_name())
    }
}

/// One executed (or to-be-executed) parameter vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Rollout {
    pub id: RolloutId,
    pub policy_parameters: DVector<f64>,
    /// Written by the external executor; absent until it has run.
    pub cost_vars: Option<DMatrix<f64>>,
    /// Filled in by the evaluator.
    pub cost: Option<Cost>,
}

impl Rollout {
    pub fn new(id: RolloutId, policy_parameters: DVector<f64>) -> Self {
        Self {
            id,
            policy_parameters,
            cost_vars: None,
            cost: None,
        }
    }

    pub fn with_cost_vars(mut self, cost_vars: DMatrix<f64>) -> Self {
        self.cost_vars = Some(cost_vars);
        self
    }

    /// A rollout is ready once its `cost_vars` hold at least one row; an empty
    /// file means the executor has not finished writing it.
    pub fn is_ready(&self) -> bool {
        self.cost_vars.as_ref().is_some_and(|c| c.nrows() > 0)
    }

    pub fn is_evaluated(&self) -> bool {
        self.cost.is_some()
    }
}
