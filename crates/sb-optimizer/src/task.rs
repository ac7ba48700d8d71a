//! Task definitions: the cost functions that turn executed rollouts into costs.

use nalgebra::{DMatrix, DVector};
use sb_types::{Cost, TaskError};
use serde::{Deserialize, Serialize};

pub const TASK_SCHEMA_VERSION: u32 = 1;

/// Cost function of an optimization task.
pub trait Task: Send + Sync {
    /// Compute the cost of one rollout from the executor's `cost_vars`.
    fn evaluate_rollout(
        &self,
        cost_vars: &DMatrix<f64>,
        policy_parameters: &DVector<f64>,
    ) -> Result<Cost, TaskError>;

    /// Serializable description from which the task can be rebuilt.
    fn to_spec(&self) -> TaskSpec;

    /// Human-readable account of the cost function, kept with the run for reference.
    fn describe(&self) -> String;

    /// Produce `cost_vars` in-process, for tasks that do not need an external executor.
    fn simulate(&self, _policy_parameters: &DVector<f64>) -> Option<DMatrix<f64>> {
        None
    }
}

/// Persisted, schema-versioned form of every supported task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskSpec {
    /// Cost is the Euclidean distance of the reached point to `point`.
    DistanceToPoint { point: Vec<f64> },
    /// Pass through a via-point while keeping accelerations low.
    Viapoint {
        viapoint: Vec<f64>,
        #[serde(default)]
        viapoint_time: Option<f64>,
        #[serde(default)]
        acceleration_weight: f64,
    },
}

impl TaskSpec {
    pub fn build(&self) -> Result<Box<dyn Task>, TaskError> {
        match self {
            Self::DistanceToPoint { point } => {
                Ok(Box::new(DistanceToPoint::new(DVector::from_column_slice(point))?))
            }
            Self::Viapoint {
                viapoint,
                viapoint_time,
                acceleration_weight,
            } => Ok(Box::new(Viapoint::new(
                DVector::from_column_slice(viapoint),
                *viapoint_time,
                *acceleration_weight,
            )?)),
        }
    }

    /// Number of policy parameters the task expects, when it is fixed by the task.
    pub fn parameter_dim(&self) -> Option<usize> {
        match self {
            Self::DistanceToPoint { point } => Some(point.len()),
            Self::Viapoint { .. } => None,
        }
    }
}

/// `task.json` contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDocument {
    pub schema_version: u32,
    pub task: TaskSpec,
}

impl TaskDocument {
    pub fn new(task: TaskSpec) -> Self {
        Self {
            schema_version: TASK_SCHEMA_VERSION,
            task,
        }
    }
}

// ---- Distance to point ----

#[derive(Debug, Clone, PartialEq)]
pub struct DistanceToPoint {
    point: DVector<f64>,
}

impl DistanceToPoint {
    pub fn new(point: DVector<f64>) -> Result<Self, TaskError> {
        if point.is_empty() {
            return Err(TaskError::InvalidConfig {
                message: "target point must not be empty".to_string(),
            });
        }
        Ok(Self { point })
    }
}

impl Task for DistanceToPoint {
    fn evaluate_rollout(
        &self,
        cost_vars: &DMatrix<f64>,
        _policy_parameters: &DVector<f64>,
    ) -> Result<Cost, TaskError> {
        // the reached point, written either as one row or one column
        if cost_vars.nrows() != 1 && cost_vars.ncols() != 1 {
            return Err(TaskError::MalformedCostVars {
                message: format!(
                    "expected a single point, got a {}x{} matrix",
                    cost_vars.nrows(),
                    cost_vars.ncols()
                ),
            });
        }
        if cost_vars.len() != self.point.len() {
            return Err(TaskError::DimensionMismatch {
                expected: self.point.len(),
                actual: cost_vars.len(),
            });
        }

        let distance = cost_vars
            .iter()
            .zip(self.point.iter())
            .map(|(reached, target)| (reached - target).powi(2))
            .sum::<f64>()
            .sqrt();
        Ok(Cost::scalar(distance))
    }

    fn to_spec(&self) -> TaskSpec {
        TaskSpec::DistanceToPoint {
            point: self.point.iter().copied().collect(),
        }
    }

    fn describe(&self) -> String {
        format!(
            "DistanceToPoint\n\
             cost_vars: the point reached by the rollout ({} values)\n\
             cost = || cost_vars - point ||_2\n\
             point = {:?}\n",
            self.point.len(),
            self.point.as_slice()
        )
    }

    fn simulate(&self, policy_parameters: &DVector<f64>) -> Option<DMatrix<f64>> {
        Some(DMatrix::from_row_slice(
            1,
            policy_parameters.len(),
            policy_parameters.as_slice(),
        ))
    }
}

// ---- Via-point ----

#[derive(Debug, Clone, PartialEq)]
pub struct Viapoint {
    viapoint: DVector<f64>,
    viapoint_time: Option<f64>,
    acceleration_weight: f64,
}

impl Viapoint {
    pub fn new(
        viapoint: DVector<f64>,
        viapoint_time: Option<f64>,
        acceleration_weight: f64,
    ) -> Result<Self, TaskError> {
        if viapoint.is_empty() {
            return Err(TaskError::InvalidConfig {
                message: "via-point must not be empty".to_string(),
            });
        }
        if !(acceleration_weight >= 0.0 && acceleration_weight.is_finite()) {
            return Err(TaskError::InvalidConfig {
                message: format!("acceleration_weight must be >= 0, got {acceleration_weight}"),
            });
        }
        Ok(Self {
            viapoint,
            viapoint_time,
            acceleration_weight,
        })
    }

    fn dim(&self) -> usize {
        self.viapoint.len()
    }

    fn distance_at(&self, trajectory: &DMatrix<f64>, row: usize) -> f64 {
        (0..self.dim())
            .map(|d| (trajectory[(row, 1 + d)] - self.viapoint[d]).powi(2))
            .sum::<f64>()
            .sqrt()
    }
}

impl Task for Viapoint {
    /// `cost_vars` holds one row per time step: `[t, y(d), yd(d), ydd(d)]`.
    fn evaluate_rollout(
        &self,
        cost_vars: &DMatrix<f64>,
        _policy_parameters: &DVector<f64>,
    ) -> Result<Cost, TaskError> {
        let d = self.dim();
        if cost_vars.ncols() != 1 + 3 * d {
            return Err(TaskError::MalformedCostVars {
                message: format!(
                    "expected {} columns [t, y, yd, ydd], got {}",
                    1 + 3 * d,
                    cost_vars.ncols()
                ),
            });
        }
        if cost_vars.nrows() == 0 {
            return Err(TaskError::MalformedCostVars {
                message: "trajectory is empty".to_string(),
            });
        }

        let n_steps = cost_vars.nrows();
        let dist_to_viapoint = match self.viapoint_time {
            Some(t) => {
                let closest = (0..n_steps)
                    .min_by(|&a, &b| {
                        (cost_vars[(a, 0)] - t)
                            .abs()
                            .total_cmp(&(cost_vars[(b, 0)] - t).abs())
                    })
                    .unwrap_or(0);
                self.distance_at(cost_vars, closest)
            }
            None => (0..n_steps)
                .map(|row| self.distance_at(cost_vars, row))
                .fold(f64::INFINITY, f64::min),
        };

        let acc_offset = 1 + 2 * d;
        let sum_sq_acc: f64 = (0..n_steps)
            .map(|row| (0..d).map(|i| cost_vars[(row, acc_offset + i)].powi(2)).sum::<f64>())
            .sum();
        let acceleration = self.acceleration_weight * sum_sq_acc / n_steps as f64;

        Ok(Cost::from_components(vec![dist_to_viapoint, acceleration]))
    }

    fn to_spec(&self) -> TaskSpec {
        TaskSpec::Viapoint {
            viapoint: self.viapoint.iter().copied().collect(),
            viapoint_time: self.viapoint_time,
            acceleration_weight: self.acceleration_weight,
        }
    }

    fn describe(&self) -> String {
        let when = match self.viapoint_time {
            Some(t) => format!("at the time step closest to t = {t}"),
            None => "minimum over the whole trajectory".to_string(),
        };
        format!(
            "Viapoint\n\
             cost_vars: one row per time step [t, y({d}), yd({d}), ydd({d})]\n\
             cost = dist(y, viapoint) + acceleration_weight * mean_t(sum(ydd^2))\n\
             dist is taken {when}\n\
             viapoint = {:?}\n\
             acceleration_weight = {}\n",
            self.viapoint.as_slice(),
            self.acceleration_weight,
            d = self.dim(),
        )
    }
}
