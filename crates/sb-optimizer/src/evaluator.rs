use nalgebra::DVector;
use sb_types::{Cost, ResumptionError, Rollout, SbResult, TaskError};
use tracing::debug;

use crate::task::Task;

/// Costs of a fully executed batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEvaluation {
    pub eval: Rollout,
    pub rollouts: Vec<Rollout>,
    /// Costs of the regular rollouts, in rollout order.
    pub costs: Vec<Cost>,
}

impl BatchEvaluation {
    pub fn eval_cost(&self) -> Option<&Cost> {
        self.eval.cost.as_ref()
    }

    pub fn cost_totals(&self) -> DVector<f64> {
        DVector::from_iterator(self.costs.len(), self.costs.iter().map(|c| c.total))
    }
}

/// Compute the cost of every rollout of `step`, the evaluation rollout included.
///
/// Every rollout must already carry non-empty `cost_vars`; otherwise the error
/// names all rollouts that are still missing, and no cost is computed.
pub fn evaluate_batch(
    task: &dyn Task,
    step: usize,
    mut eval: Rollout,
    mut rollouts: Vec<Rollout>,
) -> SbResult<BatchEvaluation> {
    let missing: Vec<String> = std::iter::once(&eval)
        .chain(rollouts.iter())
        .filter(|r| !r.is_ready())
        .map(|r| r.id.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(ResumptionError::MissingCostVars {
            step,
            rollout: missing.join(", "),
        }
        .into());
    }

    eval.cost = Some(evaluate_rollout(task, step, &eval)?);
    let mut costs = Vec::with_capacity(rollouts.len());
    for rollout in rollouts.iter_mut() {
        let cost = evaluate_rollout(task, step, rollout)?;
        debug!("Step {} {}: cost {}", step, rollout.id, cost.total);
        costs.push(cost.clone());
        rollout.cost = Some(cost);
    }

    if let Some(first) = costs.first() {
        let width = first.components.len();
        if costs.iter().any(|c| c.components.len() != width) {
            return Err(TaskError::MalformedCostVars {
                message: format!("step {step} produced costs with differing component counts"),
            }
            .into());
        }
    }

    Ok(BatchEvaluation {
        eval,
        rollouts,
        costs,
    })
}

fn evaluate_rollout(task: &dyn Task, step: usize, rollout: &Rollout) -> SbResult<Cost> {
    match &rollout.cost_vars {
        Some(cost_vars) => Ok(task.evaluate_rollout(cost_vars, &rollout.policy_parameters)?),
        None => Err(ResumptionError::MissingCostVars {
            step,
            rollout: rollout.id.to_string(),
        }
        .into()),
    }
}
