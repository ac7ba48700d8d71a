//! Distribution update rules.
//!
//! Every updater is a pure function of (distribution, samples, costs): the
//! controller relies on this to re-close a step with identical results.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use sb_types::{Cost, DistributionGaussian, UpdaterError};
use serde::{Deserialize, Serialize};

pub const UPDATER_SCHEMA_VERSION: u32 = 1;

/// Output of one distribution update.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateResult {
    pub distribution: DistributionGaussian,
    /// Weight of each sample, summing to one.
    pub weights: DVector<f64>,
}

/// Common trait for all distribution updaters.
pub trait Updater: Send + Sync {
    /// `samples` has one row per regular rollout; `costs` is in the same order.
    fn update_distribution(
        &self,
        distribution: &DistributionGaussian,
        samples: &DMatrix<f64>,
        costs: &[Cost],
    ) -> Result<UpdateResult, UpdaterError>;

    fn to_spec(&self) -> UpdaterSpec;

    /// Human-readable updater name.
    fn name(&self) -> &str;
}

/// How costs are mapped to sample weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightingMethod {
    /// `exp(-h * (c - min) / (max - min))`
    PiBb,
    /// Uniform weights on the `h` best samples.
    Cem,
    /// `ln(h + 0.5) - ln(rank)` on the `h` best samples.
    CmaEs,
}

/// Persisted, schema-versioned form of every supported updater.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdaterSpec {
    /// Move the mean only.
    Mean {
        eliteness: f64,
        weighting: WeightingMethod,
    },
    /// Move the mean and shrink the covariance by `decay^2` each step.
    CovarDecay {
        eliteness: f64,
        weighting: WeightingMethod,
        decay: f64,
    },
    /// Move the mean and re-estimate the covariance from the weighted samples.
    CovarAdaptation {
        eliteness: f64,
        weighting: WeightingMethod,
        base_level: f64,
        #[serde(default)]
        diag_only: bool,
        learning_rate: f64,
    },
}

impl UpdaterSpec {
    pub fn build(&self) -> Result<Box<dyn Updater>, UpdaterError> {
        Ok(match *self {
            Self::Mean {
                eliteness,
                weighting,
            } => Box::new(UpdaterMean::new(eliteness, weighting)?),
            Self::CovarDecay {
                eliteness,
                weighting,
                decay,
            } => Box::new(UpdaterCovarDecay::new(eliteness, weighting, decay)?),
            Self::CovarAdaptation {
                eliteness,
                weighting,
                base_level,
                diag_only,
                learning_rate,
            } => Box::new(UpdaterCovarAdaptation::new(
                eliteness,
                weighting,
                base_level,
                diag_only,
                learning_rate,
            )?),
        })
    }
}

/// `updater.json` contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdaterDocument {
    pub schema_version: u32,
    pub updater: UpdaterSpec,
}

impl UpdaterDocument {
    pub fn new(updater: UpdaterSpec) -> Self {
        Self {
            schema_version: UPDATER_SCHEMA_VERSION,
            updater,
        }
    }
}

// ---------------------------------------------------------------------------
// Weighting
// ---------------------------------------------------------------------------

fn validate_eliteness(eliteness: f64, method: WeightingMethod) -> Result<(), UpdaterError> {
    let valid = match method {
        WeightingMethod::PiBb => eliteness > 0.0 && eliteness.is_finite(),
        WeightingMethod::Cem | WeightingMethod::CmaEs => {
            eliteness >= 1.0 && eliteness.fract() == 0.0 && eliteness.is_finite()
        }
    };
    if valid {
        Ok(())
    } else {
        Err(UpdaterError::InvalidConfig {
            message: format!("invalid eliteness {eliteness} for {method:?} weighting"),
        })
    }
}

/// Map costs to normalized weights; lower cost gets higher weight.
pub fn costs_to_weights(
    costs: &DVector<f64>,
    method: WeightingMethod,
    eliteness: f64,
) -> Result<DVector<f64>, UpdaterError> {
    validate_eliteness(eliteness, method)?;
    let n = costs.len();
    if n == 0 {
        return Err(UpdaterError::ShapeMismatch {
            message: "cannot weight an empty batch".to_string(),
        });
    }
    if costs.iter().any(|c| !c.is_finite()) {
        return Err(UpdaterError::InvalidConfig {
            message: "costs must be finite".to_string(),
        });
    }

    let weights = match method {
        WeightingMethod::PiBb => {
            let min = costs.min();
            let range = costs.max() - min;
            if range == 0.0 {
                DVector::from_element(n, 1.0)
            } else {
                costs.map(|c| (-eliteness * (c - min) / range).exp())
            }
        }
        WeightingMethod::Cem | WeightingMethod::CmaEs => {
            let mu = (eliteness as usize).min(n);
            let mut ranked: Vec<usize> = (0..n).collect();
            // stable sort keeps ties in sample order, so weights are reproducible
            ranked.sort_by(|&a, &b| costs[a].total_cmp(&costs[b]));

            let mut weights = DVector::zeros(n);
            for (rank, &idx) in ranked.iter().take(mu).enumerate() {
                weights[idx] = match method {
                    WeightingMethod::Cem => 1.0,
                    _ => (mu as f64 + 0.5).ln() - ((rank + 1) as f64).ln(),
                };
            }
            weights
        }
    };

    let total = weights.sum();
    Ok(weights / total)
}

fn check_inputs(
    distribution: &DistributionGaussian,
    samples: &DMatrix<f64>,
    costs: &[Cost],
) -> Result<DVector<f64>, UpdaterError> {
    if samples.nrows() != costs.len() {
        return Err(UpdaterError::ShapeMismatch {
            message: format!("{} samples but {} costs", samples.nrows(), costs.len()),
        });
    }
    if samples.ncols() != distribution.dim() {
        return Err(UpdaterError::ShapeMismatch {
            message: format!(
                "samples have {} columns, distribution has dimension {}",
                samples.ncols(),
                distribution.dim()
            ),
        });
    }
    Ok(DVector::from_iterator(costs.len(), costs.iter().map(|c| c.total)))
}

/// Weighted average of the sample rows.
fn weighted_mean(samples: &DMatrix<f64>, weights: &DVector<f64>) -> DVector<f64> {
    samples.transpose() * weights
}

fn finish(
    mean: DVector<f64>,
    covar: DMatrix<f64>,
    weights: DVector<f64>,
) -> Result<UpdateResult, UpdaterError> {
    let distribution = DistributionGaussian::new(mean, covar).map_err(|e| {
        UpdaterError::InvalidDistribution {
            message: e.to_string(),
        }
    })?;
    Ok(UpdateResult {
        distribution,
        weights,
    })
}

// ---------------------------------------------------------------------------
// Updaters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct UpdaterMean {
    eliteness: f64,
    weighting: WeightingMethod,
}

impl UpdaterMean {
    pub fn new(eliteness: f64, weighting: WeightingMethod) -> Result<Self, UpdaterError> {
        validate_eliteness(eliteness, weighting)?;
        Ok(Self {
            eliteness,
            weighting,
        })
    }
}

impl Updater for UpdaterMean {
    fn update_distribution(
        &self,
        distribution: &DistributionGaussian,
        samples: &DMatrix<f64>,
        costs: &[Cost],
    ) -> Result<UpdateResult, UpdaterError> {
        let totals = check_inputs(distribution, samples, costs)?;
        let weights = costs_to_weights(&totals, self.weighting, self.eliteness)?;
        let mean = weighted_mean(samples, &weights);
        finish(mean, distribution.covar().clone(), weights)
    }

    fn to_spec(&self) -> UpdaterSpec {
        UpdaterSpec::Mean {
            eliteness: self.eliteness,
            weighting: self.weighting,
        }
    }

    fn name(&self) -> &str {
        "mean"
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdaterCovarDecay {
    mean_updater: UpdaterMean,
    decay: f64,
}

impl UpdaterCovarDecay {
    pub fn new(
        eliteness: f64,
        weighting: WeightingMethod,
        decay: f64,
    ) -> Result<Self, UpdaterError> {
        if !(decay > 0.0 && decay <= 1.0) {
            return Err(UpdaterError::InvalidConfig {
                message: format!("decay must be in (0, 1], got {decay}"),
            });
        }
        Ok(Self {
            mean_updater: UpdaterMean::new(eliteness, weighting)?,
            decay,
        })
    }
}

impl Updater for UpdaterCovarDecay {
    fn update_distribution(
        &self,
        distribution: &DistributionGaussian,
        samples: &DMatrix<f64>,
        costs: &[Cost],
    ) -> Result<UpdateResult, UpdaterError> {
        let updated = self
            .mean_updater
            .update_distribution(distribution, samples, costs)?;
        let covar = distribution.covar() * (self.decay * self.decay);
        finish(updated.distribution.mean().clone(), covar, updated.weights)
    }

    fn to_spec(&self) -> UpdaterSpec {
        UpdaterSpec::CovarDecay {
            eliteness: self.mean_updater.eliteness,
            weighting: self.mean_updater.weighting,
            decay: self.decay,
        }
    }

    fn name(&self) -> &str {
        "covar_decay"
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdaterCovarAdaptation {
    mean_updater: UpdaterMean,
    base_level: f64,
    diag_only: bool,
    learning_rate: f64,
}

impl UpdaterCovarAdaptation {
    pub fn new(
        eliteness: f64,
        weighting: WeightingMethod,
        base_level: f64,
        diag_only: bool,
        learning_rate: f64,
    ) -> Result<Self, UpdaterError> {
        if !(base_level >= 0.0 && base_level.is_finite()) {
            return Err(UpdaterError::InvalidConfig {
                message: format!("base_level must be >= 0, got {base_level}"),
            });
        }
        if !(learning_rate > 0.0 && learning_rate <= 1.0) {
            return Err(UpdaterError::InvalidConfig {
                message: format!("learning_rate must be in (0, 1], got {learning_rate}"),
            });
        }
        Ok(Self {
            mean_updater: UpdaterMean::new(eliteness, weighting)?,
            base_level,
            diag_only,
            learning_rate,
        })
    }

    /// Raise eigenvalues (or diagonal entries) below `base_level` to it.
    fn floor_covar(&self, covar: DMatrix<f64>) -> DMatrix<f64> {
        if self.diag_only {
            let diagonal = covar.diagonal().map(|v| v.max(self.base_level));
            return DMatrix::from_diagonal(&diagonal);
        }
        let eigen = SymmetricEigen::new(covar);
        let floored = eigen.eigenvalues.map(|v| v.max(self.base_level));
        let vectors = &eigen.eigenvectors;
        vectors * DMatrix::from_diagonal(&floored) * vectors.transpose()
    }
}

impl Updater for UpdaterCovarAdaptation {
    fn update_distribution(
        &self,
        distribution: &DistributionGaussian,
        samples: &DMatrix<f64>,
        costs: &[Cost],
    ) -> Result<UpdateResult, UpdaterError> {
        let updated = self
            .mean_updater
            .update_distribution(distribution, samples, costs)?;
        let weights = updated.weights;

        // deviations are taken from the mean the samples were drawn around
        let old_mean = distribution.mean();
        let (n, dim) = samples.shape();
        let centered = DMatrix::from_fn(n, dim, |r, c| samples[(r, c)] - old_mean[c]);
        let weighted = DMatrix::from_fn(n, dim, |r, c| centered[(r, c)] * weights[r]);
        let mut estimate = centered.transpose() * weighted;
        if self.diag_only {
            estimate = DMatrix::from_diagonal(&estimate.diagonal());
        }

        let blended =
            distribution.covar() * (1.0 - self.learning_rate) + estimate * self.learning_rate;
        let floored = self.floor_covar(blended);
        let symmetric = (&floored + floored.transpose()) * 0.5;

        finish(updated.distribution.mean().clone(), symmetric, weights)
    }

    fn to_spec(&self) -> UpdaterSpec {
        UpdaterSpec::CovarAdaptation {
            eliteness: self.mean_updater.eliteness,
            weighting: self.mean_updater.weighting,
            base_level: self.base_level,
            diag_only: self.diag_only,
            learning_rate: self.learning_rate,
        }
    }

    fn name(&self) -> &str {
        "covar_adaptation"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn costs(values: &[f64]) -> Vec<Cost> {
        values.iter().map(|&c| Cost::scalar(c)).collect()
    }

    fn unit_distribution() -> DistributionGaussian {
        DistributionGaussian::isotropic(DVector::zeros(2), 1.0).unwrap()
    }

    fn square_samples() -> DMatrix<f64> {
        DMatrix::from_row_slice(4, 2, &[1.0, 0.0, -1.0, 0.0, 0.0, 1.0, 0.0, -1.0])
    }

    #[test]
    fn pi_bb_weights_favor_low_cost() {
        let weights =
            costs_to_weights(&DVector::from_vec(vec![0.0, 1.0, 2.0]), WeightingMethod::PiBb, 10.0)
                .unwrap();
        assert!((weights.sum() - 1.0).abs() < 1e-12);
        assert!(weights[0] > weights[1] && weights[1] > weights[2]);
    }

    #[test]
    fn pi_bb_equal_costs_give_uniform_weights() {
        let weights =
            costs_to_weights(&DVector::from_element(4, 3.0), WeightingMethod::PiBb, 10.0).unwrap();
        for w in weights.iter() {
            assert!((w - 0.25).abs() < 1e-12);
        }
    }

    #[test]
    fn cem_selects_elites_uniformly() {
        let weights = costs_to_weights(
            &DVector::from_vec(vec![5.0, 1.0, 3.0, 2.0]),
            WeightingMethod::Cem,
            2.0,
        )
        .unwrap();
        assert_eq!(weights.as_slice(), &[0.0, 0.5, 0.0, 0.5]);
    }

    #[test]
    fn cma_es_weights_decrease_with_rank() {
        let weights = costs_to_weights(
            &DVector::from_vec(vec![4.0, 1.0, 3.0, 2.0]),
            WeightingMethod::CmaEs,
            3.0,
        )
        .unwrap();
        assert_eq!(weights[0], 0.0);
        assert!(weights[1] > weights[3] && weights[3] > weights[2] && weights[2] > 0.0);
        assert!((weights.sum() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn eliteness_validation() {
        assert!(UpdaterMean::new(0.0, WeightingMethod::PiBb).is_err());
        assert!(UpdaterMean::new(2.5, WeightingMethod::Cem).is_err());
        assert!(UpdaterMean::new(3.0, WeightingMethod::CmaEs).is_ok());
    }

    #[test]
    fn mean_updater_moves_toward_best_sample() {
        let updater = UpdaterMean::new(1.0, WeightingMethod::Cem).unwrap();
        let result = updater
            .update_distribution(&unit_distribution(), &square_samples(), &costs(&[3.0, 2.0, 0.5, 4.0]))
            .unwrap();
        assert_eq!(result.distribution.mean().as_slice(), &[0.0, 1.0]);
        assert_eq!(result.distribution.covar(), unit_distribution().covar());
        assert_eq!(result.weights.len(), 4);
    }

    #[test]
    fn covar_decay_shrinks_covariance() {
        let updater = UpdaterCovarDecay::new(10.0, WeightingMethod::PiBb, 0.8).unwrap();
        let result = updater
            .update_distribution(&unit_distribution(), &square_samples(), &costs(&[1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        assert!((result.distribution.covar()[(0, 0)] - 0.64).abs() < 1e-12);
        assert!((result.distribution.covar()[(1, 1)] - 0.64).abs() < 1e-12);
        assert!(UpdaterCovarDecay::new(1.0, WeightingMethod::PiBb, 1.5).is_err());
    }

    #[test]
    fn covar_adaptation_respects_base_level() {
        let updater =
            UpdaterCovarAdaptation::new(1.0, WeightingMethod::Cem, 0.01, false, 1.0).unwrap();
        let result = updater
            .update_distribution(&unit_distribution(), &square_samples(), &costs(&[0.0, 5.0, 5.0, 5.0]))
            .unwrap();
        // only the first sample has weight: covariance collapses onto the x axis
        let covar = result.distribution.covar();
        assert!((covar[(0, 0)] - 1.0).abs() < 1e-9);
        assert!((covar[(1, 1)] - 0.01).abs() < 1e-9);
        assert!(covar[(0, 1)].abs() < 1e-9);
    }

    #[test]
    fn covar_adaptation_diag_only_blends() {
        let updater =
            UpdaterCovarAdaptation::new(10.0, WeightingMethod::PiBb, 0.0, true, 0.5).unwrap();
        let result = updater
            .update_distribution(&unit_distribution(), &square_samples(), &costs(&[1.0; 4]))
            .unwrap();
        // uniform weights: estimate is diag(0.5, 0.5), blended with identity
        let covar = result.distribution.covar();
        assert!((covar[(0, 0)] - 0.75).abs() < 1e-12);
        assert!((covar[(1, 1)] - 0.75).abs() < 1e-12);
        assert_eq!(covar[(0, 1)], 0.0);
    }

    #[test]
    fn updates_are_deterministic() {
        let spec = UpdaterSpec::CovarAdaptation {
            eliteness: 10.0,
            weighting: WeightingMethod::PiBb,
            base_level: 1e-6,
            diag_only: false,
            learning_rate: 0.75,
        };
        let updater = spec.build().unwrap();
        let costs = costs(&[0.3, 0.1, 0.7, 0.2]);
        let a = updater
            .update_distribution(&unit_distribution(), &square_samples(), &costs)
            .unwrap();
        let b = updater
            .update_distribution(&unit_distribution(), &square_samples(), &costs)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(updater.to_spec(), spec);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let updater = UpdaterMean::new(10.0, WeightingMethod::PiBb).unwrap();
        let err = updater
            .update_distribution(&unit_distribution(), &square_samples(), &costs(&[1.0, 2.0]))
            .unwrap_err();
        assert!(matches!(err, UpdaterError::ShapeMismatch { .. }));
    }

    #[test]
    fn spec_json_uses_snake_case_tags() {
        let json = r#"{"type":"covar_decay","eliteness":10,"weighting":"pi_bb","decay":0.9}"#;
        let spec: UpdaterSpec = serde_json::from_str(json).unwrap();
        assert_eq!(
            spec,
            UpdaterSpec::CovarDecay {
                eliteness: 10.0,
                weighting: WeightingMethod::PiBb,
                decay: 0.9
            }
        );
        assert_eq!(spec.build().unwrap().name(), "covar_decay");
    }
}
