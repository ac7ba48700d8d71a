//! Multivariate Gaussian sampling distribution.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::errors::{SbError, SbResult};
use crate::setup_error;

/// Relative tolerance used when checking symmetry and eigenvalue signs.
const VALIDITY_TOLERANCE: f64 = 1e-9;

/// Gaussian distribution over the policy parameter space.
///
/// The covariance is always square, symmetric and positive semi-definite;
/// [`DistributionGaussian::new`] is the only way to build one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DistributionDocument", into = "DistributionDocument")]
pub struct DistributionGaussian {
    mean: DVector<f64>,
    covar: DMatrix<f64>,
}

impl DistributionGaussian {
    pub fn new(mean: DVector<f64>, covar: DMatrix<f64>) -> SbResult<Self> {
        let dim = mean.len();
        if dim == 0 {
            return Err(setup_error!("distribution mean must not be empty"));
        }
        if covar.nrows() != dim || covar.ncols() != dim {
            return Err(setup_error!(
                "covariance must be {dim}x{dim}, got {}x{}",
                covar.nrows(),
                covar.ncols()
            ));
        }
        if mean.iter().chain(covar.iter()).any(|v| !v.is_finite()) {
            return Err(setup_error!("distribution contains non-finite values"));
        }

        let scale = covar.iter().fold(0.0_f64, |acc, v| acc.max(v.abs())).max(1.0);
        let asymmetry = (&covar - covar.transpose()).amax();
        if asymmetry > VALIDITY_TOLERANCE * scale {
            return Err(setup_error!(
                "covariance is not symmetric (max deviation {asymmetry:e})"
            ));
        }

        let eigen = SymmetricEigen::new(covar.clone());
        let min_eigenvalue = eigen.eigenvalues.min();
        if min_eigenvalue < -VALIDITY_TOLERANCE * scale {
            return Err(setup_error!(
                "covariance has a negative eigenvalue ({min_eigenvalue:e})"
            ));
        }

        Ok(Self { mean, covar })
    }

    /// Isotropic distribution `N(mean, variance * I)`.
    pub fn isotropic(mean: DVector<f64>, variance: f64) -> SbResult<Self> {
        let dim = mean.len();
        Self::new(mean, DMatrix::identity(dim, dim) * variance)
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    pub fn covar(&self) -> &DMatrix<f64> {
        &self.covar
    }

    pub fn max_eigenvalue(&self) -> f64 {
        SymmetricEigen::new(self.covar.clone()).eigenvalues.max()
    }

    /// Draw `n_samples` samples, one per row of the returned `n_samples x dim` matrix.
    pub fn generate_samples<R: Rng + ?Sized>(&self, n_samples: usize, rng: &mut R) -> DMatrix<f64> {
        let dim = self.dim();

        // C = V * L * V^T, so x = mean + V * sqrt(L) * z with z ~ N(0, I)
        let eigen = SymmetricEigen::new(self.covar.clone());
        let sqrt_eigenvalues = eigen.eigenvalues.map(|v| v.max(0.0).sqrt());
        let transform = &eigen.eigenvectors * DMatrix::from_diagonal(&sqrt_eigenvalues);

        let mut samples = DMatrix::zeros(n_samples, dim);
        for i in 0..n_samples {
            let z = DVector::from_fn(dim, |_, _| rng.sample::<f64, _>(StandardNormal));
            let x = &self.mean + &transform * z;
            samples.set_row(i, &x.transpose());
        }
        samples
    }
}

/// Plain serde form: `{"mean": [..], "covar": [[..], ..]}` with row-major covariance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionDocument {
    pub mean: Vec<f64>,
    pub covar: Vec<Vec<f64>>,
}

impl TryFrom<DistributionDocument> for DistributionGaussian {
    type Error = SbError;

    fn try_from(doc: DistributionDocument) -> SbResult<Self> {
        let dim = doc.mean.len();
        if doc.covar.len() != dim || doc.covar.iter().any(|row| row.len() != dim) {
            return Err(setup_error!(
                "covariance must have {dim} rows of {dim} values"
            ));
        }
        let covar = DMatrix::from_fn(dim, dim, |r, c| doc.covar[r][c]);
        Self::new(DVector::from_vec(doc.mean), covar)
    }
}

impl From<DistributionGaussian> for DistributionDocument {
    fn from(distribution: DistributionGaussian) -> Self {
        let covar = distribution
            .covar
            .row_iter()
            .map(|row| row.iter().copied().collect())
            .collect();
        Self {
            mean: distribution.mean.iter().copied().collect(),
            covar,
        }
    }
}
