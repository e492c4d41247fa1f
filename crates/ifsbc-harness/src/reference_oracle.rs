//! Exactly calibrated reference oracle.
//!
//! For the log-normal family with a known `sigma` (prior `aux.log_sd = 0`)
//! and no grouping, the posterior of the regression coefficients on
//! `ln y` is Gaussian and available in closed form:
//!
//! ```text
//! Λ = Λ0 + XᵀX / σ²
//! μ = Λ⁻¹ (Λ0 μ0 + Xᵀ ln y / σ²)
//! ```
//!
//! `fit` starts from the declared prior (`Λ0 = diag(1/sd²)`, or zero for an
//! improper prior); `update` starts from the handle's posterior. Draws are
//! i.i.d. from the exact posterior, so SBC ranks under this oracle are
//! uniform by construction. The harness uses it to check itself.

use std::collections::BTreeMap;

use ifsbc_error::{CalibrationError, OracleError, Result};
use ifsbc_types::{
    Cx, Dataset, DrawMatrix, Family, INTERCEPT_VARIABLE, PriorConfig, SimulationSpec,
};
use nalgebra::{Cholesky, DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::generator::dataset_loglik;
use crate::oracle::InferenceOracle;

/// Conjugate Gaussian posterior over `[b_Intercept, b_x1, .., b_xK]`.
#[derive(Debug, Clone)]
pub struct GaussianPosterior {
    precision: DMatrix<f64>,
    mean: DVector<f64>,
    sigma: f64,
    /// Row-major `S × p` coefficient draws.
    draws: Vec<f64>,
}

impl GaussianPosterior {
    #[must_use]
    pub fn mean(&self) -> &[f64] {
        self.mean.as_slice()
    }

    #[must_use]
    pub const fn sigma(&self) -> f64 {
        self.sigma
    }
}

#[derive(Debug, Clone)]
pub struct GaussianReferenceOracle {
    spec: SimulationSpec,
    n_draws: usize,
}

impl GaussianReferenceOracle {
    pub fn new(spec: SimulationSpec, n_draws: usize) -> Result<Self> {
        spec.validate()?;
        if spec.family != Family::Lognormal || spec.group_count.is_some() {
            return Err(CalibrationError::config(format!(
                "reference oracle supports ungrouped lognormal models only, got {} (groups: {:?})",
                spec.family, spec.group_count
            )));
        }
        if n_draws == 0 {
            return Err(CalibrationError::config("reference oracle needs at least one draw"));
        }
        Ok(Self { spec, n_draws })
    }

    fn width(&self) -> usize {
        self.spec.covariate_count + 1
    }

    fn names(&self) -> Vec<String> {
        let mut names = vec![INTERCEPT_VARIABLE.to_owned()];
        names.extend((1..=self.spec.covariate_count).map(|k| format!("b_x{k}")));
        names
    }

    fn condition(
        &self,
        prior_precision: DMatrix<f64>,
        prior_mean: &DVector<f64>,
        sigma: f64,
        data: &Dataset,
        cx: &Cx,
    ) -> std::result::Result<GaussianPosterior, OracleError> {
        let p = self.width();
        if data.n_covariates != self.spec.covariate_count {
            return Err(OracleError::Malformed(format!(
                "dataset has {} covariates, model expects {}",
                data.n_covariates, self.spec.covariate_count
            )));
        }
        if data.y.iter().any(|&y| !(y > 0.0)) {
            return Err(OracleError::Malformed(
                "lognormal response must be positive".to_owned(),
            ));
        }

        let inv_var = 1.0 / (sigma * sigma);
        let mut rhs = &prior_precision * prior_mean;
        let mut precision = prior_precision;
        for i in 0..data.len() {
            let x = design_row(data, i);
            rhs.axpy(data.y[i].ln() * inv_var, &x, 1.0);
            precision.ger(inv_var, &x, &x, 1.0);
        }
        cx.checkpoint()?;

        let chol = Cholesky::new(precision.clone()).ok_or_else(|| {
            OracleError::Numeric("posterior precision is not positive definite".to_owned())
        })?;
        let mean = chol.solve(&rhs);
        if mean.iter().any(|m| !m.is_finite()) {
            return Err(OracleError::Numeric("posterior mean is not finite".to_owned()));
        }

        // x = μ + L⁻ᵀ ε has covariance Λ⁻¹ when Λ = L Lᵀ.
        let upper = chol.l().transpose();
        let mut rng = StdRng::seed_from_u64(cx.entropy_seed());
        let mut draws = Vec::with_capacity(self.n_draws * p);
        for _ in 0..self.n_draws {
            let eps = DVector::from_fn(p, |_, _| rng.sample::<f64, _>(StandardNormal));
            let offset = upper.solve_upper_triangular(&eps).ok_or_else(|| {
                OracleError::Numeric("singular Cholesky factor".to_owned())
            })?;
            draws.extend((&mean + offset).iter().copied());
        }

        Ok(GaussianPosterior {
            precision,
            mean,
            sigma,
            draws,
        })
    }
}

/// `[1, x_i1, .., x_iK]` for observation `i`.
fn design_row(data: &Dataset, i: usize) -> DVector<f64> {
    DVector::from_iterator(
        data.n_covariates + 1,
        std::iter::once(1.0).chain(data.row(i).iter().copied()),
    )
}

impl InferenceOracle for GaussianReferenceOracle {
    type Handle = GaussianPosterior;

    fn fit(
        &self,
        data: &Dataset,
        prior: &PriorConfig,
        cx: &Cx,
    ) -> std::result::Result<GaussianPosterior, OracleError> {
        if prior.aux.log_sd != 0.0 {
            return Err(OracleError::Malformed(
                "reference oracle needs a known sigma (aux.log_sd = 0)".to_owned(),
            ));
        }
        let p = self.width();
        let mut precision = DMatrix::zeros(p, p);
        let mut mean = DVector::from_element(p, prior.coefficients.mean);
        mean[0] = prior.intercept.mean;
        if !prior.improper {
            for j in 0..p {
                let sd = if j == 0 {
                    prior.intercept.sd
                } else {
                    prior.coefficients.sd
                };
                if !(sd > 0.0) {
                    return Err(OracleError::Malformed(format!(
                        "prior sd must be positive for a proper Gaussian prior, got {sd}"
                    )));
                }
                precision[(j, j)] = 1.0 / (sd * sd);
            }
        }
        self.condition(precision, &mean, prior.aux.log_mean.exp(), data, cx)
    }

    fn update(
        &self,
        handle: &GaussianPosterior,
        data: &Dataset,
        cx: &Cx,
    ) -> std::result::Result<GaussianPosterior, OracleError> {
        self.condition(
            handle.precision.clone(),
            &handle.mean,
            handle.sigma,
            data,
            cx,
        )
    }

    fn posterior_draws(
        &self,
        handle: &GaussianPosterior,
        variables: &[String],
    ) -> std::result::Result<DrawMatrix, OracleError> {
        let p = self.width();
        let names = self.names();
        let aux = self.spec.family.aux_name();
        let mut columns = Vec::with_capacity(variables.len());
        for variable in variables {
            let column = if variable == aux {
                vec![handle.sigma; self.n_draws]
            } else {
                let j = names
                    .iter()
                    .position(|n| n == variable)
                    .ok_or_else(|| OracleError::UnknownVariable(variable.clone()))?;
                handle.draws.iter().skip(j).step_by(p).copied().collect()
            };
            columns.push((variable.clone(), column));
        }
        DrawMatrix::from_columns(columns).map_err(|err| OracleError::Numeric(err.to_string()))
    }

    fn pointwise_loglik(
        &self,
        handle: &GaussianPosterior,
        data: &Dataset,
    ) -> std::result::Result<Vec<f64>, OracleError> {
        let p = self.width();
        let names = self.names();
        let aux = self.spec.family.aux_name().to_owned();
        Ok(handle
            .draws
            .chunks_exact(p)
            .map(|row| {
                let mut params: BTreeMap<String, f64> =
                    names.iter().cloned().zip(row.iter().copied()).collect();
                params.insert(aux.clone(), handle.sigma);
                dataset_loglik(&self.spec, data, &params, &[])
            })
            .collect())
    }
}
