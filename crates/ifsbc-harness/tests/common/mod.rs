//! Shared oracles and fixtures for the calibration integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use ifsbc_error::OracleError;
use ifsbc_harness::{
    CovariateSource, GaussianReferenceOracle, InferenceOracle, ReplicationSeeds,
    SyntheticDataGenerator, dataset_loglik,
};
use ifsbc_types::{
    Cx, Dataset, DrawMatrix, Family, INTERCEPT_VARIABLE, PriorConfig, SimulationSpec,
};
use nalgebra::{Cholesky, DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Prior with a known `sigma`, as required by the reference oracle.
pub fn known_sigma_prior() -> PriorConfig {
    let mut prior = PriorConfig::default();
    prior.aux.log_sd = 0.0;
    prior
}

pub fn reference_oracle(spec: &SimulationSpec, n_draws: usize) -> Arc<GaussianReferenceOracle> {
    Arc::new(GaussianReferenceOracle::new(spec.clone(), n_draws).expect("supported model"))
}

// ---------------------------------------------------------------------------
// Least-squares stub
// ---------------------------------------------------------------------------

/// Point estimate of the coefficients plus the auxiliary parameter.
#[derive(Debug, Clone)]
pub struct PointEstimate {
    coefficients: Vec<f64>,
    aux: f64,
}

/// Deterministic oracle for any log-link family: ordinary least squares on
/// `ln y`, spread into draws by a fixed small offset pattern.
#[derive(Debug, Clone)]
pub struct LeastSquaresOracle {
    spec: SimulationSpec,
    n_draws: usize,
    spread: f64,
    calls: Arc<AtomicUsize>,
}

impl LeastSquaresOracle {
    pub fn new(spec: &SimulationSpec, n_draws: usize) -> Self {
        Self {
            spec: spec.clone(),
            n_draws,
            spread: 0.02,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of `fit`/`update` calls observed so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn estimate(&self, data: &Dataset, aux: f64) -> Result<PointEstimate, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let p = self.spec.covariate_count + 1;
        if let Some(y) = data.y.iter().find(|&&y| !(y > 0.0)) {
            return Err(OracleError::Malformed(format!("non-positive response {y}")));
        }
        let design = DMatrix::from_fn(data.len(), p, |i, j| {
            if j == 0 { 1.0 } else { data.row(i)[j - 1] }
        });
        let log_y = DVector::from_iterator(data.len(), data.y.iter().map(|y| y.ln()));
        let normal = design.tr_mul(&design) + DMatrix::identity(p, p) * 1e-6;
        let coefficients = Cholesky::new(normal)
            .ok_or_else(|| OracleError::Numeric("singular normal equations".to_owned()))?
            .solve(&design.tr_mul(&log_y));
        Ok(PointEstimate {
            coefficients: coefficients.iter().copied().collect(),
            aux,
        })
    }

    fn offset(&self, s: usize) -> f64 {
        let centre = (self.n_draws as f64 - 1.0) / 2.0;
        self.spread * (s as f64 - centre) / self.n_draws as f64
    }

    fn draw_rows(&self, handle: &PointEstimate) -> Vec<BTreeMap<String, f64>> {
        let aux_name = self.spec.family.aux_name();
        (0..self.n_draws)
            .map(|s| {
                let shift = self.offset(s);
                let mut row = BTreeMap::new();
                row.insert(INTERCEPT_VARIABLE.to_owned(), handle.coefficients[0] + shift);
                for (k, beta) in handle.coefficients.iter().enumerate().skip(1) {
                    row.insert(format!("b_x{k}"), beta + shift);
                }
                row.insert(aux_name.to_owned(), handle.aux * (1.0 + shift));
                row
            })
            .collect()
    }
}

impl InferenceOracle for LeastSquaresOracle {
    type Handle = PointEstimate;

    fn fit(&self, data: &Dataset, prior: &PriorConfig, cx: &Cx) -> Result<PointEstimate, OracleError> {
        cx.checkpoint()?;
        self.estimate(data, prior.aux.log_mean.exp())
    }

    fn update(&self, handle: &PointEstimate, data: &Dataset, cx: &Cx) -> Result<PointEstimate, OracleError> {
        cx.checkpoint()?;
        self.estimate(data, handle.aux)
    }

    fn posterior_draws(
        &self,
        handle: &PointEstimate,
        variables: &[String],
    ) -> Result<DrawMatrix, OracleError> {
        let rows = self.draw_rows(handle);
        let mut columns = Vec::with_capacity(variables.len());
        for variable in variables {
            let column = rows
                .iter()
                .map(|row| row.get(variable).copied())
                .collect::<Option<Vec<f64>>>()
                .ok_or_else(|| OracleError::UnknownVariable(variable.clone()))?;
            columns.push((variable.clone(), column));
        }
        DrawMatrix::from_columns(columns).map_err(|err| OracleError::Malformed(err.to_string()))
    }

    fn pointwise_loglik(&self, handle: &PointEstimate, data: &Dataset) -> Result<Vec<f64>, OracleError> {
        Ok(self
            .draw_rows(handle)
            .iter()
            .map(|row| dataset_loglik(&self.spec, data, row, &[]))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Truth-echo stub
// ---------------------------------------------------------------------------

/// Oracle that returns each replication's own truth plus fixed small noise.
///
/// Truths are regenerated up front from the replication seeds and looked up
/// by the oracle entropy the runner hands to `fit`.
#[derive(Debug, Clone)]
pub struct TruthEchoOracle {
    spec: SimulationSpec,
    n_draws: usize,
    noise_sd: f64,
    truths: HashMap<u64, BTreeMap<String, f64>>,
}

impl TruthEchoOracle {
    pub fn new(
        spec: &SimulationSpec,
        prior: &PriorConfig,
        root_seed: u64,
        n_sims: u32,
        n_draws: usize,
    ) -> Self {
        let generator = SyntheticDataGenerator::new(spec.clone(), CovariateSource::StandardNormal)
            .expect("generator");
        let truths = (0..n_sims)
            .filter_map(|index| {
                let seeds = ReplicationSeeds::derive(root_seed, index);
                let simulated = generator.simulate(prior, seeds.simulate).ok()?;
                Some((seeds.oracle, simulated.truth.parameters))
            })
            .collect();
        Self {
            spec: spec.clone(),
            n_draws,
            noise_sd: 0.05,
            truths,
        }
    }

    fn echo(&self, cx: &Cx) -> Result<Vec<BTreeMap<String, f64>>, OracleError> {
        cx.checkpoint()?;
        let truth = self.truths.get(&cx.entropy_seed()).ok_or_else(|| {
            OracleError::Malformed(format!("no truth for entropy {}", cx.entropy_seed()))
        })?;
        let aux_name = self.spec.family.aux_name();
        let mut rng = StdRng::seed_from_u64(cx.entropy_seed());
        Ok((0..self.n_draws)
            .map(|_| {
                truth
                    .iter()
                    .map(|(name, &value)| {
                        let noise = self.noise_sd * rng.sample::<f64, _>(StandardNormal);
                        let drawn = if name == aux_name {
                            value * noise.exp()
                        } else {
                            value + noise
                        };
                        (name.clone(), drawn)
                    })
                    .collect()
            })
            .collect())
    }
}

impl InferenceOracle for TruthEchoOracle {
    type Handle = Vec<BTreeMap<String, f64>>;

    fn fit(&self, _data: &Dataset, _prior: &PriorConfig, cx: &Cx) -> Result<Self::Handle, OracleError> {
        self.echo(cx)
    }

    fn update(&self, _handle: &Self::Handle, _data: &Dataset, cx: &Cx) -> Result<Self::Handle, OracleError> {
        self.echo(cx)
    }

    fn posterior_draws(&self, handle: &Self::Handle, variables: &[String]) -> Result<DrawMatrix, OracleError> {
        let mut columns = Vec::with_capacity(variables.len());
        for variable in variables {
            let column = handle
                .iter()
                .map(|row| row.get(variable).copied())
                .collect::<Option<Vec<f64>>>()
                .ok_or_else(|| OracleError::UnknownVariable(variable.clone()))?;
            columns.push((variable.clone(), column));
        }
        DrawMatrix::from_columns(columns).map_err(|err| OracleError::Malformed(err.to_string()))
    }

    fn pointwise_loglik(&self, handle: &Self::Handle, data: &Dataset) -> Result<Vec<f64>, OracleError> {
        Ok(handle
            .iter()
            .map(|row| dataset_loglik(&self.spec, data, row, &[]))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Fault injection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Return a non-convergence error.
    Diverge,
    Panic,
    /// Spin on `checkpoint` until cancelled or timed out.
    Hang,
    /// Cancel the given batch context, then return normally.
    CancelBatch,
}

/// Wraps an oracle and injects `fault` into the replication whose oracle
/// entropy matches `target_entropy`.
pub struct FaultyOracle<O> {
    inner: O,
    target_entropy: u64,
    fault: Fault,
    batch: Option<Cx>,
}

impl<O: InferenceOracle> FaultyOracle<O> {
    pub fn new(inner: O, root_seed: u64, target_index: u32, fault: Fault) -> Self {
        Self {
            inner,
            target_entropy: ReplicationSeeds::derive(root_seed, target_index).oracle,
            fault,
            batch: None,
        }
    }

    pub fn with_batch(mut self, batch: Cx) -> Self {
        self.batch = Some(batch);
        self
    }

    fn inject(&self, cx: &Cx) -> Result<(), OracleError> {
        if cx.entropy_seed() != self.target_entropy {
            return Ok(());
        }
        match self.fault {
            Fault::Diverge => Err(OracleError::NonConvergence("chains disagree".to_owned())),
            Fault::Panic => panic!("injected oracle panic"),
            Fault::Hang => loop {
                cx.checkpoint()?;
                thread::sleep(Duration::from_millis(5));
            },
            Fault::CancelBatch => {
                if let Some(batch) = &self.batch {
                    batch.cancel();
                }
                Ok(())
            }
        }
    }
}

impl<O: InferenceOracle> InferenceOracle for FaultyOracle<O> {
    type Handle = O::Handle;

    fn fit(&self, data: &Dataset, prior: &PriorConfig, cx: &Cx) -> Result<O::Handle, OracleError> {
        self.inject(cx)?;
        self.inner.fit(data, prior, cx)
    }

    fn update(&self, handle: &O::Handle, data: &Dataset, cx: &Cx) -> Result<O::Handle, OracleError> {
        self.inject(cx)?;
        self.inner.update(handle, data, cx)
    }

    fn posterior_draws(&self, handle: &O::Handle, variables: &[String]) -> Result<DrawMatrix, OracleError> {
        self.inner.posterior_draws(handle, variables)
    }

    fn pointwise_loglik(&self, handle: &O::Handle, data: &Dataset) -> Result<Vec<f64>, OracleError> {
        self.inner.pointwise_loglik(handle, data)
    }
}

/// Small lognormal model the reference oracle supports.
pub fn small_lognormal_spec() -> SimulationSpec {
    SimulationSpec::new(Family::Lognormal, 20, 2)
}

/// Pearson chi-square of `counts` against a flat expectation.
pub fn chi_square(counts: &[usize]) -> f64 {
    let total: usize = counts.iter().sum();
    let expected = total as f64 / counts.len() as f64;
    counts
        .iter()
        .map(|&c| {
            let d = c as f64 - expected;
            d * d / expected
        })
        .sum()
}
