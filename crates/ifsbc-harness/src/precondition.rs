//! Inverse forward sampling: conditioning the prior on a fixed sample.
//!
//! A [`PreconditionSample`] is created once per invocation (or once per sweep
//! point) and never mutated. [`PreconditionedPrior::condition`] fits the
//! oracle on it a single time; afterwards the fitted handle is only read:
//! truths are drawn from its cached posterior draws and every replication's
//! inference is an `update` that returns a new handle.

use std::collections::BTreeMap;
use std::sync::Arc;

use ifsbc_error::{CalibrationError, OracleError, Result};
use ifsbc_types::{Cx, Dataset, DrawMatrix, PriorConfig, SimulationSpec};
use rand::Rng;
use rand::rngs::StdRng;
use tracing::info;

use crate::generator::{SyntheticDataGenerator, TruthSampler};
use crate::oracle::InferenceOracle;
use crate::seed_taxonomy::precondition_seed;

/// Dataset held fixed for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum PreconditionSample {
    /// Supplied by the caller (typically real data).
    External(Dataset),
    /// Simulated once from the base prior.
    Simulated { seed: u64, data: Dataset },
}

impl PreconditionSample {
    pub fn from_dataset(data: Dataset) -> Result<Self> {
        data.validate()?;
        Ok(Self::External(data))
    }

    /// Simulate a sample of `sample_size` observations under `prior`, seeded
    /// from the `precondition` branch of the root seed.
    pub fn simulate(
        generator: &SyntheticDataGenerator,
        prior: &PriorConfig,
        root_seed: u64,
        sample_size: usize,
    ) -> Result<Self> {
        prior.check(generator.spec())?;
        let seed = precondition_seed(root_seed, sample_size);
        let sim = generator
            .resized(sample_size)?
            .simulate(prior, seed)
            .map_err(|reason| {
                CalibrationError::config(format!("precondition sample simulation failed: {reason}"))
            })?;
        Ok(Self::Simulated {
            seed,
            data: sim.data,
        })
    }

    #[must_use]
    pub const fn data(&self) -> &Dataset {
        match self {
            Self::External(data) | Self::Simulated { data, .. } => data,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }
}

/// Posterior fit on a precondition sample, used as the effective prior.
#[derive(Debug)]
pub struct PreconditionedPrior<H> {
    handle: H,
    draws: DrawMatrix,
    sample_len: usize,
}

impl<H: Send + Sync + 'static> PreconditionedPrior<H> {
    /// Fit `oracle` once on `sample` under `base_prior`.
    ///
    /// Any oracle failure here is fatal: no replication can run without the
    /// effective prior, so it surfaces as a configuration error.
    pub fn condition<O>(
        oracle: &O,
        sample: &PreconditionSample,
        base_prior: &PriorConfig,
        spec: &SimulationSpec,
        cx: &Cx,
    ) -> Result<Self>
    where
        O: InferenceOracle<Handle = H>,
    {
        let data = sample.data();
        if data.n_covariates != spec.covariate_count {
            return Err(CalibrationError::config(format!(
                "precondition sample has {} covariates, spec declares {}",
                data.n_covariates, spec.covariate_count
            )));
        }
        let fatal = |err: OracleError| {
            CalibrationError::config(format!("precondition fit failed: {err}"))
        };
        let handle = oracle.fit(data, base_prior, cx).map_err(fatal)?;
        let draws = oracle
            .posterior_draws(&handle, &spec.parameter_names())
            .map_err(fatal)?;
        if let Some(missing) = spec
            .parameter_names()
            .into_iter()
            .find(|name| draws.column_index(name).is_none())
        {
            return Err(CalibrationError::config(format!(
                "precondition posterior lacks parameter `{missing}`"
            )));
        }
        if draws.n_draws() == 0 {
            return Err(CalibrationError::config(
                "precondition posterior returned no draws",
            ));
        }
        info!(
            sample_len = data.len(),
            draws = draws.n_draws(),
            family = %spec.family,
            "prior preconditioned"
        );
        Ok(Self {
            handle,
            draws,
            sample_len: data.len(),
        })
    }
}

impl<H> PreconditionedPrior<H> {
    #[must_use]
    pub fn handle(&self) -> &H {
        &self.handle
    }

    #[must_use]
    pub const fn draws(&self) -> &DrawMatrix {
        &self.draws
    }

    #[must_use]
    pub const fn sample_len(&self) -> usize {
        self.sample_len
    }
}

impl<H: Send + Sync> TruthSampler for PreconditionedPrior<H> {
    fn check(&self, spec: &SimulationSpec) -> Result<()> {
        match spec
            .parameter_names()
            .into_iter()
            .find(|name| self.draws.column_index(name).is_none())
        {
            Some(missing) => Err(CalibrationError::config(format!(
                "preconditioned prior lacks parameter `{missing}`"
            ))),
            None => Ok(()),
        }
    }

    /// A uniformly chosen posterior draw of the precondition fit.
    fn draw_parameters(&self, spec: &SimulationSpec, rng: &mut StdRng) -> BTreeMap<String, f64> {
        let s = rng.gen_range(0..self.draws.n_draws());
        let layout = spec.parameter_names();
        self.draws
            .row(s)
            .into_iter()
            .filter(|(name, _)| layout.iter().any(|l| l == name))
            .map(|(name, value)| (name.to_owned(), value))
            .collect()
    }
}

/// The prior every replication of one invocation starts from.
#[derive(Debug)]
pub enum EffectivePrior<H> {
    /// Truths drawn from, and fits started at, the declared prior.
    Base(Arc<PriorConfig>),
    /// Truths drawn from the preconditioned posterior; fits are updates of it.
    Preconditioned(Arc<PreconditionedPrior<H>>),
}

impl<H> Clone for EffectivePrior<H> {
    fn clone(&self) -> Self {
        match self {
            Self::Base(prior) => Self::Base(Arc::clone(prior)),
            Self::Preconditioned(pre) => Self::Preconditioned(Arc::clone(pre)),
        }
    }
}

impl<H: Send + Sync> EffectivePrior<H> {
    #[must_use]
    pub fn truth_sampler(&self) -> &dyn TruthSampler {
        match self {
            Self::Base(prior) => prior.as_ref(),
            Self::Preconditioned(pre) => pre.as_ref(),
        }
    }

    #[must_use]
    pub const fn is_preconditioned(&self) -> bool {
        matches!(self, Self::Preconditioned(_))
    }
}
