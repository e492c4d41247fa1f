//! Calibration run configuration.
//!
//! Loadable from TOML or JSON. Every field except `n_sims` has a default:
//!
//! ```toml
//! n_sims = 200
//! batch_size = 50
//! lb = 1e-12
//! ub = 1e300
//! truncate = false
//! root_seed = 42
//! timeout_ms = 30000
//! tie_break = "randomized"
//! tracked_variables = ["b_x1", "loglik"]
//! ```

use std::path::Path;

use ifsbc_error::{CalibrationError, Result};
use ifsbc_types::{Dataset, SimulationSpec};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::rank_computer::{RankPolicy, TieBreak};

const DEFAULT_MISCOVERAGE: f64 = 0.05;
const DEFAULT_REFERENCE_SIMULATIONS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Number of replications.
    pub n_sims: usize,

    /// Replications per sequential chunk; defaults to `n_sims`.
    #[serde(default)]
    pub batch_size: Option<usize>,

    /// Lower rank-clipping bound.
    #[serde(default = "neg_infinity")]
    pub lb: f64,

    /// Upper rank-clipping bound.
    #[serde(default = "pos_infinity")]
    pub ub: f64,

    /// Record boundary ranks as NA instead of saturating.
    #[serde(default)]
    pub truncate: bool,

    #[serde(default)]
    pub root_seed: u64,

    /// Externally supplied precondition sample.
    #[serde(default)]
    pub precon_sample: Option<Dataset>,

    /// Size of an internally simulated precondition sample.
    #[serde(default)]
    pub precon_sample_size: Option<usize>,

    /// Worker-pool size; defaults to available parallelism.
    #[serde(default)]
    pub workers: Option<usize>,

    /// Per-replication oracle deadline.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub tie_break: TieBreak,

    /// Subset of variables to rank; defaults to the full layout plus `loglik`.
    #[serde(default)]
    pub tracked_variables: Option<Vec<String>>,

    /// Simultaneous miscoverage level `L` of the discrepancy band.
    #[serde(default = "default_miscoverage")]
    pub miscoverage: f64,

    /// Monte-Carlo size of the adjust-gamma reference.
    #[serde(default = "default_reference_simulations")]
    pub reference_simulations: usize,

    /// Retain posterior draws on ranked replications.
    #[serde(default)]
    pub keep_draws: bool,
}

const fn neg_infinity() -> f64 {
    f64::NEG_INFINITY
}

const fn pos_infinity() -> f64 {
    f64::INFINITY
}

const fn default_miscoverage() -> f64 {
    DEFAULT_MISCOVERAGE
}

const fn default_reference_simulations() -> usize {
    DEFAULT_REFERENCE_SIMULATIONS
}

impl CalibrationConfig {
    #[must_use]
    pub const fn new(n_sims: usize) -> Self {
        Self {
            n_sims,
            batch_size: None,
            lb: f64::NEG_INFINITY,
            ub: f64::INFINITY,
            truncate: false,
            root_seed: 0,
            precon_sample: None,
            precon_sample_size: None,
            workers: None,
            timeout_ms: None,
            tie_break: TieBreak::Randomized,
            tracked_variables: None,
            miscoverage: DEFAULT_MISCOVERAGE,
            reference_simulations: DEFAULT_REFERENCE_SIMULATIONS,
            keep_draws: false,
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|err| {
            CalibrationError::config(format!("calibration config TOML parse failure: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).map_err(|err| {
            CalibrationError::config(format!("calibration config JSON parse failure: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load by file extension (`.json`, otherwise TOML).
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
            Self::from_json_str(&text)
        } else {
            Self::from_toml_str(&text)
        }
    }

    /// Every violated constraint, in field order.
    #[must_use]
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.n_sims == 0 {
            errors.push("n_sims must be > 0".to_owned());
        }
        if u32::try_from(self.n_sims).is_err() {
            errors.push(format!("n_sims ({}) exceeds u32 range", self.n_sims));
        }
        if let Some(batch) = self.batch_size {
            if batch == 0 || batch > self.n_sims {
                errors.push(format!(
                    "batch_size ({batch}) must lie in 1..={}",
                    self.n_sims
                ));
            }
        }
        if self.lb.is_nan() || self.ub.is_nan() {
            errors.push("lb and ub must not be NaN".to_owned());
        } else if self.lb > self.ub {
            errors.push(format!("lb ({}) > ub ({})", self.lb, self.ub));
        }
        if self.precon_sample.is_some() && self.precon_sample_size.is_some() {
            errors.push("precon_sample and precon_sample_size are mutually exclusive".to_owned());
        }
        if self.precon_sample_size == Some(0) {
            errors.push("precon_sample_size must be > 0".to_owned());
        }
        if self.workers == Some(0) {
            errors.push("workers must be >= 1".to_owned());
        }
        if self.timeout_ms == Some(0) {
            errors.push("timeout_ms must be > 0".to_owned());
        }
        if !(self.miscoverage > 0.0 && self.miscoverage < 1.0) {
            errors.push(format!(
                "miscoverage ({}) must lie in (0, 1)",
                self.miscoverage
            ));
        }
        if self.reference_simulations == 0 {
            errors.push("reference_simulations must be >= 1".to_owned());
        }
        if self
            .tracked_variables
            .as_ref()
            .is_some_and(std::vec::Vec::is_empty)
        {
            errors.push("tracked_variables must not be empty when given".to_owned());
        }

        errors
    }

    pub fn validate(&self) -> Result<()> {
        let errors = self.validation_errors();
        if errors.is_empty() {
            return Ok(());
        }
        error!(
            error_count = errors.len(),
            first = %errors[0],
            "calibration config rejected"
        );
        Err(CalibrationError::config(errors.join("; ")))
    }

    #[must_use]
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.unwrap_or(self.n_sims).max(1)
    }

    #[must_use]
    pub fn effective_workers(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        })
    }

    #[must_use]
    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.timeout_ms.map(std::time::Duration::from_millis)
    }

    pub fn rank_policy(&self) -> Result<RankPolicy> {
        Ok(RankPolicy::new(self.lb, self.ub, self.truncate)?.with_tie_break(self.tie_break))
    }

    /// Tracked variables resolved against the layout of `spec`.
    pub fn resolve_variables(&self, spec: &SimulationSpec) -> Result<Vec<String>> {
        let layout = spec.rank_variables();
        let Some(requested) = &self.tracked_variables else {
            return Ok(layout);
        };
        if let Some(unknown) = requested.iter().find(|v| !layout.contains(v)) {
            return Err(CalibrationError::config(format!(
                "tracked variable `{unknown}` is not in the {} layout {layout:?}",
                spec.family
            )));
        }
        // Layout order keeps the tie-break stream independent of request order.
        Ok(layout
            .into_iter()
            .filter(|v| requested.contains(v))
            .collect())
    }
}
