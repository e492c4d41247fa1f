//! Generator configuration: family, link, shape, and the base prior.

use std::fmt;

use ifsbc_error::{CalibrationError, Result};
use serde::{Deserialize, Serialize};

/// Name of the log-likelihood pseudo-variable tracked alongside parameters.
pub const LOGLIK_VARIABLE: &str = "loglik";
/// Name of the intercept in the parameter layout.
pub const INTERCEPT_VARIABLE: &str = "b_Intercept";
/// Name of the group-intercept standard deviation in grouped layouts.
pub const GROUP_SD_VARIABLE: &str = "sd_group";

/// Response family of the synthetic data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Gamma,
    Weibull,
    Lognormal,
    Beta,
    Frechet,
}

impl Family {
    pub const ALL: [Self; 5] = [
        Self::Gamma,
        Self::Weibull,
        Self::Lognormal,
        Self::Beta,
        Self::Frechet,
    ];

    /// The only link each family accepts.
    #[must_use]
    pub const fn canonical_link(self) -> Link {
        match self {
            Self::Gamma | Self::Weibull | Self::Frechet => Link::Log,
            Self::Lognormal => Link::Identity,
            Self::Beta => Link::Logit,
        }
    }

    /// Name of the family's auxiliary (shape / dispersion) parameter.
    #[must_use]
    pub const fn aux_name(self) -> &'static str {
        match self {
            Self::Gamma | Self::Weibull => "shape",
            Self::Lognormal => "sigma",
            Self::Beta => "phi",
            Self::Frechet => "nu",
        }
    }

    /// Whether the response lives on the unit interval.
    #[must_use]
    pub const fn is_unit_interval(self) -> bool {
        matches!(self, Self::Beta)
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gamma => f.write_str("gamma"),
            Self::Weibull => f.write_str("weibull"),
            Self::Lognormal => f.write_str("lognormal"),
            Self::Beta => f.write_str("beta"),
            Self::Frechet => f.write_str("frechet"),
        }
    }
}

/// Link between the linear predictor and the family's location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Link {
    Identity,
    Log,
    Logit,
}

impl Link {
    /// Map a linear predictor to the location scale.
    #[must_use]
    pub fn inverse(self, eta: f64) -> f64 {
        match self {
            Self::Identity => eta,
            Self::Log => eta.exp(),
            Self::Logit => 1.0 / (1.0 + (-eta).exp()),
        }
    }
}

/// One immutable generator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationSpec {
    pub family: Family,
    pub sample_size: usize,
    pub covariate_count: usize,
    #[serde(default)]
    pub group_count: Option<usize>,
    pub link: Link,
}

impl SimulationSpec {
    /// Spec with the family's canonical link and no grouping.
    #[must_use]
    pub const fn new(family: Family, sample_size: usize, covariate_count: usize) -> Self {
        Self {
            family,
            sample_size,
            covariate_count,
            group_count: None,
            link: family.canonical_link(),
        }
    }

    #[must_use]
    pub const fn with_groups(mut self, group_count: usize) -> Self {
        self.group_count = Some(group_count);
        self
    }

    #[must_use]
    pub const fn with_link(mut self, link: Link) -> Self {
        self.link = link;
        self
    }

    /// Reject family/shape combinations outside the family's domain.
    pub fn validate(&self) -> Result<()> {
        if self.sample_size == 0 {
            return Err(CalibrationError::config("sample_size must be positive"));
        }
        if self.link != self.family.canonical_link() {
            return Err(CalibrationError::config(format!(
                "family {} does not support link {:?} (expected {:?})",
                self.family,
                self.link,
                self.family.canonical_link()
            )));
        }
        if let Some(groups) = self.group_count {
            if groups < 2 {
                return Err(CalibrationError::config(format!(
                    "group_count must be at least 2, got {groups}"
                )));
            }
        }
        Ok(())
    }

    /// Parameter names in layout order (excludes the `loglik` pseudo-variable).
    #[must_use]
    pub fn parameter_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.covariate_count + 3);
        names.push(INTERCEPT_VARIABLE.to_owned());
        names.extend((1..=self.covariate_count).map(|k| format!("b_x{k}")));
        names.push(self.family.aux_name().to_owned());
        if self.group_count.is_some() {
            names.push(GROUP_SD_VARIABLE.to_owned());
        }
        names
    }

    /// Every rankable variable: parameters followed by `loglik`.
    #[must_use]
    pub fn rank_variables(&self) -> Vec<String> {
        let mut names = self.parameter_names();
        names.push(LOGLIK_VARIABLE.to_owned());
        names
    }
}

/// Normal(mean, sd) prior; `sd == 0` is a point mass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalPrior {
    pub mean: f64,
    pub sd: f64,
}

/// LogNormal(log_mean, log_sd) prior for positive auxiliary parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogNormalPrior {
    pub log_mean: f64,
    pub log_sd: f64,
}

/// Base prior used to simulate truths and to fit without preconditioning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorConfig {
    pub intercept: NormalPrior,
    pub coefficients: NormalPrior,
    pub aux: LogNormalPrior,
    /// Half-normal scale for `sd_group`.
    pub group_sd_scale: f64,
    /// Flat prior on intercept and coefficients when fitting. Truths cannot
    /// be simulated from it.
    #[serde(default)]
    pub improper: bool,
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            intercept: NormalPrior { mean: 0.0, sd: 1.0 },
            coefficients: NormalPrior { mean: 0.0, sd: 0.5 },
            aux: LogNormalPrior {
                log_mean: 1.0,
                log_sd: 0.3,
            },
            group_sd_scale: 0.5,
            improper: false,
        }
    }
}

impl PriorConfig {
    /// Same prior with every scale multiplied by `factor` (prior-width sweeps).
    #[must_use]
    pub fn widened(mut self, factor: f64) -> Self {
        self.intercept.sd *= factor;
        self.coefficients.sd *= factor;
        self.aux.log_sd *= factor;
        self.group_sd_scale *= factor;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let scales = [
            ("intercept.sd", self.intercept.sd),
            ("coefficients.sd", self.coefficients.sd),
            ("aux.log_sd", self.aux.log_sd),
            ("group_sd_scale", self.group_sd_scale),
        ];
        for (name, value) in scales {
            if !value.is_finite() || value < 0.0 {
                return Err(CalibrationError::config(format!(
                    "prior {name} must be finite and non-negative, got {value}"
                )));
            }
        }
        let locations = [
            ("intercept.mean", self.intercept.mean),
            ("coefficients.mean", self.coefficients.mean),
            ("aux.log_mean", self.aux.log_mean),
        ];
        for (name, value) in locations {
            if !value.is_finite() {
                return Err(CalibrationError::config(format!(
                    "prior {name} must be finite, got {value}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_orders_intercept_coefficients_aux_group() {
        let spec = SimulationSpec::new(Family::Gamma, 50, 2).with_groups(4);
        assert_eq!(
            spec.parameter_names(),
            vec!["b_Intercept", "b_x1", "b_x2", "shape", "sd_group"]
        );
        assert_eq!(spec.rank_variables().last().map(String::as_str), Some("loglik"));
    }

    #[test]
    fn aux_names_follow_family() {
        assert_eq!(Family::Lognormal.aux_name(), "sigma");
        assert_eq!(Family::Beta.aux_name(), "phi");
        assert_eq!(Family::Frechet.aux_name(), "nu");
    }

    #[test]
    fn mismatched_link_is_configuration_error() {
        let spec = SimulationSpec::new(Family::Beta, 10, 1).with_link(Link::Log);
        let err = spec.validate().expect_err("beta with log link must be rejected");
        assert!(err.is_fatal_configuration());
    }

    #[test]
    fn zero_sample_size_rejected() {
        assert!(SimulationSpec::new(Family::Gamma, 0, 1).validate().is_err());
    }

    #[test]
    fn single_group_rejected() {
        let spec = SimulationSpec::new(Family::Weibull, 10, 0).with_groups(1);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn logit_inverse_is_bounded() {
        assert!(Link::Logit.inverse(40.0) <= 1.0);
        assert!(Link::Logit.inverse(-40.0) >= 0.0);
        assert!((Link::Logit.inverse(0.0) - 0.5).abs() < 1e-15);
    }

    #[test]
    fn widened_prior_scales_every_sd() {
        let wide = PriorConfig::default().widened(2.0);
        assert_eq!(wide.coefficients.sd, 1.0);
        assert_eq!(wide.intercept.sd, 2.0);
    }

    #[test]
    fn negative_prior_scale_rejected() {
        let mut prior = PriorConfig::default();
        prior.coefficients.sd = -1.0;
        assert!(prior.validate().is_err());
    }
}
