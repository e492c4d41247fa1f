//! Parametric response families: location/aux parameterization, sampling,
//! and log densities.
//!
//! | family    | location `mu`            | aux      | response law                           |
//! |-----------|--------------------------|----------|----------------------------------------|
//! | gamma     | mean (log link)          | `shape`  | Gamma(shape, mu / shape)               |
//! | weibull   | mean (log link)          | `shape`  | Weibull(mu / Γ(1 + 1/shape), shape)    |
//! | lognormal | meanlog (identity link)  | `sigma`  | LogNormal(mu, sigma)                   |
//! | beta      | mean (logit link)        | `phi`    | Beta(mu·phi, (1-mu)·phi)               |
//! | frechet   | mean (log link)          | `nu`     | Fréchet(mu / Γ(1 - 1/nu), nu), nu > 1  |

use ifsbc_types::Family;
use rand::Rng;
use rand_distr::{Beta, Distribution, Gamma, LogNormal, Open01, Weibull};

use crate::stats::{ln_beta, ln_gamma};

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

/// Why a response could not be drawn for the given parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyDomainError(pub String);

/// Clamp a location into the family's open support so that downstream
/// parameter constructors never see a boundary value.
#[must_use]
pub fn clamp_location(family: Family, mu: f64) -> f64 {
    match family {
        Family::Lognormal => mu.clamp(-f64::MAX, f64::MAX),
        Family::Beta => mu.clamp(f64::EPSILON, 1.0 - f64::EPSILON),
        Family::Gamma | Family::Weibull | Family::Frechet => {
            mu.clamp(f64::MIN_POSITIVE, f64::MAX)
        }
    }
}

/// Clamp a response into the representable open support of the family.
#[must_use]
pub fn clamp_response(family: Family, y: f64) -> f64 {
    if family.is_unit_interval() {
        y.clamp(f64::EPSILON, 1.0 - f64::EPSILON)
    } else {
        y.clamp(f64::MIN_POSITIVE, f64::MAX)
    }
}

/// Check the auxiliary parameter against the family's domain.
pub fn check_aux(family: Family, aux: f64) -> Result<(), FamilyDomainError> {
    if !aux.is_finite() || aux <= 0.0 {
        return Err(FamilyDomainError(format!(
            "{} must be finite and positive, got {aux}",
            family.aux_name()
        )));
    }
    if family == Family::Frechet && aux <= 1.0 {
        return Err(FamilyDomainError(format!(
            "frechet nu must exceed 1 for a finite mean, got {aux}"
        )));
    }
    Ok(())
}

/// Draw one response. `mu` must already be clamped by [`clamp_location`].
pub fn sample_response<R: Rng + ?Sized>(
    family: Family,
    mu: f64,
    aux: f64,
    rng: &mut R,
) -> Result<f64, FamilyDomainError> {
    let domain = |err: &dyn std::fmt::Display| {
        FamilyDomainError(format!("{family} sampler rejected mu={mu} {}={aux}: {err}", family.aux_name()))
    };
    let y = match family {
        Family::Gamma => Gamma::new(aux, mu / aux)
            .map_err(|e| domain(&e))?
            .sample(rng),
        Family::Weibull => Weibull::new(weibull_scale(mu, aux), aux)
            .map_err(|e| domain(&e))?
            .sample(rng),
        Family::Lognormal => LogNormal::new(mu, aux)
            .map_err(|e| domain(&e))?
            .sample(rng),
        Family::Beta => Beta::new(mu * aux, (1.0 - mu) * aux)
            .map_err(|e| domain(&e))?
            .sample(rng),
        Family::Frechet => {
            let u: f64 = rng.sample(Open01);
            frechet_scale(mu, aux) * (-u.ln()).powf(-1.0 / aux)
        }
    };
    Ok(clamp_response(family, y))
}

/// Log density of `y` under the family at `(mu, aux)`.
#[must_use]
pub fn log_density(family: Family, y: f64, mu: f64, aux: f64) -> f64 {
    match family {
        Family::Gamma => {
            let scale = mu / aux;
            -ln_gamma(aux) - aux * scale.ln() + (aux - 1.0) * y.ln() - y / scale
        }
        Family::Weibull => {
            let scale = weibull_scale(mu, aux);
            let z = y / scale;
            aux.ln() - scale.ln() + (aux - 1.0) * z.ln() - z.powf(aux)
        }
        Family::Lognormal => {
            let z = (y.ln() - mu) / aux;
            -y.ln() - aux.ln() - LN_SQRT_2PI - 0.5 * z * z
        }
        Family::Beta => {
            let (a, b) = (mu * aux, (1.0 - mu) * aux);
            (a - 1.0) * y.ln() + (b - 1.0) * (-y).ln_1p() - ln_beta(a, b)
        }
        Family::Frechet => {
            let scale = frechet_scale(mu, aux);
            let z = y / scale;
            aux.ln() - scale.ln() - (1.0 + aux) * z.ln() - z.powf(-aux)
        }
    }
}

fn weibull_scale(mean: f64, shape: f64) -> f64 {
    mean / ln_gamma(1.0 + 1.0 / shape).exp()
}

fn frechet_scale(mean: f64, nu: f64) -> f64 {
    mean / ln_gamma(1.0 - 1.0 / nu).exp()
}
