//! Numerical routines shared by the family densities and the discrepancy
//! scorer: log-gamma, the regularized incomplete beta function, and binomial
//! tail probabilities evaluated on the log scale.

use std::f64::consts::PI;

/// Below this linear-scale tail value the incomplete-beta path loses relative
/// accuracy; the exact log-space sum takes over.
const LINEAR_TAIL_FLOOR: f64 = 1e-8;

/// Log-gamma via Lanczos approximation (g=7, n=9 coefficients).
#[allow(clippy::excessive_precision)]
#[must_use]
pub fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 9] = [
        0.999_999_999_999_809_93,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_13,
        -176.615_029_162_140_59,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_571_6e-6,
        1.505_632_735_149_311_6e-7,
    ];

    if x < 0.5 {
        // Reflection formula
        let lnpi_sin = (PI * x).sin().abs().ln();
        PI.ln() - lnpi_sin - ln_gamma(1.0 - x)
    } else {
        let x = x - 1.0;
        let mut ag = COEFFS[0];
        for (i, &c) in COEFFS[1..].iter().enumerate() {
            let denom = x + (i as f64) + 1.0;
            ag += c / denom;
        }
        let t = x + 7.5;
        0.5f64.mul_add((2.0 * PI).ln(), (x + 0.5) * t.ln()) - t + ag.ln()
    }
}

/// ln B(a, b) = ln Gamma(a) + ln Gamma(b) - ln Gamma(a+b).
#[must_use]
pub fn ln_beta(a: f64, b: f64) -> f64 {
    ln_gamma(a) + ln_gamma(b) - ln_gamma(a + b)
}

/// Regularized incomplete beta function I_x(a, b) via continued fraction
/// (Lentz's modified method).
///
/// Reference: Numerical Recipes in C, 2nd ed., section 6.4.
#[must_use]
pub fn regularized_ibeta(x: f64, a: f64, b: f64) -> f64 {
    const EPS: f64 = 1e-15;
    const TINY: f64 = 1e-300;
    const MAX_ITER: usize = 300;

    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }

    // Symmetry relation converges faster past the mean.
    if x > (a + 1.0) / (a + b + 2.0) {
        return 1.0 - regularized_ibeta(1.0 - x, b, a);
    }

    let ln_prefactor = a.mul_add(x.ln(), b * (1.0 - x).ln()) - ln_beta(a, b) - a.ln();
    let prefactor = ln_prefactor.exp();

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;

    let mut c = 1.0_f64;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < TINY {
        d = TINY;
    }
    d = 1.0 / d;
    let mut h = d;

    for m in 1..=MAX_ITER {
        let m_f64 = m as f64;
        let m2 = 2.0 * m_f64;

        // Even step: a_{2m}
        let aa = m_f64 * (b - m_f64) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + aa / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        h *= d * c;

        // Odd step: a_{2m+1}
        let aa = -((a + m_f64) * (qab + m_f64) * x) / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + aa / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;

        if (delta - 1.0).abs() < EPS {
            break;
        }
    }

    (prefactor * h).clamp(0.0, 1.0)
}

/// `ln(exp(a) + exp(b))` without overflow.
#[must_use]
pub fn log_add_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}

/// ln P[X = k] for X ~ Binomial(n, p), 0 < p < 1.
#[must_use]
pub fn binomial_log_pmf(k: u64, n: u64, p: f64) -> f64 {
    if k > n {
        return f64::NEG_INFINITY;
    }
    let (kf, nf) = (k as f64, n as f64);
    let ln_choose = ln_gamma(nf + 1.0) - ln_gamma(kf + 1.0) - ln_gamma(nf - kf + 1.0);
    ln_choose + kf * p.ln() + (nf - kf) * (-p).ln_1p()
}

/// ln P[X ≤ k] for X ~ Binomial(n, p).
#[must_use]
pub fn binomial_log_cdf(k: u64, n: u64, p: f64) -> f64 {
    if k >= n || p <= 0.0 {
        return 0.0;
    }
    if p >= 1.0 {
        return f64::NEG_INFINITY;
    }
    // P[X ≤ k] = I_{1-p}(n-k, k+1)
    let linear = regularized_ibeta(1.0 - p, (n - k) as f64, k as f64 + 1.0);
    if linear > LINEAR_TAIL_FLOOR {
        return linear.ln();
    }
    (0..=k).fold(f64::NEG_INFINITY, |acc, j| {
        log_add_exp(acc, binomial_log_pmf(j, n, p))
    })
}

/// ln P[X ≥ k] for X ~ Binomial(n, p).
#[must_use]
pub fn binomial_log_sf(k: u64, n: u64, p: f64) -> f64 {
    if k == 0 || p >= 1.0 {
        return 0.0;
    }
    if k > n || p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    // P[X ≥ k] = I_p(k, n-k+1)
    let linear = regularized_ibeta(p, k as f64, (n - k) as f64 + 1.0);
    if linear > LINEAR_TAIL_FLOOR {
        return linear.ln();
    }
    (k..=n).fold(f64::NEG_INFINITY, |acc, j| {
        log_add_exp(acc, binomial_log_pmf(j, n, p))
    })
}

/// Smallest k with P[X ≤ k] ≥ q for X ~ Binomial(n, p).
#[must_use]
pub fn binomial_quantile(q: f64, n: u64, p: f64) -> u64 {
    if q <= 0.0 {
        return 0;
    }
    if p <= 0.0 {
        return 0;
    }
    if p >= 1.0 {
        return n;
    }
    let log_q = q.min(1.0).ln();
    let mut log_cum = f64::NEG_INFINITY;
    for k in 0..=n {
        log_cum = log_add_exp(log_cum, binomial_log_pmf(k, n, p));
        if log_cum >= log_q - 1e-12 {
            return k;
        }
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn ln_gamma_matches_factorials() {
        // Gamma(n+1) = n!
        assert!(close(ln_gamma(1.0), 0.0, 1e-12));
        assert!(close(ln_gamma(5.0), 24.0_f64.ln(), 1e-10));
        assert!(close(ln_gamma(11.0), 3_628_800.0_f64.ln(), 1e-9));
        assert!(close(ln_gamma(0.5), PI.sqrt().ln(), 1e-10));
    }

    #[test]
    fn ibeta_uniform_case_is_identity() {
        for x in [0.1, 0.25, 0.5, 0.9] {
            assert!(close(regularized_ibeta(x, 1.0, 1.0), x, 1e-12), "case=ibeta_uniform x={x}");
        }
    }

    #[test]
    fn binomial_cdf_matches_direct_sum() {
        let (n, p) = (20_u64, 0.3);
        for k in 0..n {
            let direct: f64 = (0..=k).map(|j| binomial_log_pmf(j, n, p).exp()).sum();
            let via_beta = binomial_log_cdf(k, n, p).exp();
            assert!(close(direct, via_beta, 1e-10), "case=cdf k={k} direct={direct} beta={via_beta}");
        }
    }

    #[test]
    fn binomial_tails_complement() {
        let (n, p) = (50_u64, 0.42);
        for k in 1..n {
            let lower = binomial_log_cdf(k - 1, n, p).exp();
            let upper = binomial_log_sf(k, n, p).exp();
            assert!(close(lower + upper, 1.0, 1e-10), "case=complement k={k}");
        }
    }

    #[test]
    fn extreme_tail_stays_finite_in_log_space() {
        // P[X ≤ 0] for Binomial(2000, 0.5) is 2^-2000, far below f64 range.
        let log_p = binomial_log_cdf(0, 2000, 0.5);
        assert!(log_p.is_finite());
        assert!(close(log_p, -2000.0 * 2.0_f64.ln(), 1e-6), "case=extreme log_p={log_p}");
    }

    #[test]
    fn quantile_inverts_cdf() {
        let (n, p) = (100_u64, 0.25);
        let median = binomial_quantile(0.5, n, p);
        assert_eq!(median, 25);
        assert!(binomial_quantile(0.999, n, p) > median);
        assert_eq!(binomial_quantile(0.0, n, p), 0);
    }

    #[test]
    fn log_add_exp_handles_negative_infinity() {
        assert_eq!(log_add_exp(f64::NEG_INFINITY, -3.0), -3.0);
        assert!(close(log_add_exp(0.0, 0.0), 2.0_f64.ln(), 1e-15));
    }
}
