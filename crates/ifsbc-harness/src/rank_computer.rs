//! Rank statistics of simulated truths among posterior draws.
//!
//! For a scalar variable with truth `t` and draws `d_1..d_S`:
//!
//! ```text
//! rank = #{d_i < t}                      (strict)
//! rank = #{d_i < t} + U{0..=#{d_i == t}} (randomized, default)
//! ```
//!
//! Numeric policy, applied to parameter variables only:
//! - **clipping**: `t` and every `d_i` are clamped to `[lb, ub]` first;
//! - **truncation**: if the clipped `t` or any clipped draw sits on a bound,
//!   the rank is NA instead of a saturated `0` or `S`.
//!
//! The `loglik` pseudo-variable compares the pseudo-data's log-likelihood
//! under the truth with its log-likelihood under each draw. Bounds do not
//! apply to it, so it is ranked even when every parameter rank is NA.
//! A NaN anywhere yields NA.

use ifsbc_error::{CalibrationError, Result};
use ifsbc_types::{LOGLIK_VARIABLE, RankRecord, Replication};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// How ties between the truth and draws are resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Uniform random position among the tied draws.
    #[default]
    Randomized,
    /// Ties count as "not below".
    Strict,
}

/// Clipping, truncation and tie-break settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankPolicy {
    lb: f64,
    ub: f64,
    truncate: bool,
    tie_break: TieBreak,
}

impl Default for RankPolicy {
    fn default() -> Self {
        Self {
            lb: f64::NEG_INFINITY,
            ub: f64::INFINITY,
            truncate: false,
            tie_break: TieBreak::Randomized,
        }
    }
}

impl RankPolicy {
    pub fn new(lb: f64, ub: f64, truncate: bool) -> Result<Self> {
        if lb.is_nan() || ub.is_nan() {
            return Err(CalibrationError::config("rank bounds must not be NaN"));
        }
        if lb > ub {
            return Err(CalibrationError::config(format!(
                "lower rank bound {lb} exceeds upper bound {ub}"
            )));
        }
        Ok(Self {
            lb,
            ub,
            truncate,
            tie_break: TieBreak::Randomized,
        })
    }

    #[must_use]
    pub const fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    #[must_use]
    pub const fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    /// Rank of `truth` among `draws`; `None` is NA.
    ///
    /// `bounded` selects whether clipping and truncation apply.
    pub fn rank<R: Rng + ?Sized>(
        &self,
        truth: f64,
        draws: &[f64],
        bounded: bool,
        rng: &mut R,
    ) -> Option<u32> {
        if truth.is_nan() || draws.iter().any(|d| d.is_nan()) {
            return None;
        }
        let clip = |v: f64| if bounded { v.clamp(self.lb, self.ub) } else { v };
        let on_bound = |v: f64| v <= self.lb || v >= self.ub;

        let t = clip(truth);
        if bounded && self.truncate && on_bound(t) {
            return None;
        }

        let mut below = 0_u32;
        let mut ties = 0_u32;
        for &raw in draws {
            let d = clip(raw);
            if bounded && self.truncate && on_bound(d) {
                return None;
            }
            if d < t {
                below += 1;
            } else if d == t {
                ties += 1;
            }
        }

        match self.tie_break {
            TieBreak::Randomized if ties > 0 => Some(below + rng.gen_range(0..=ties)),
            TieBreak::Randomized | TieBreak::Strict => Some(below),
        }
    }
}

/// Computes one [`RankRecord`] per tracked variable of a fitted replication.
#[derive(Debug, Clone)]
pub struct RankComputer {
    policy: RankPolicy,
    variables: Vec<String>,
}

impl RankComputer {
    #[must_use]
    pub const fn new(policy: RankPolicy, variables: Vec<String>) -> Self {
        Self { policy, variables }
    }

    #[must_use]
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    #[must_use]
    pub const fn policy(&self) -> &RankPolicy {
        &self.policy
    }

    /// Rank every tracked variable of `replication`.
    ///
    /// Expects a replication in state `fitted`. Variables are visited in the
    /// tracked order, so the tie-break stream is consumed deterministically.
    #[must_use]
    pub fn rank_replication(&self, replication: &Replication, tie_seed: u64) -> Vec<RankRecord> {
        let (Some(sim), Some(draws)) = (&replication.truth, &replication.posterior_draws) else {
            return self.na_records(replication.index);
        };
        let num_draws = u32::try_from(draws.n_draws()).unwrap_or(u32::MAX);
        let mut rng = StdRng::seed_from_u64(tie_seed);

        self.variables
            .iter()
            .map(|variable| {
                let is_loglik = variable == LOGLIK_VARIABLE;
                let truth = if is_loglik {
                    Some(sim.truth.loglik)
                } else {
                    sim.truth.value(variable)
                };
                let rank = match (truth, draws.column(variable)) {
                    (Some(t), Some(column)) => self.policy.rank(t, &column, !is_loglik, &mut rng),
                    _ => None,
                };
                RankRecord {
                    replication_index: replication.index,
                    variable: variable.clone(),
                    rank,
                    num_draws,
                }
            })
            .collect()
    }

    /// NA rows (with `num_draws = 0`) for a replication that produced no
    /// posterior.
    #[must_use]
    pub fn na_records(&self, replication_index: u32) -> Vec<RankRecord> {
        self.variables
            .iter()
            .map(|variable| RankRecord::na(replication_index, variable, 0))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ifsbc_types::{Dataset, DrawMatrix, SimulatedTruth, Truth};
    use proptest::prelude::*;

    use super::*;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0)
    }

    #[test]
    fn rank_counts_draws_below_truth() {
        let policy = RankPolicy::default();
        assert_eq!(policy.rank(0.25, &[0.1, 0.2, 0.3], true, &mut rng()), Some(2));
    }

    #[test]
    fn truncated_truth_below_lower_bound_is_na() {
        let policy = RankPolicy::new(0.5, f64::INFINITY, true).expect("valid bounds");
        assert_eq!(policy.rank(0.25, &[0.1, 0.2, 0.3], true, &mut rng()), None);
    }

    #[test]
    fn clipping_without_truncation_saturates() {
        let policy = RankPolicy::new(0.5, f64::INFINITY, false)
            .expect("valid bounds")
            .with_tie_break(TieBreak::Strict);
        // Everything clips to 0.5 and ties; strict counting puts the truth at 0.
        assert_eq!(policy.rank(0.25, &[0.1, 0.2, 0.3], true, &mut rng()), Some(0));
    }

    #[test]
    fn draw_on_upper_bound_is_na_under_truncation() {
        let policy = RankPolicy::new(0.0, 1.0, true).expect("valid bounds");
        assert_eq!(policy.rank(0.5, &[0.2, 7.0], true, &mut rng()), None);
        assert_eq!(policy.rank(0.5, &[0.2, 0.7], true, &mut rng()), Some(1));
    }

    #[test]
    fn unbounded_variables_ignore_bounds() {
        let policy = RankPolicy::new(0.5, 0.6, true).expect("valid bounds");
        assert_eq!(policy.rank(-100.0, &[-200.0, 1e6], false, &mut rng()), Some(1));
    }

    #[test]
    fn nan_yields_na() {
        let policy = RankPolicy::default();
        assert_eq!(policy.rank(f64::NAN, &[1.0], false, &mut rng()), None);
        assert_eq!(policy.rank(1.0, &[f64::NAN], false, &mut rng()), None);
    }

    #[test]
    fn inverted_bounds_rejected() {
        let err = RankPolicy::new(2.0, 1.0, false).expect_err("lb > ub");
        assert!(err.is_fatal_configuration());
        assert!(RankPolicy::new(f64::NAN, 1.0, false).is_err());
    }

    #[test]
    fn randomized_ties_spread_over_tied_positions() {
        let policy = RankPolicy::default();
        let mut rng = rng();
        let mut seen = [false; 4];
        for _ in 0..400 {
            let r = policy
                .rank(1.0, &[1.0, 1.0, 1.0], false, &mut rng)
                .expect("finite");
            seen[r as usize] = true;
        }
        assert!(seen.iter().all(|&s| s), "case=tie_spread seen={seen:?}");
    }

    fn fitted_replication(truth_value: f64, loglik_truth: f64) -> Replication {
        let mut rep = Replication::pending(3, 11);
        rep.mark_simulated(SimulatedTruth {
            truth: Truth {
                parameters: BTreeMap::from([("shape".to_owned(), truth_value)]),
                group_effects: Vec::new(),
                loglik: loglik_truth,
            },
            data: Dataset::new(vec![1.0], Vec::new(), 0),
        });
        rep.mark_fitted(
            DrawMatrix::from_columns(vec![
                ("shape".to_owned(), vec![0.1, 0.2, 0.3]),
                (LOGLIK_VARIABLE.to_owned(), vec![-5.0, -3.0, -1.0]),
            ])
            .expect("equal columns"),
        );
        rep
    }

    #[test]
    fn loglik_ranked_even_when_parameter_is_na() {
        let policy = RankPolicy::new(0.5, f64::INFINITY, true).expect("valid bounds");
        let computer = RankComputer::new(
            policy,
            vec!["shape".to_owned(), LOGLIK_VARIABLE.to_owned()],
        );
        let records = computer.rank_replication(&fitted_replication(0.25, -2.0), 1);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].rank, None);
        assert_eq!(records[1].rank, Some(2));
        assert!(records.iter().all(|r| r.num_draws == 3 && r.replication_index == 3));
    }

    #[test]
    fn unfitted_replication_yields_na_rows() {
        let computer = RankComputer::new(RankPolicy::default(), vec!["shape".to_owned()]);
        let records = computer.rank_replication(&Replication::pending(9, 1), 1);
        assert_eq!(records, vec![RankRecord::na(9, "shape", 0)]);
    }

    proptest! {
        #[test]
        fn rank_stays_within_zero_to_s(
            truth in -10.0f64..10.0,
            draws in proptest::collection::vec(-10.0f64..10.0, 1..50),
            seed in any::<u64>(),
        ) {
            let mut rng = StdRng::seed_from_u64(seed);
            let r = RankPolicy::default().rank(truth, &draws, true, &mut rng);
            prop_assert!(r.is_some_and(|r| r as usize <= draws.len()));
        }
    }
}
