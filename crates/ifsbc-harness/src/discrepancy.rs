//! Simultaneous-band discrepancy score of rank uniformity.
//!
//! The ranks of one variable are mapped onto a grid of `g` equiprobable bins
//! and summarised by their empirical CDF at the interior grid points
//! `z_i = i/g`, `i = 1..g-1`. Under calibration the cumulative count
//! `n_i` is `Binomial(N, z_i)`. The score is
//!
//! ```text
//! log γ = min(0, ln 2 + min_i min(ln P[X_i ≤ n_i], ln P[X_i ≥ n_i]))
//! ```
//!
//! i.e. the log of the smallest two-sided pointwise level at which the ECDF
//! leaves its band somewhere. Comparing it against `adjust_gamma(N, g, L)`,
//! the L-quantile of the same statistic under exact uniformity, turns the
//! pointwise level into a simultaneous test. Everything stays on the log
//! scale: for badly miscalibrated variables γ underflows `f64`.
//!
//! Mixed draw counts `S_j` are supported by binning onto the coarsest grid
//! every `S_j + 1` divides exactly: `g = gcd(S_j + 1)`.

use std::collections::{BTreeSet, HashMap};

use ifsbc_error::{CalibrationError, Result};
use ifsbc_types::{DiscrepancyResult, RankRecord, RanksTable};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::CalibrationConfig;
use crate::seed_taxonomy::reference_seed;
use crate::stats::{binomial_log_cdf, binomial_log_sf, binomial_quantile};

/// Valid ranks of one variable mapped onto a common grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankGrid {
    /// Number of bins `g`.
    pub levels: u32,
    /// Bin of each valid rank, in `0..levels`.
    pub bins: Vec<u32>,
    /// NA rows excluded from the grid.
    pub excluded: usize,
}

impl RankGrid {
    /// Collect the valid ranks of `variable` from `table`.
    pub fn from_table(table: &RanksTable, variable: &str) -> Result<Self> {
        let records: Vec<&RankRecord> = table.for_variable(variable).collect();
        let excluded = records.iter().filter(|r| r.is_na()).count();
        let valid: Vec<(u32, u32)> = records
            .iter()
            .filter_map(|r| r.rank.map(|rank| (rank, r.num_draws)))
            .collect();
        if let Some(&(rank, s)) = valid.iter().find(|&&(rank, s)| rank > s) {
            return Err(CalibrationError::Internal(format!(
                "variable `{variable}` has rank {rank} above its draw count {s}"
            )));
        }
        if valid.is_empty() {
            return Err(CalibrationError::InsufficientData {
                variable: variable.to_owned(),
                excluded,
            });
        }

        let draw_counts: BTreeSet<u32> = valid.iter().map(|&(_, s)| s).collect();
        let levels = draw_counts
            .iter()
            .map(|&s| u64::from(s) + 1)
            .fold(0, gcd);
        if levels < 2 {
            return Err(CalibrationError::IncompatibleDrawCounts {
                variable: variable.to_owned(),
                draw_counts: draw_counts.into_iter().collect(),
            });
        }
        let levels = u32::try_from(levels).map_err(|_| {
            CalibrationError::Internal(format!("grid of {levels} levels exceeds u32"))
        })?;

        let bins = valid
            .iter()
            .map(|&(rank, s)| {
                let bin = u64::from(rank) * u64::from(levels) / (u64::from(s) + 1);
                u32::try_from(bin).map_or(levels - 1, |b| b.min(levels - 1))
            })
            .collect();
        Ok(Self {
            levels,
            bins,
            excluded,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// `n_i = #{bin < i}` for `i = 0..=levels`.
    #[must_use]
    pub fn cumulative_counts(&self) -> Vec<u64> {
        cumulative(&self.bins, self.levels)
    }
}

/// Log of the simultaneous-band gamma statistic of binned ranks.
#[must_use]
pub fn log_gamma(bins: &[u32], levels: u32) -> f64 {
    let n = bins.len() as u64;
    let cumulative = cumulative(bins, levels);
    let mut worst = 0.0_f64;
    for i in 1..levels {
        let z = f64::from(i) / f64::from(levels);
        let k = cumulative[i as usize];
        let lower = binomial_log_cdf(k, n, z);
        let upper = binomial_log_sf(k, n, z);
        worst = worst.min(lower.min(upper));
    }
    (std::f64::consts::LN_2 + worst).min(0.0)
}

/// Monte-Carlo reference: the L-quantile of `log γ` over `simulations`
/// uniform rank sets of size `n` on `levels` bins.
#[must_use]
pub fn adjust_gamma(n: usize, levels: u32, miscoverage: f64, simulations: usize, seed: u64) -> f64 {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut scores: Vec<f64> = (0..simulations)
        .map(|_| {
            let bins: Vec<u32> = (0..n).map(|_| rng.gen_range(0..levels)).collect();
            log_gamma(&bins, levels)
        })
        .collect();
    scores.sort_by(f64::total_cmp);
    let rank = (miscoverage * scores.len() as f64).ceil() as usize;
    scores[rank.clamp(1, scores.len()) - 1]
}

/// One grid point of the ECDF-difference plot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcdfPoint {
    pub z: f64,
    /// `ECDF(z) - z`.
    pub ecdf_diff: f64,
    pub lower: f64,
    pub upper: f64,
}

/// ECDF difference with its simultaneous band, for external plotting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcdfBand {
    pub variable: String,
    pub num_valid_ranks: usize,
    pub grid_levels: u32,
    pub log_gamma_adjusted: f64,
    pub points: Vec<EcdfPoint>,
}

/// Scores ranks tables against discrete uniformity.
#[derive(Debug)]
pub struct DiscrepancyScorer {
    miscoverage: f64,
    reference_simulations: usize,
    root_seed: u64,
    references: Mutex<HashMap<(usize, u32), f64>>,
}

impl DiscrepancyScorer {
    pub fn new(miscoverage: f64, reference_simulations: usize, root_seed: u64) -> Result<Self> {
        if !(miscoverage > 0.0 && miscoverage < 1.0) {
            return Err(CalibrationError::config(format!(
                "miscoverage ({miscoverage}) must lie in (0, 1)"
            )));
        }
        if reference_simulations == 0 {
            return Err(CalibrationError::config(
                "reference_simulations must be >= 1",
            ));
        }
        Ok(Self {
            miscoverage,
            reference_simulations,
            root_seed,
            references: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(config: &CalibrationConfig) -> Result<Self> {
        Self::new(
            config.miscoverage,
            config.reference_simulations,
            config.root_seed,
        )
    }

    /// Score without the reference threshold (no simulation cost).
    pub fn log_score(&self, table: &RanksTable, variable: &str) -> Result<DiscrepancyResult> {
        let grid = RankGrid::from_table(table, variable)?;
        Ok(DiscrepancyResult {
            variable: variable.to_owned(),
            log_score: log_gamma(&grid.bins, grid.levels),
            num_valid_ranks: grid.len(),
            num_excluded: grid.excluded,
            grid_levels: grid.levels,
            reference_log_gamma: None,
            calibrated: None,
        })
    }

    /// Score `variable` and compare it with the adjusted reference.
    pub fn score(&self, table: &RanksTable, variable: &str) -> Result<DiscrepancyResult> {
        let mut result = self.log_score(table, variable)?;
        let reference = self.reference(result.num_valid_ranks, result.grid_levels);
        result.reference_log_gamma = Some(reference);
        result.calibrated = Some(result.log_score >= reference);
        debug!(
            variable,
            log_score = result.log_score,
            reference,
            valid = result.num_valid_ranks,
            excluded = result.num_excluded,
            "variable scored"
        );
        Ok(result)
    }

    /// Score every variable present in `table`, in name order.
    #[must_use]
    pub fn score_all(&self, table: &RanksTable) -> Vec<Result<DiscrepancyResult>> {
        let results: Vec<Result<DiscrepancyResult>> = table
            .variables()
            .iter()
            .map(|variable| self.score(table, variable))
            .collect();
        info!(
            variables = results.len(),
            flagged = results
                .iter()
                .filter(|r| matches!(r, Ok(d) if d.calibrated == Some(false)))
                .count(),
            "ranks table scored"
        );
        results
    }

    /// ECDF difference and simultaneous band of `variable`.
    pub fn ecdf_band(&self, table: &RanksTable, variable: &str) -> Result<EcdfBand> {
        let grid = RankGrid::from_table(table, variable)?;
        let n = grid.len() as u64;
        let log_gamma_adjusted = self.reference(grid.len(), grid.levels);
        let gamma = log_gamma_adjusted.exp();
        let cumulative = grid.cumulative_counts();

        let points = (0..=grid.levels)
            .map(|i| {
                let z = f64::from(i) / f64::from(grid.levels);
                let ecdf = cumulative[i as usize] as f64 / n as f64;
                let (lower, upper) = if i == 0 || i == grid.levels {
                    (0.0, 0.0)
                } else {
                    (
                        binomial_quantile(gamma / 2.0, n, z) as f64 / n as f64 - z,
                        binomial_quantile(1.0 - gamma / 2.0, n, z) as f64 / n as f64 - z,
                    )
                };
                EcdfPoint {
                    z,
                    ecdf_diff: ecdf - z,
                    lower,
                    upper,
                }
            })
            .collect();
        Ok(EcdfBand {
            variable: variable.to_owned(),
            num_valid_ranks: grid.len(),
            grid_levels: grid.levels,
            log_gamma_adjusted,
            points,
        })
    }

    /// Memoised `adjust_gamma` for `(n, levels)`.
    fn reference(&self, n: usize, levels: u32) -> f64 {
        if let Some(&cached) = self.references.lock().get(&(n, levels)) {
            return cached;
        }
        let value = adjust_gamma(
            n,
            levels,
            self.miscoverage,
            self.reference_simulations,
            reference_seed(self.root_seed, n, levels),
        );
        self.references.lock().insert((n, levels), value);
        value
    }
}

fn cumulative(bins: &[u32], levels: u32) -> Vec<u64> {
    let mut counts = vec![0_u64; levels as usize + 1];
    for &b in bins {
        counts[b as usize + 1] += 1;
    }
    for i in 1..counts.len() {
        counts[i] += counts[i - 1];
    }
    counts
}

const fn gcd(a: u64, b: u64) -> u64 {
    let (mut a, mut b) = (a, b);
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(variable: &str, ranks: &[Option<u32>], s: u32) -> RanksTable {
        RanksTable::from_records(
            ranks
                .iter()
                .enumerate()
                .map(|(i, &rank)| RankRecord {
                    replication_index: i as u32,
                    variable: variable.to_owned(),
                    rank,
                    num_draws: s,
                })
                .collect(),
        )
    }

    fn scorer() -> DiscrepancyScorer {
        DiscrepancyScorer::new(0.05, 200, 7).expect("valid scorer")
    }

    #[test]
    fn perfectly_even_ranks_score_near_zero() {
        // 10 copies of each rank 0..=9 (S = 9).
        let ranks: Vec<Option<u32>> = (0..100).map(|i| Some(i % 10)).collect();
        let result = scorer()
            .log_score(&table("b_x1", &ranks, 9), "b_x1")
            .expect("scored");
        assert_eq!(result.grid_levels, 10);
        assert!(result.log_score > -0.5, "case=even log_score={}", result.log_score);
        assert!(result.log_score <= 0.0);
    }

    #[test]
    fn skewed_ranks_score_more_negative_than_uniform() {
        let mut rng = StdRng::seed_from_u64(3);
        let uniform: Vec<Option<u32>> = (0..500).map(|_| Some(rng.gen_range(0..=99))).collect();
        let skewed: Vec<Option<u32>> = (0..500)
            .map(|i| {
                if i % 10 == 0 {
                    Some(rng.gen_range(0..=99))
                } else {
                    Some(rng.gen_range(0..=9))
                }
            })
            .collect();
        let s = scorer();
        let u = s.log_score(&table("x", &uniform, 99), "x").expect("uniform");
        let k = s.log_score(&table("x", &skewed, 99), "x").expect("skewed");
        assert!(k.log_score < u.log_score, "case=monotone u={} k={}", u.log_score, k.log_score);
        assert!(k.log_score.is_finite(), "case=log_scale k={}", k.log_score);
    }

    #[test]
    fn na_ranks_are_excluded_and_counted() {
        let ranks = [Some(0), None, Some(3), None, Some(1)];
        let result = scorer().log_score(&table("v", &ranks, 3), "v").expect("scored");
        assert_eq!(result.num_valid_ranks, 3);
        assert_eq!(result.num_excluded, 2);
    }

    #[test]
    fn all_na_is_insufficient_data() {
        let err = scorer()
            .score(&table("v", &[None, None], 3), "v")
            .expect_err("no valid ranks");
        assert!(matches!(
            err,
            CalibrationError::InsufficientData { excluded: 2, .. }
        ));
    }

    #[test]
    fn mixed_draw_counts_use_common_grid() {
        let rows = vec![
            RankRecord::ranked(0, "v", 3, 3),
            RankRecord::ranked(1, "v", 7, 7),
            RankRecord::ranked(2, "v", 0, 11),
        ];
        let grid = RankGrid::from_table(&RanksTable::from_records(rows), "v").expect("grid");
        assert_eq!(grid.levels, 4);
        assert_eq!(grid.bins, vec![3, 3, 0]);
    }

    #[test]
    fn rank_above_draw_count_is_rejected() {
        let rows = vec![
            RankRecord::ranked(0, "v", 1, 3),
            RankRecord {
                replication_index: 1,
                variable: "v".to_owned(),
                rank: Some(5),
                num_draws: 3,
            },
        ];
        let table = RanksTable::from_records(rows);
        let err = scorer().log_score(&table, "v").expect_err("rank out of range");
        assert!(err.to_string().contains("rank 5"), "case=out_of_range err={err}");
        assert!(scorer().ecdf_band(&table, "v").is_err());
    }

    #[test]
    fn coprime_draw_counts_are_incompatible() {
        let rows = vec![
            RankRecord::ranked(0, "v", 1, 2),
            RankRecord::ranked(1, "v", 1, 3),
        ];
        let err = RankGrid::from_table(&RanksTable::from_records(rows), "v")
            .expect_err("gcd(3, 4) = 1");
        assert!(matches!(err, CalibrationError::IncompatibleDrawCounts { .. }));
    }

    #[test]
    fn reference_is_deterministic_and_calibrates_uniform_ranks() {
        let mut rng = StdRng::seed_from_u64(21);
        let ranks: Vec<Option<u32>> = (0..300).map(|_| Some(rng.gen_range(0..=19))).collect();
        let t = table("b", &ranks, 19);
        let a = scorer().score(&t, "b").expect("scored");
        let b = scorer().score(&t, "b").expect("scored");
        assert_eq!(a, b);
        let reference = a.reference_log_gamma.expect("reference computed");
        assert!(reference < 0.0 && reference > -10.0, "case=reference ref={reference}");
    }

    #[test]
    fn ecdf_band_brackets_the_null() {
        let ranks: Vec<Option<u32>> = (0..200).map(|i| Some(i % 20)).collect();
        let band = scorer()
            .ecdf_band(&table("v", &ranks, 19), "v")
            .expect("band");
        assert_eq!(band.points.len(), 21);
        for p in &band.points {
            assert!(p.lower <= 0.0 + 1e-12 && p.upper >= -1e-12, "case=band z={}", p.z);
            assert!(p.ecdf_diff >= p.lower && p.ecdf_diff <= p.upper, "case=inside z={}", p.z);
        }
    }

    #[test]
    fn gcd_basics() {
        assert_eq!(gcd(0, 12), 12);
        assert_eq!(gcd(12, 18), 6);
        assert_eq!(gcd(7, 4), 1);
    }
}
