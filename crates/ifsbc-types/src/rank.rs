//! Rank records, the ranks table, and per-variable discrepancy results.

use std::collections::BTreeSet;

use ifsbc_error::{CalibrationError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Rank of one variable's truth among one replication's posterior draws.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankRecord {
    pub replication_index: u32,
    pub variable: String,
    /// `None` is NA: failed replication or indeterminate rank.
    pub rank: Option<u32>,
    /// Number of posterior draws behind this rank (0 for failed replications).
    pub num_draws: u32,
}

impl RankRecord {
    #[must_use]
    pub fn ranked(replication_index: u32, variable: &str, rank: u32, num_draws: u32) -> Self {
        debug_assert!(rank <= num_draws, "rank {rank} exceeds draw count {num_draws}");
        Self {
            replication_index,
            variable: variable.to_owned(),
            rank: Some(rank),
            num_draws,
        }
    }

    #[must_use]
    pub fn na(replication_index: u32, variable: &str, num_draws: u32) -> Self {
        Self {
            replication_index,
            variable: variable.to_owned(),
            rank: None,
            num_draws,
        }
    }

    #[must_use]
    pub const fn is_na(&self) -> bool {
        self.rank.is_none()
    }
}

/// Row-oriented table of rank records in canonical
/// `(replication_index, variable)` order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RanksTable {
    rows: Vec<RankRecord>,
}

impl RanksTable {
    /// Canonicalize an arbitrary collection of records.
    #[must_use]
    pub fn from_records(mut rows: Vec<RankRecord>) -> Self {
        rows.sort_by(|a, b| {
            a.replication_index
                .cmp(&b.replication_index)
                .then_with(|| a.variable.cmp(&b.variable))
        });
        Self { rows }
    }

    #[must_use]
    pub fn rows(&self) -> &[RankRecord] {
        &self.rows
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Distinct variable names, sorted.
    #[must_use]
    pub fn variables(&self) -> Vec<String> {
        self.rows
            .iter()
            .map(|r| r.variable.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    pub fn for_variable<'a>(&'a self, variable: &'a str) -> impl Iterator<Item = &'a RankRecord> {
        self.rows.iter().filter(move |r| r.variable == variable)
    }

    /// Non-NA row count.
    #[must_use]
    pub fn ranked_count(&self) -> usize {
        self.rows.iter().filter(|r| !r.is_na()).count()
    }

    #[must_use]
    pub fn na_count(&self) -> usize {
        self.rows.len() - self.ranked_count()
    }

    /// One JSON object per line, canonical order.
    pub fn to_jsonl(&self) -> Result<String> {
        let mut out = String::new();
        for row in &self.rows {
            let line = serde_json::to_string(row).map_err(|err| {
                CalibrationError::Serialization(format!("rank record encode failed: {err}"))
            })?;
            out.push_str(&line);
            out.push('\n');
        }
        Ok(out)
    }

    /// Parse the [`RanksTable::to_jsonl`] rendering.
    pub fn from_jsonl(text: &str) -> Result<Self> {
        let mut rows = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let row: RankRecord = serde_json::from_str(line).map_err(|err| {
                CalibrationError::Serialization(format!(
                    "ranks.jsonl parse failure at line {}: {err}",
                    line_no + 1
                ))
            })?;
            if let Some(rank) = row.rank.filter(|&rank| rank > row.num_draws) {
                return Err(CalibrationError::Serialization(format!(
                    "ranks.jsonl line {}: rank {rank} exceeds num_draws {}",
                    line_no + 1,
                    row.num_draws
                )));
            }
            rows.push(row);
        }
        Ok(Self::from_records(rows))
    }

    /// SHA-256 over the canonical JSONL rendering, lowercase hex.
    pub fn digest(&self) -> Result<String> {
        Ok(sha256_hex(self.to_jsonl()?.as_bytes()))
    }
}

/// Log-scale calibration-failure statistic for one variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscrepancyResult {
    pub variable: String,
    /// `log(gamma)`, at most 0; more negative is worse calibration.
    pub log_score: f64,
    pub num_valid_ranks: usize,
    /// NA rows dropped before scoring.
    pub num_excluded: usize,
    /// Number of rank bins the ECDF was evaluated on.
    pub grid_levels: u32,
    /// `log(adjust_gamma(N, L))` for the same N and grid.
    pub reference_log_gamma: Option<f64>,
    /// `log_score >= reference_log_gamma`, when a reference was computed.
    pub calibrated: Option<bool>,
}

fn sha256_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";

    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0F)]));
    }
    out
}
