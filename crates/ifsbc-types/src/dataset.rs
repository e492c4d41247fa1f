//! Datasets, simulated truths, and posterior draw matrices.

use std::collections::BTreeMap;

use ifsbc_error::{CalibrationError, Result};
use serde::{Deserialize, Serialize};

/// Response vector plus a row-major covariate design and optional grouping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub y: Vec<f64>,
    /// Row-major `len() × n_covariates`.
    pub covariates: Vec<f64>,
    pub n_covariates: usize,
    #[serde(default)]
    pub groups: Option<Vec<u32>>,
    #[serde(default)]
    pub group_count: Option<u32>,
}

impl Dataset {
    /// Ungrouped dataset. Shape is checked by [`Dataset::validate`].
    #[must_use]
    pub const fn new(y: Vec<f64>, covariates: Vec<f64>, n_covariates: usize) -> Self {
        Self {
            y,
            covariates,
            n_covariates,
            groups: None,
            group_count: None,
        }
    }

    #[must_use]
    pub fn with_groups(mut self, groups: Vec<u32>, group_count: u32) -> Self {
        self.groups = Some(groups);
        self.group_count = Some(group_count);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.y.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    /// Covariate row `i`.
    #[must_use]
    pub fn row(&self, i: usize) -> &[f64] {
        let start = i * self.n_covariates;
        &self.covariates[start..start + self.n_covariates]
    }

    /// Group level of observation `i`, if grouped.
    #[must_use]
    pub fn group_of(&self, i: usize) -> Option<u32> {
        self.groups.as_ref().map(|g| g[i])
    }

    /// Structural consistency: covariate length, group vector, finite values.
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(CalibrationError::config("dataset has no observations"));
        }
        if self.covariates.len() != self.len() * self.n_covariates {
            return Err(CalibrationError::config(format!(
                "covariate buffer has {} values, expected {} rows x {} columns",
                self.covariates.len(),
                self.len(),
                self.n_covariates
            )));
        }
        if self.y.iter().chain(&self.covariates).any(|v| !v.is_finite()) {
            return Err(CalibrationError::config("dataset contains non-finite values"));
        }
        match (&self.groups, self.group_count) {
            (None, None) => {}
            (Some(groups), Some(count)) => {
                if groups.len() != self.len() {
                    return Err(CalibrationError::config(format!(
                        "group vector has {} entries for {} observations",
                        groups.len(),
                        self.len()
                    )));
                }
                if let Some(bad) = groups.iter().find(|&&g| g >= count) {
                    return Err(CalibrationError::config(format!(
                        "group level {bad} out of range for {count} groups"
                    )));
                }
            }
            _ => {
                return Err(CalibrationError::config(
                    "groups and group_count must be set together",
                ));
            }
        }
        Ok(())
    }

    /// First `rows` observations restricted to the first `cols` covariates.
    pub fn subset(&self, rows: usize, cols: usize) -> Result<Self> {
        if rows > self.len() {
            return Err(CalibrationError::config(format!(
                "requested {rows} rows but dataset has {}",
                self.len()
            )));
        }
        if cols > self.n_covariates {
            return Err(CalibrationError::config(format!(
                "requested covariate count {cols} exceeds available covariates {}",
                self.n_covariates
            )));
        }
        let mut covariates = Vec::with_capacity(rows * cols);
        for i in 0..rows {
            covariates.extend_from_slice(&self.row(i)[..cols]);
        }
        Ok(Self {
            y: self.y[..rows].to_vec(),
            covariates,
            n_covariates: cols,
            groups: self.groups.as_ref().map(|g| g[..rows].to_vec()),
            group_count: self.group_count,
        })
    }
}

/// Latent truth of one replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Truth {
    /// Parameter values keyed by layout name.
    pub parameters: BTreeMap<String, f64>,
    /// Per-group intercept offsets (empty when ungrouped).
    #[serde(default)]
    pub group_effects: Vec<f64>,
    /// Log-likelihood of the pseudo-data under these parameters.
    pub loglik: f64,
}

impl Truth {
    #[must_use]
    pub fn value(&self, name: &str) -> Option<f64> {
        self.parameters.get(name).copied()
    }
}

/// `S × |variables|` posterior draws, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawMatrix {
    variables: Vec<String>,
    values: Vec<f64>,
}

impl DrawMatrix {
    /// Build from row-major values.
    pub fn new(variables: Vec<String>, values: Vec<f64>) -> Result<Self> {
        if variables.is_empty() {
            if values.is_empty() {
                return Ok(Self { variables, values });
            }
            return Err(CalibrationError::Internal(
                "draw values supplied without variables".to_owned(),
            ));
        }
        if values.len() % variables.len() != 0 {
            return Err(CalibrationError::Internal(format!(
                "{} draw values do not fill rows of {} variables",
                values.len(),
                variables.len()
            )));
        }
        Ok(Self { variables, values })
    }

    /// Build from one draw vector per variable.
    pub fn from_columns(columns: Vec<(String, Vec<f64>)>) -> Result<Self> {
        let n_draws = columns.first().map_or(0, |(_, c)| c.len());
        if let Some((name, col)) = columns.iter().find(|(_, c)| c.len() != n_draws) {
            return Err(CalibrationError::Internal(format!(
                "column `{name}` has {} draws, expected {n_draws}",
                col.len()
            )));
        }
        let mut values = Vec::with_capacity(n_draws * columns.len());
        for s in 0..n_draws {
            values.extend(columns.iter().map(|(_, c)| c[s]));
        }
        let variables = columns.into_iter().map(|(name, _)| name).collect();
        Ok(Self { variables, values })
    }

    #[must_use]
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    #[must_use]
    pub fn n_draws(&self) -> usize {
        if self.variables.is_empty() {
            0
        } else {
            self.values.len() / self.variables.len()
        }
    }

    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|v| v == name)
    }

    /// Copy of the draws for `name`.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let j = self.column_index(name)?;
        let width = self.variables.len();
        Some(self.values.iter().skip(j).step_by(width).copied().collect())
    }

    /// Draw `s` as `(name, value)` pairs.
    #[must_use]
    pub fn row(&self, s: usize) -> Vec<(&str, f64)> {
        let width = self.variables.len();
        self.variables
            .iter()
            .map(String::as_str)
            .zip(self.values[s * width..(s + 1) * width].iter().copied())
            .collect()
    }
}
