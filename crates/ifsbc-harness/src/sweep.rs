//! Precondition-size sweep.
//!
//! Runs one full orchestrator invocation per precondition sample size. Each
//! sweep point simulates its own precondition sample once (seeded from the
//! root seed and the size) and holds it fixed for every replication of that
//! point; the replication seeds are shared across points so differences come
//! from preconditioning alone.

use std::sync::Arc;

use ifsbc_error::{CalibrationError, Result};
use ifsbc_types::{DiscrepancyResult, PriorConfig, SimulationSpec};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::CalibrationConfig;
use crate::generator::CovariateSource;
use crate::oracle::InferenceOracle;
use crate::orchestrator::{BatchOrchestrator, CalibrationReport};

/// Result of one sweep point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepPoint {
    pub precondition_size: usize,
    pub report: CalibrationReport,
    pub discrepancy: Vec<DiscrepancyResult>,
    /// Variables that could not be scored, with the reason.
    pub unscored: Vec<(String, String)>,
}

/// Run `base` once per entry of `sizes`.
pub fn precondition_sweep<O: InferenceOracle>(
    oracle: &Arc<O>,
    spec: &SimulationSpec,
    prior: PriorConfig,
    base: &CalibrationConfig,
    covariates: &CovariateSource,
    sizes: &[usize],
) -> Result<Vec<SweepPoint>> {
    if sizes.is_empty() {
        return Err(CalibrationError::config(
            "precondition sweep needs at least one sample size",
        ));
    }

    let mut points = Vec::with_capacity(sizes.len());
    for &size in sizes {
        let mut config = base.clone();
        config.precon_sample = None;
        config.precon_sample_size = Some(size);

        let orchestrator = BatchOrchestrator::new(Arc::clone(oracle), spec.clone(), prior, config)
            .with_covariates(covariates.clone());
        let report = orchestrator.run()?;

        let mut discrepancy = Vec::new();
        let mut unscored = Vec::new();
        for (variable, scored) in report
            .ranks
            .variables()
            .into_iter()
            .zip(orchestrator.score(&report)?)
        {
            match scored {
                Ok(result) => discrepancy.push(result),
                Err(err) => unscored.push((variable, err.to_string())),
            }
        }
        info!(
            precondition_size = size,
            scored = discrepancy.len(),
            unscored = unscored.len(),
            failed = report.failed_count(),
            "sweep point finished"
        );
        points.push(SweepPoint {
            precondition_size: size,
            report,
            discrepancy,
            unscored,
        });
    }
    Ok(points)
}
