//! Batch orchestrator: runs `n_sims` independent replications and aggregates
//! them into one ranks table.
//!
//! # Architecture
//!
//! ```text
//!  config ─► validate ─► generator ─► effective prior (precondition fit, once)
//!                                         │
//!        ┌────────── batch 0 ─────────────┼──── batch 1 ──── ...
//!        │  scoped workers pull indices   │
//!        │  from an atomic cursor         │
//!        ▼                                ▼
//!   ReplicationRunner::run(seeds(index)) ─► Accumulator (mutex, one push per
//!                                           replication) ─► CalibrationReport
//! ```
//!
//! Seeds depend only on `(root_seed, index)` and the table is sorted
//! canonically at the end, so the report is independent of worker count,
//! scheduling, and batch size. Configuration errors abort before any
//! replication starts; replication failures never abort the batch.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

use ifsbc_error::{CalibrationError, Result};
use ifsbc_types::{
    Cx, DiscrepancyResult, FailureKind, PriorConfig, RankRecord, RanksTable, Replication,
    ReplicationStatus, SimulationSpec,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::artifacts::{EventLog, RunEvent, RunEventKind};
use crate::config::CalibrationConfig;
use crate::discrepancy::DiscrepancyScorer;
use crate::generator::{CovariateSource, SyntheticDataGenerator};
use crate::oracle::InferenceOracle;
use crate::precondition::{EffectivePrior, PreconditionSample, PreconditionedPrior};
use crate::rank_computer::RankComputer;
use crate::runner::{ReplicationOutcome, ReplicationRunner};
use crate::seed_taxonomy::{ReplicationSeeds, precondition_fit_seed};

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Failure count and reason histogram.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub total: usize,
    pub by_kind: BTreeMap<FailureKind, usize>,
    pub by_reason: BTreeMap<String, usize>,
}

impl FailureSummary {
    fn from_replications(replications: &[Replication]) -> Self {
        let mut summary = Self::default();
        for reason in replications.iter().filter_map(|r| r.failure_reason.as_ref()) {
            summary.total += 1;
            *summary.by_kind.entry(reason.kind).or_default() += 1;
            *summary.by_reason.entry(reason.to_string()).or_default() += 1;
        }
        summary
    }
}

/// Outcome of one orchestrator invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub spec: SimulationSpec,
    pub root_seed: u64,
    pub n_sims: usize,
    pub ranks: RanksTable,
    /// Every replication, sorted by index; unstarted ones stay `pending`.
    pub replications: Vec<Replication>,
    pub failures: FailureSummary,
    pub completed: usize,
    pub not_started: usize,
    pub cancelled: bool,
    /// Size of the precondition sample, if the prior was preconditioned.
    pub precondition_len: Option<usize>,
    pub events: Vec<RunEvent>,
}

impl CalibrationReport {
    #[must_use]
    pub fn ranked_count(&self) -> usize {
        self.replications
            .iter()
            .filter(|r| r.status == ReplicationStatus::Ranked)
            .count()
    }

    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.failures.total
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|err| {
            CalibrationError::Serialization(format!("calibration report encode failed: {err}"))
        })
    }

    /// One-line summary for logs and CI output.
    #[must_use]
    pub fn triage_line(&self) -> String {
        format!(
            "{} N={} K={} n_sims={} ranked={} failed={} not_started={} rows={} na={}{}",
            self.spec.family,
            self.spec.sample_size,
            self.spec.covariate_count,
            self.n_sims,
            self.ranked_count(),
            self.failed_count(),
            self.not_started,
            self.ranks.len(),
            self.ranks.na_count(),
            if self.cancelled { " CANCELLED" } else { "" }
        )
    }
}

// ---------------------------------------------------------------------------
// Accumulation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Accumulator {
    records: Vec<RankRecord>,
    replications: Vec<Replication>,
}

impl Accumulator {
    /// A replication's records land together or not at all.
    fn push(&mut self, outcome: ReplicationOutcome) {
        self.records.extend(outcome.records);
        self.replications.push(outcome.replication);
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct BatchOrchestrator<O: InferenceOracle> {
    oracle: Arc<O>,
    spec: SimulationSpec,
    prior: PriorConfig,
    config: CalibrationConfig,
    covariates: CovariateSource,
    precondition: Option<PreconditionSample>,
    cx: Cx,
}

impl<O: InferenceOracle> BatchOrchestrator<O> {
    #[must_use]
    pub fn new(
        oracle: Arc<O>,
        spec: SimulationSpec,
        prior: PriorConfig,
        config: CalibrationConfig,
    ) -> Self {
        Self {
            oracle,
            spec,
            prior,
            config,
            covariates: CovariateSource::StandardNormal,
            precondition: None,
            cx: Cx::new(),
        }
    }

    #[must_use]
    pub fn with_covariates(mut self, covariates: CovariateSource) -> Self {
        self.covariates = covariates;
        self
    }

    /// Use `sample` as the precondition sample, overriding the config.
    #[must_use]
    pub fn with_precondition(mut self, sample: PreconditionSample) -> Self {
        self.precondition = Some(sample);
        self
    }

    /// Run under `cx`; cancelling it stops the batch.
    #[must_use]
    pub fn with_cancel(mut self, cx: Cx) -> Self {
        self.cx = cx;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    #[must_use]
    pub const fn spec(&self) -> &SimulationSpec {
        &self.spec
    }

    /// Handle for cancelling a running batch from another thread.
    #[must_use]
    pub fn cancel_handle(&self) -> Cx {
        self.cx.clone()
    }

    /// Run every replication and aggregate the ranks table.
    pub fn run(&self) -> Result<CalibrationReport> {
        let setup = self.prepare().inspect_err(|err| {
            error!(error = %err, family = %self.spec.family, "calibration setup rejected");
        })?;
        let Setup {
            runner,
            mut events,
            precondition_len,
        } = setup;

        let n_sims = u32::try_from(self.config.n_sims)
            .map_err(|_| CalibrationError::config("n_sims exceeds u32 range"))?;
        let batch_size = u32::try_from(self.config.effective_batch_size()).unwrap_or(n_sims);
        let workers = self.config.effective_workers().min(batch_size as usize).max(1);
        let root_seed = self.config.root_seed;

        info!(
            n_sims,
            batch_size,
            workers,
            root_seed,
            family = %self.spec.family,
            preconditioned = precondition_len.is_some(),
            "calibration run started"
        );

        let accumulator = Mutex::new(Accumulator::default());
        let mut start = 0_u32;
        let mut batch = 0_u32;
        while start < n_sims && !self.cx.is_cancelled() {
            let end = start.saturating_add(batch_size).min(n_sims);
            events.emit(
                RunEventKind::BatchStart,
                "batch_start",
                [
                    ("batch", Value::from(batch)),
                    ("start", Value::from(start)),
                    ("end", Value::from(end)),
                ],
            );
            let before = accumulator.lock().replications.len();
            run_batch(&runner, start..end, workers, &self.cx, root_seed, &accumulator);

            let guard = accumulator.lock();
            let mut failed: Vec<&Replication> = guard.replications[before..]
                .iter()
                .filter(|r| r.is_failed())
                .collect();
            failed.sort_by_key(|r| r.index);
            for rep in &failed {
                let reason = rep
                    .failure_reason
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                events.emit(
                    RunEventKind::ReplicationFailed,
                    "replication_failed",
                    [("index", Value::from(rep.index)), ("reason", Value::from(reason))],
                );
            }
            let done = guard.replications.len() - before;
            let failed = failed.len();
            drop(guard);
            events.emit(
                RunEventKind::BatchEnd,
                "batch_end",
                [
                    ("batch", Value::from(batch)),
                    ("completed", Value::from(done)),
                    ("failed", Value::from(failed)),
                ],
            );
            info!(batch, start, end, completed = done, failed, "batch finished");

            start = end;
            batch += 1;
        }

        let Accumulator {
            records,
            mut replications,
        } = accumulator.into_inner();
        let completed = replications.len();
        let cancelled = self.cx.is_cancelled() || completed < n_sims as usize;
        let mut seen = vec![false; n_sims as usize];
        for rep in &replications {
            seen[rep.index as usize] = true;
        }
        for (index, _) in seen.iter().enumerate().filter(|(_, done)| !**done) {
            let index = index as u32;
            replications.push(Replication::pending(
                index,
                ReplicationSeeds::derive(root_seed, index).simulate,
            ));
        }
        replications.sort_by_key(|r| r.index);
        let not_started = n_sims as usize - completed;

        if cancelled {
            warn!(completed, not_started, "calibration run cancelled");
            events.emit(
                RunEventKind::Cancelled,
                "cancelled",
                [
                    ("completed", Value::from(completed)),
                    ("not_started", Value::from(not_started)),
                ],
            );
        }

        let failures = FailureSummary::from_replications(&replications);
        let ranks = RanksTable::from_records(records);
        events.emit(
            RunEventKind::RunEnd,
            "run_end",
            [
                ("rows", Value::from(ranks.len())),
                ("na", Value::from(ranks.na_count())),
                ("failed", Value::from(failures.total)),
            ],
        );

        let report = CalibrationReport {
            spec: self.spec.clone(),
            root_seed,
            n_sims: self.config.n_sims,
            ranks,
            replications,
            failures,
            completed,
            not_started,
            cancelled,
            precondition_len,
            events: events.into_events(),
        };
        info!(summary = %report.triage_line(), "calibration run finished");
        Ok(report)
    }

    /// Score every variable of `report` with this run's scoring settings.
    pub fn score(&self, report: &CalibrationReport) -> Result<Vec<Result<DiscrepancyResult>>> {
        Ok(DiscrepancyScorer::from_config(&self.config)?.score_all(&report.ranks))
    }

    /// Everything that must succeed before the first replication starts.
    fn prepare(&self) -> Result<Setup<O>> {
        self.config.validate()?;
        self.prior.validate()?;
        let generator = Arc::new(SyntheticDataGenerator::new(
            self.spec.clone(),
            self.covariates.clone(),
        )?);
        let variables = self.config.resolve_variables(&self.spec)?;
        let policy = self.config.rank_policy()?;

        let mut events = EventLog::default();
        events.emit(
            RunEventKind::RunStart,
            "run_start",
            [
                ("family", Value::from(self.spec.family.to_string())),
                ("n_sims", Value::from(self.config.n_sims)),
                ("batch_size", Value::from(self.config.effective_batch_size())),
                ("root_seed", Value::from(self.config.root_seed)),
                ("variables", Value::from(variables.clone())),
            ],
        );

        let sample = self.precondition_sample(&generator)?;
        let prior = match &sample {
            None => EffectivePrior::Base(Arc::new(self.prior)),
            Some(sample) => {
                let cx = self
                    .cx
                    .child()
                    .with_entropy(precondition_fit_seed(self.config.root_seed, sample.len()));
                let pre = PreconditionedPrior::condition(
                    self.oracle.as_ref(),
                    sample,
                    &self.prior,
                    &self.spec,
                    &cx,
                )?;
                events.emit(
                    RunEventKind::Precondition,
                    "precondition",
                    [
                        ("sample_len", Value::from(sample.len())),
                        ("draws", Value::from(pre.draws().n_draws())),
                        (
                            "source",
                            Value::from(match sample {
                                PreconditionSample::External(_) => "external",
                                PreconditionSample::Simulated { .. } => "simulated",
                            }),
                        ),
                    ],
                );
                EffectivePrior::Preconditioned(Arc::new(pre))
            }
        };
        prior.truth_sampler().check(&self.spec)?;

        let runner = ReplicationRunner::new(
            Arc::clone(&self.oracle),
            generator,
            prior,
            RankComputer::new(policy, variables),
        )
        .with_timeout(self.config.timeout())
        .with_keep_draws(self.config.keep_draws);

        Ok(Setup {
            runner,
            events,
            precondition_len: sample.as_ref().map(PreconditionSample::len),
        })
    }

    fn precondition_sample(
        &self,
        generator: &SyntheticDataGenerator,
    ) -> Result<Option<PreconditionSample>> {
        if let Some(sample) = &self.precondition {
            return Ok(Some(sample.clone()));
        }
        if let Some(data) = &self.config.precon_sample {
            return PreconditionSample::from_dataset(data.clone()).map(Some);
        }
        if let Some(size) = self.config.precon_sample_size {
            return PreconditionSample::simulate(generator, &self.prior, self.config.root_seed, size)
                .map(Some);
        }
        Ok(None)
    }
}

struct Setup<O: InferenceOracle> {
    runner: ReplicationRunner<O>,
    events: EventLog,
    precondition_len: Option<usize>,
}

/// Run indices `range` on `workers` scoped threads.
fn run_batch<O: InferenceOracle>(
    runner: &ReplicationRunner<O>,
    range: Range<u32>,
    workers: usize,
    cx: &Cx,
    root_seed: u64,
    accumulator: &Mutex<Accumulator>,
) {
    let cursor = AtomicU32::new(range.start);
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    if cx.is_cancelled() {
                        break;
                    }
                    let index = cursor.fetch_add(1, Ordering::Relaxed);
                    if index >= range.end {
                        break;
                    }
                    let outcome = runner.run(ReplicationSeeds::derive(root_seed, index), cx);
                    accumulator.lock().push(outcome);
                }
            });
        }
    });
}
