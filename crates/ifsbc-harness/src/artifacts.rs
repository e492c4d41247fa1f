//! Run events and on-disk run bundles.
//!
//! A bundle directory holds everything needed to audit or re-score one
//! calibration run:
//! - `meta.json` for run metadata and the ranks-table digest
//! - `events.jsonl` for structured lifecycle events
//! - `ranks.jsonl` for the canonical ranks table
//! - `failures.json` for the failure histogram and failed replications
//! - `discrepancy.json` for per-variable discrepancy results

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use ifsbc_error::{CalibrationError, Result};
use ifsbc_types::{DiscrepancyResult, FailureReason, RanksTable};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::orchestrator::{CalibrationReport, FailureSummary};

/// Version of the bundle schema.
pub const BUNDLE_SCHEMA_VERSION: u32 = 1;

/// Files that must be present in every run bundle.
pub const REQUIRED_BUNDLE_FILES: [&str; 5] = [
    "meta.json",
    "events.jsonl",
    "ranks.jsonl",
    "failures.json",
    "discrepancy.json",
];

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    RunStart,
    Precondition,
    BatchStart,
    BatchEnd,
    ReplicationFailed,
    Cancelled,
    RunEnd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    pub kind: RunEventKind,
    pub step: u64,
    pub message: String,
    pub payload: BTreeMap<String, Value>,
}

/// Step-numbered event sequence of one run.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Vec<RunEvent>,
}

impl EventLog {
    pub fn emit<const N: usize>(
        &mut self,
        kind: RunEventKind,
        message: impl Into<String>,
        payload: [(&str, Value); N],
    ) {
        let event = RunEvent {
            kind,
            step: self.events.len() as u64,
            message: message.into(),
            payload: payload
                .into_iter()
                .map(|(key, value)| (key.to_owned(), value))
                .collect(),
        };
        self.events.push(event);
    }

    #[must_use]
    pub fn into_events(self) -> Vec<RunEvent> {
        self.events
    }
}

// ---------------------------------------------------------------------------
// Bundle files
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMeta {
    pub schema_version: u32,
    pub name: String,
    pub root_seed: u64,
    pub n_sims: usize,
    pub family: String,
    pub sample_size: usize,
    pub covariate_count: usize,
    pub group_count: Option<usize>,
    pub preconditioned: bool,
    pub ranks_digest: String,
    pub harness_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedReplication {
    pub index: u32,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailuresArtifact {
    pub summary: FailureSummary,
    pub replications: Vec<FailedReplication>,
}

/// Writer for one run bundle directory.
#[derive(Debug)]
pub struct RunBundle {
    root: PathBuf,
}

impl RunBundle {
    /// Write `report` and its discrepancy results under `base_dir`.
    pub fn write(
        base_dir: &Path,
        name: &str,
        report: &CalibrationReport,
        discrepancy: &[DiscrepancyResult],
    ) -> Result<Self> {
        if name.is_empty() {
            return Err(CalibrationError::config("bundle name must be non-empty"));
        }
        let root = base_dir.join(bundle_dir_name(name, report.root_seed));
        fs::create_dir_all(&root)?;

        let meta = BundleMeta {
            schema_version: BUNDLE_SCHEMA_VERSION,
            name: name.to_owned(),
            root_seed: report.root_seed,
            n_sims: report.n_sims,
            family: report.spec.family.to_string(),
            sample_size: report.spec.sample_size,
            covariate_count: report.spec.covariate_count,
            group_count: report.spec.group_count,
            preconditioned: report.precondition_len.is_some(),
            ranks_digest: report.ranks.digest()?,
            harness_version: env!("CARGO_PKG_VERSION").to_owned(),
        };
        write_json_file(&root.join("meta.json"), &meta)?;

        let mut events = fs::File::create(root.join("events.jsonl"))?;
        for event in &report.events {
            let line = serde_json::to_string(event).map_err(|err| {
                CalibrationError::Serialization(format!("failed to serialize run event: {err}"))
            })?;
            writeln!(events, "{line}")?;
        }

        fs::write(root.join("ranks.jsonl"), report.ranks.to_jsonl()?)?;

        let failures = FailuresArtifact {
            summary: report.failures.clone(),
            replications: report
                .replications
                .iter()
                .filter_map(|rep| {
                    rep.failure_reason.clone().map(|reason| FailedReplication {
                        index: rep.index,
                        reason,
                    })
                })
                .collect(),
        };
        write_json_file(&root.join("failures.json"), &failures)?;
        write_json_file(&root.join("discrepancy.json"), &discrepancy)?;

        info!(
            root = %root.display(),
            rows = report.ranks.len(),
            failed = report.failures.total,
            "run bundle written"
        );
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

pub fn validate_required_files(bundle_root: &Path) -> Result<()> {
    let missing: Vec<&str> = REQUIRED_BUNDLE_FILES
        .iter()
        .copied()
        .filter(|name| !bundle_root.join(name).is_file())
        .collect();

    if missing.is_empty() {
        return Ok(());
    }

    error!(
        bundle = %bundle_root.display(),
        missing_count = missing.len(),
        "missing required run bundle files"
    );
    Err(serialization_error(format!(
        "missing required bundle files: {}",
        missing.join(", ")
    )))
}

pub fn validate_bundle_meta(bundle_root: &Path) -> Result<BundleMeta> {
    let bytes = fs::read(bundle_root.join("meta.json"))?;
    let meta: BundleMeta = serde_json::from_slice(&bytes)
        .map_err(|err| serialization_error(format!("meta.json parse failure: {err}")))?;

    if meta.schema_version != BUNDLE_SCHEMA_VERSION {
        warn!(
            expected = BUNDLE_SCHEMA_VERSION,
            found = meta.schema_version,
            "bundle schema version mismatch"
        );
        return Err(serialization_error(format!(
            "unsupported schema version: expected {BUNDLE_SCHEMA_VERSION}, got {}",
            meta.schema_version
        )));
    }
    if meta.name.is_empty() || meta.ranks_digest.is_empty() {
        return Err(serialization_error(
            "meta.json must include non-empty name and ranks_digest",
        ));
    }

    Ok(meta)
}

pub fn validate_events_jsonl(bundle_root: &Path) -> Result<Vec<RunEvent>> {
    let contents = fs::read_to_string(bundle_root.join("events.jsonl"))?;
    let mut events = Vec::new();

    for (line_no, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            return Err(serialization_error(format!(
                "events.jsonl has empty line at {}",
                line_no + 1
            )));
        }
        let event: RunEvent = serde_json::from_str(line).map_err(|err| {
            serialization_error(format!(
                "events.jsonl parse failure at line {}: {err}",
                line_no + 1
            ))
        })?;
        if event.step != line_no as u64 {
            return Err(serialization_error(format!(
                "events.jsonl step {} out of sequence at line {}",
                event.step,
                line_no + 1
            )));
        }
        events.push(event);
    }

    if events.first().map(|event| event.kind) != Some(RunEventKind::RunStart) {
        return Err(serialization_error(
            "events.jsonl must start with a run_start event",
        ));
    }
    if events.last().map(|event| event.kind) != Some(RunEventKind::RunEnd) {
        return Err(serialization_error(
            "events.jsonl must end with a run_end event",
        ));
    }

    Ok(events)
}

/// Parse `ranks.jsonl`.
pub fn load_ranks(bundle_root: &Path) -> Result<RanksTable> {
    RanksTable::from_jsonl(&fs::read_to_string(bundle_root.join("ranks.jsonl"))?)
}

pub fn load_discrepancy(bundle_root: &Path) -> Result<Vec<DiscrepancyResult>> {
    let bytes = fs::read(bundle_root.join("discrepancy.json"))?;
    serde_json::from_slice(&bytes)
        .map_err(|err| serialization_error(format!("discrepancy.json parse failure: {err}")))
}

pub fn validate_bundle(bundle_root: &Path) -> Result<BundleMeta> {
    validate_required_files(bundle_root)?;
    let meta = validate_bundle_meta(bundle_root)?;
    validate_events_jsonl(bundle_root)?;

    let digest = load_ranks(bundle_root)?.digest()?;
    if digest != meta.ranks_digest {
        error!(
            bundle = %bundle_root.display(),
            expected = %meta.ranks_digest,
            found = %digest,
            "ranks digest mismatch"
        );
        return Err(serialization_error(format!(
            "ranks.jsonl digest {digest} does not match meta.json {}",
            meta.ranks_digest
        )));
    }

    let failures: FailuresArtifact = serde_json::from_slice(&fs::read(
        bundle_root.join("failures.json"),
    )?)
    .map_err(|err| serialization_error(format!("failures.json parse failure: {err}")))?;
    if failures.summary.total != failures.replications.len() {
        return Err(serialization_error(format!(
            "failures.json lists {} replications but summary counts {}",
            failures.replications.len(),
            failures.summary.total
        )));
    }
    load_discrepancy(bundle_root)?;

    Ok(meta)
}

fn write_json_file<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|err| serialization_error(format!("failed to serialize JSON: {err}")))?;
    fs::write(path, bytes)?;
    Ok(())
}

fn bundle_dir_name(name: &str, root_seed: u64) -> String {
    format!("{}-seed-{root_seed}", sanitize_segment(name))
}

fn sanitize_segment(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn serialization_error(message: impl Into<String>) -> CalibrationError {
    CalibrationError::Serialization(message.into())
}
