//! One simulate → infer → rank cycle and its state machine.
//!
//! ```text
//!  pending ──► simulated ──► fitted ──► ranked
//!     │            │            │
//!     └────────────┴────────────┴──────► failed (terminal)
//! ```
//!
//! Transitions only move right; `ranked` and `failed` are terminal.

use std::fmt;

use ifsbc_error::OracleError;
use serde::{Deserialize, Serialize};

use crate::dataset::{Dataset, DrawMatrix, Truth};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationStatus {
    Pending,
    Simulated,
    Fitted,
    Ranked,
    Failed,
}

impl ReplicationStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ranked | Self::Failed)
    }

    /// Whether `self → next` is a legal edge.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Simulated)
                | (Self::Simulated, Self::Fitted)
                | (Self::Fitted, Self::Ranked)
                | (Self::Pending | Self::Simulated | Self::Fitted, Self::Failed)
        )
    }
}

/// Coarse failure classification used by the failure histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The generator could not produce a valid pseudo-dataset.
    Simulation,
    NonConvergence,
    Numeric,
    Malformed,
    UnknownVariable,
    Timeout,
    Cancelled,
    Panicked,
}

impl FailureKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Simulation => "simulation",
            Self::NonConvergence => "non_convergence",
            Self::Numeric => "numeric",
            Self::Malformed => "malformed",
            Self::UnknownVariable => "unknown_variable",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Panicked => "panicked",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&OracleError> for FailureKind {
    fn from(err: &OracleError) -> Self {
        match err {
            OracleError::NonConvergence(_) => Self::NonConvergence,
            OracleError::Numeric(_) => Self::Numeric,
            OracleError::Malformed(_) => Self::Malformed,
            OracleError::UnknownVariable(_) => Self::UnknownVariable,
            OracleError::Timeout => Self::Timeout,
            OracleError::Cancelled => Self::Cancelled,
            OracleError::Panicked(_) => Self::Panicked,
        }
    }
}

/// Failure kind plus the captured reason string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() || self.message == self.kind.as_str() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl From<OracleError> for FailureReason {
    fn from(err: OracleError) -> Self {
        Self {
            kind: FailureKind::from(&err),
            message: err.to_string(),
        }
    }
}

/// Simulated truth and the pseudo-dataset generated from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedTruth {
    pub truth: Truth,
    pub data: Dataset,
}

/// State of one replication. Retained for accounting even when it fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Replication {
    pub index: u32,
    pub seed: u64,
    pub truth: Option<SimulatedTruth>,
    pub posterior_draws: Option<DrawMatrix>,
    pub status: ReplicationStatus,
    pub failure_reason: Option<FailureReason>,
}

impl Replication {
    #[must_use]
    pub const fn pending(index: u32, seed: u64) -> Self {
        Self {
            index,
            seed,
            truth: None,
            posterior_draws: None,
            status: ReplicationStatus::Pending,
            failure_reason: None,
        }
    }

    /// `pending → simulated`.
    pub fn mark_simulated(&mut self, truth: SimulatedTruth) {
        self.advance(ReplicationStatus::Simulated);
        self.truth = Some(truth);
    }

    /// `simulated → fitted`.
    pub fn mark_fitted(&mut self, draws: DrawMatrix) {
        self.advance(ReplicationStatus::Fitted);
        self.posterior_draws = Some(draws);
    }

    /// `fitted → ranked`; draws are dropped unless `keep_draws`.
    pub fn mark_ranked(&mut self, keep_draws: bool) {
        self.advance(ReplicationStatus::Ranked);
        if !keep_draws {
            self.posterior_draws = None;
        }
    }

    /// Any non-terminal state `→ failed`.
    pub fn mark_failed(&mut self, reason: FailureReason) {
        self.advance(ReplicationStatus::Failed);
        self.posterior_draws = None;
        self.failure_reason = Some(reason);
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status == ReplicationStatus::Failed
    }

    fn advance(&mut self, next: ReplicationStatus) {
        debug_assert!(
            self.status.can_advance_to(next),
            "illegal replication transition {:?} -> {next:?} at index {}",
            self.status,
            self.index
        );
        self.status = next;
    }
}
