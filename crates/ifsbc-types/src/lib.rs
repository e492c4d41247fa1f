//! Shared data model for the ifs-SBC calibration harness.

pub mod cx;
pub mod dataset;
pub mod rank;
pub mod replication;
pub mod spec;

pub use cx::Cx;
pub use dataset::{Dataset, DrawMatrix, Truth};
pub use rank::{DiscrepancyResult, RankRecord, RanksTable};
pub use replication::{
    FailureKind, FailureReason, Replication, ReplicationStatus, SimulatedTruth,
};
pub use spec::{
    Family, GROUP_SD_VARIABLE, INTERCEPT_VARIABLE, LOGLIK_VARIABLE, Link, LogNormalPrior,
    NormalPrior, PriorConfig, SimulationSpec,
};
