//! Simulation-based calibration harness with inverse-forward-sampling
//! preconditioning.
//!
//! Pipeline:
//!
//! ```text
//! SyntheticDataGenerator + PreconditionedPrior
//!     └─► ReplicationRunner (× n_sims, parallel)
//!             └─► RankComputer ─► RanksTable ─► DiscrepancyScorer
//! ```
//!
//! The inference engine is external and plugs in through
//! [`oracle::InferenceOracle`].

pub mod artifacts;
pub mod config;
pub mod discrepancy;
pub mod family;
pub mod generator;
pub mod oracle;
pub mod orchestrator;
pub mod precondition;
pub mod rank_computer;
pub mod reference_oracle;
pub mod runner;
pub mod seed_taxonomy;
pub mod stats;
pub mod sweep;

pub use artifacts::{RunBundle, RunEvent, RunEventKind, validate_bundle};
pub use config::CalibrationConfig;
pub use discrepancy::{DiscrepancyScorer, EcdfBand, EcdfPoint, adjust_gamma, log_gamma};
pub use generator::{CovariateSource, SyntheticDataGenerator, TruthSampler, dataset_loglik};
pub use oracle::InferenceOracle;
pub use orchestrator::{BatchOrchestrator, CalibrationReport, FailureSummary};
pub use precondition::{EffectivePrior, PreconditionSample, PreconditionedPrior};
pub use rank_computer::{RankComputer, RankPolicy, TieBreak};
pub use reference_oracle::{GaussianPosterior, GaussianReferenceOracle};
pub use runner::{ReplicationOutcome, ReplicationRunner};
pub use seed_taxonomy::ReplicationSeeds;
pub use sweep::{SweepPoint, precondition_sweep};
