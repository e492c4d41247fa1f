//! Seed taxonomy for reproducible calibration runs.
//!
//! Derives purpose-specific seeds from a single root seed using
//! `H(root_seed || purpose_tag || scope)` where `H` is xxh3_64.
//! Nothing here reads ambient state, so a replication's seeds depend only on
//! `(root_seed, index)` and never on worker count or scheduling order.
//!
//! # Seed Categories
//!
//! - **simulate**: truth draw, covariates, group assignment, pseudo-response.
//! - **tie_break**: randomized resolution of ties during ranking.
//! - **oracle**: entropy handed to the inference oracle via `Cx`.
//! - **precondition**: internally simulated precondition sample.
//! - **precondition_fit**: entropy for the one-off precondition fit.
//! - **reference**: Monte-Carlo reference threshold for the discrepancy score.

use xxhash_rust::xxh3::xxh3_64;

const TAG_SIMULATE: &[u8] = b"simulate";
const TAG_TIE_BREAK: &[u8] = b"tie_break";
const TAG_ORACLE: &[u8] = b"oracle";
const TAG_PRECONDITION: &[u8] = b"precondition";
const TAG_PRECONDITION_FIT: &[u8] = b"precondition_fit";
const TAG_REFERENCE: &[u8] = b"reference";

/// Seeds owned by one replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationSeeds {
    /// The root seed of the invocation.
    pub root: u64,
    /// Replication index within the invocation.
    pub index: u32,
    pub simulate: u64,
    pub tie_break: u64,
    pub oracle: u64,
}

impl ReplicationSeeds {
    /// Derive the seeds of replication `index`.
    #[must_use]
    pub fn derive(root_seed: u64, index: u32) -> Self {
        let scope = index.to_le_bytes();
        Self {
            root: root_seed,
            index,
            simulate: derive_seed(root_seed, TAG_SIMULATE, &scope),
            tie_break: derive_seed(root_seed, TAG_TIE_BREAK, &scope),
            oracle: derive_seed(root_seed, TAG_ORACLE, &scope),
        }
    }
}

/// Seed for the internally simulated precondition sample of a sweep point.
#[must_use]
pub fn precondition_seed(root_seed: u64, sample_size: usize) -> u64 {
    derive_seed(root_seed, TAG_PRECONDITION, &(sample_size as u64).to_le_bytes())
}

/// Oracle entropy for fitting a precondition sample of `sample_len` rows.
#[must_use]
pub fn precondition_fit_seed(root_seed: u64, sample_len: usize) -> u64 {
    derive_seed(root_seed, TAG_PRECONDITION_FIT, &(sample_len as u64).to_le_bytes())
}

/// Seed for the adjust-gamma reference simulation of `(n, grid_levels)`.
#[must_use]
pub fn reference_seed(root_seed: u64, n: usize, grid_levels: u32) -> u64 {
    let mut scope = [0_u8; 12];
    scope[..8].copy_from_slice(&(n as u64).to_le_bytes());
    scope[8..].copy_from_slice(&grid_levels.to_le_bytes());
    derive_seed(root_seed, TAG_REFERENCE, &scope)
}

/// `H(root_seed_bytes || purpose_tag || scope)`.
fn derive_seed(root_seed: u64, purpose_tag: &[u8], scope: &[u8]) -> u64 {
    let mut buf = Vec::with_capacity(8 + purpose_tag.len() + scope.len());
    buf.extend_from_slice(&root_seed.to_le_bytes());
    buf.extend_from_slice(purpose_tag);
    buf.extend_from_slice(scope);
    xxh3_64(&buf)
}
