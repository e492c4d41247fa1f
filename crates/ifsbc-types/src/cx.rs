//! Cancellation context handed to every inference-oracle call.
//!
//! A [`Cx`] carries three capabilities:
//! - a hierarchical cancel flag (cancelling a parent cancels every child),
//! - an optional deadline,
//! - the entropy seed the oracle must use for its own sampler.
//!
//! Oracles call [`Cx::checkpoint`] between long-running steps.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use ifsbc_error::OracleError;

#[derive(Debug, Default)]
struct CancelNode {
    flag: AtomicBool,
    parent: Option<Arc<CancelNode>>,
}

impl CancelNode {
    fn is_set(&self) -> bool {
        if self.flag.load(Ordering::Acquire) {
            return true;
        }
        self.parent.as_ref().is_some_and(|p| p.is_set())
    }
}

#[derive(Debug, Clone)]
pub struct Cx {
    cancel: Arc<CancelNode>,
    deadline: Option<Instant>,
    entropy: u64,
}

impl Default for Cx {
    fn default() -> Self {
        Self::new()
    }
}

impl Cx {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cancel: Arc::new(CancelNode::default()),
            deadline: None,
            entropy: 0,
        }
    }

    /// Derive a child context: cancelled whenever `self` is, but cancelling
    /// the child leaves the parent untouched.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            cancel: Arc::new(CancelNode {
                flag: AtomicBool::new(false),
                parent: Some(Arc::clone(&self.cancel)),
            }),
            deadline: self.deadline,
            entropy: self.entropy,
        }
    }

    #[must_use]
    pub fn with_entropy(mut self, seed: u64) -> Self {
        self.entropy = seed;
        self
    }

    /// Tighten the deadline; an earlier existing deadline wins.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
        self
    }

    #[must_use]
    pub const fn entropy_seed(&self) -> u64 {
        self.entropy
    }

    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancel.flag.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_set()
    }

    /// Cooperative cancellation point.
    pub fn checkpoint(&self) -> Result<(), OracleError> {
        if self.is_cancelled() {
            return Err(OracleError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(OracleError::Timeout);
        }
        Ok(())
    }
}
