//! Replication runner: drives one replication through
//! `pending → simulated → fitted → ranked`, or to `failed`.
//!
//! Failures are local. Whatever the oracle does (error, panic, hang), the
//! runner returns a terminal replication and a complete set of rank records
//! for it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ifsbc_types::{Cx, FailureReason, RankRecord, Replication};
use tracing::{debug, warn};

use crate::generator::SyntheticDataGenerator;
use crate::oracle::{InferenceOracle, infer};
use crate::precondition::EffectivePrior;
use crate::rank_computer::RankComputer;
use crate::seed_taxonomy::ReplicationSeeds;

/// A terminal replication and its rank rows.
#[derive(Debug, Clone)]
pub struct ReplicationOutcome {
    pub replication: Replication,
    pub records: Vec<RankRecord>,
}

pub struct ReplicationRunner<O: InferenceOracle> {
    oracle: Arc<O>,
    generator: Arc<SyntheticDataGenerator>,
    prior: EffectivePrior<O::Handle>,
    ranks: RankComputer,
    timeout: Option<Duration>,
    keep_draws: bool,
}

impl<O: InferenceOracle> ReplicationRunner<O> {
    #[must_use]
    pub const fn new(
        oracle: Arc<O>,
        generator: Arc<SyntheticDataGenerator>,
        prior: EffectivePrior<O::Handle>,
        ranks: RankComputer,
    ) -> Self {
        Self {
            oracle,
            generator,
            prior,
            ranks,
            timeout: None,
            keep_draws: false,
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_keep_draws(mut self, keep_draws: bool) -> Self {
        self.keep_draws = keep_draws;
        self
    }

    #[must_use]
    pub const fn rank_computer(&self) -> &RankComputer {
        &self.ranks
    }

    #[must_use]
    pub const fn effective_prior(&self) -> &EffectivePrior<O::Handle> {
        &self.prior
    }

    /// Run replication `seeds.index` under the batch context `parent`.
    pub fn run(&self, seeds: ReplicationSeeds, parent: &Cx) -> ReplicationOutcome {
        let mut replication = Replication::pending(seeds.index, seeds.simulate);

        let simulated = match self
            .generator
            .simulate(self.prior.truth_sampler(), seeds.simulate)
        {
            Ok(sim) => sim,
            Err(reason) => return self.fail(replication, reason),
        };
        let data = Arc::new(simulated.data.clone());
        replication.mark_simulated(simulated);
        debug!(index = seeds.index, "replication simulated");

        let mut cx = parent.child().with_entropy(seeds.oracle);
        if let Some(timeout) = self.timeout {
            cx = cx.with_deadline(Instant::now() + timeout);
        }
        let draws = match infer(
            &self.oracle,
            &self.prior,
            data,
            self.ranks.variables(),
            &cx,
            self.timeout,
        ) {
            Ok(draws) => draws,
            Err(err) => return self.fail(replication, FailureReason::from(err)),
        };
        replication.mark_fitted(draws);
        debug!(index = seeds.index, "replication fitted");

        let records = self.ranks.rank_replication(&replication, seeds.tie_break);
        replication.mark_ranked(self.keep_draws);
        debug!(
            index = seeds.index,
            na = records.iter().filter(|r| r.is_na()).count(),
            "replication ranked"
        );
        ReplicationOutcome {
            replication,
            records,
        }
    }

    fn fail(&self, mut replication: Replication, reason: FailureReason) -> ReplicationOutcome {
        warn!(
            index = replication.index,
            stage = ?replication.status,
            kind = %reason.kind,
            reason = %reason,
            "replication failed"
        );
        let records = self.ranks.na_records(replication.index);
        replication.mark_failed(reason);
        ReplicationOutcome {
            replication,
            records,
        }
    }
}
