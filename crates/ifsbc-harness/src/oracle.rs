//! Inference-oracle contract and the isolated inference stage.
//!
//! The oracle is the only wire boundary of the harness. It is modelled as a
//! pure `fit`/`update` interface returning fresh handles; a handle is never
//! mutated once created, so a preconditioned handle can be read-shared by
//! every worker.
//!
//! [`infer`] runs one replication's oracle stage and guarantees that the
//! caller always gets a `Result` back: panics are caught, deadlines are
//! enforced on a helper thread, and cancellation of the batch is observed
//! while waiting.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use ifsbc_error::OracleError;
use ifsbc_types::{Cx, Dataset, DrawMatrix, LOGLIK_VARIABLE, PriorConfig};
use tracing::warn;

use crate::precondition::EffectivePrior;

/// How often a waiting runner re-checks batch cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(25);

/// External Bayesian inference engine.
///
/// Implementations draw any randomness from `cx.entropy_seed()` and should
/// call `cx.checkpoint()` between long-running steps.
pub trait InferenceOracle: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    /// Fit from the declared prior.
    fn fit(
        &self,
        data: &Dataset,
        prior: &PriorConfig,
        cx: &Cx,
    ) -> Result<Self::Handle, OracleError>;

    /// Condition an existing posterior on `data`, returning a new handle.
    fn update(
        &self,
        handle: &Self::Handle,
        data: &Dataset,
        cx: &Cx,
    ) -> Result<Self::Handle, OracleError>;

    /// `S × |variables|` posterior draws.
    fn posterior_draws(
        &self,
        handle: &Self::Handle,
        variables: &[String],
    ) -> Result<DrawMatrix, OracleError>;

    /// Total log-likelihood of `data` under each posterior draw (length `S`).
    fn pointwise_loglik(&self, handle: &Self::Handle, data: &Dataset)
    -> Result<Vec<f64>, OracleError>;
}

/// Run the fit/update → draws → log-likelihood stage for one replication.
///
/// `variables` are the tracked variables; when `loglik` is among them the
/// pointwise log-likelihood is appended to the returned matrix as a column
/// of that name. With a `timeout` the stage runs on a helper thread and the
/// replication's `cx` is cancelled on expiry.
pub fn infer<O: InferenceOracle>(
    oracle: &Arc<O>,
    prior: &EffectivePrior<O::Handle>,
    data: Arc<Dataset>,
    variables: &[String],
    cx: &Cx,
    timeout: Option<Duration>,
) -> Result<DrawMatrix, OracleError> {
    let Some(timeout) = timeout else {
        return catch_unwind(AssertUnwindSafe(|| {
            run_stage(oracle.as_ref(), prior, &data, variables, cx)
        }))
        .unwrap_or_else(|payload| Err(panicked(payload.as_ref())));
    };

    let (tx, rx) = mpsc::channel();
    let worker = {
        let oracle = Arc::clone(oracle);
        let prior = prior.clone();
        let variables = variables.to_vec();
        let cx = cx.clone();
        thread::Builder::new()
            .name("ifsbc-oracle".to_owned())
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    run_stage(oracle.as_ref(), &prior, &data, &variables, &cx)
                }))
                .unwrap_or_else(|payload| Err(panicked(payload.as_ref())));
                // The runner may have given up already; nobody is listening then.
                let _ = tx.send(outcome);
            })
    };
    if let Err(err) = worker {
        warn!(error = %err, "failed to spawn oracle thread");
        return Err(OracleError::Panicked(format!(
            "oracle thread could not be spawned: {err}"
        )));
    }

    let deadline = Instant::now() + timeout;
    loop {
        let now = Instant::now();
        if now >= deadline {
            cx.cancel();
            return Err(OracleError::Timeout);
        }
        match rx.recv_timeout(CANCEL_POLL.min(deadline - now)) {
            Ok(outcome) => return outcome,
            Err(RecvTimeoutError::Timeout) => {
                if cx.is_cancelled() {
                    return Err(OracleError::Cancelled);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(OracleError::Panicked(
                    "oracle thread exited without a result".to_owned(),
                ));
            }
        }
    }
}

fn run_stage<O: InferenceOracle>(
    oracle: &O,
    prior: &EffectivePrior<O::Handle>,
    data: &Dataset,
    variables: &[String],
    cx: &Cx,
) -> Result<DrawMatrix, OracleError> {
    cx.checkpoint()?;
    let handle = match prior {
        EffectivePrior::Base(config) => oracle.fit(data, config, cx)?,
        EffectivePrior::Preconditioned(pre) => oracle.update(pre.handle(), data, cx)?,
    };
    cx.checkpoint()?;

    let parameters: Vec<String> = variables
        .iter()
        .filter(|v| v.as_str() != LOGLIK_VARIABLE)
        .cloned()
        .collect();
    let mut columns: Vec<(String, Vec<f64>)> = Vec::with_capacity(variables.len());
    if !parameters.is_empty() {
        let draws = oracle.posterior_draws(&handle, &parameters)?;
        for name in &parameters {
            let column = draws
                .column(name)
                .ok_or_else(|| OracleError::UnknownVariable(name.clone()))?;
            columns.push((name.clone(), column));
        }
    }
    if variables.iter().any(|v| v == LOGLIK_VARIABLE) {
        cx.checkpoint()?;
        let loglik = oracle.pointwise_loglik(&handle, data)?;
        // Without parameter columns the log-likelihood alone fixes S.
        if let Some(n_draws) = columns.first().map(|(_, col)| col.len()) {
            if loglik.len() != n_draws {
                return Err(OracleError::Numeric(format!(
                    "pointwise log-likelihood has {} entries for {n_draws} draws",
                    loglik.len()
                )));
            }
        }
        columns.push((LOGLIK_VARIABLE.to_owned(), loglik));
    }
    if columns.is_empty() {
        return DrawMatrix::new(Vec::new(), Vec::new())
            .map_err(|err| OracleError::Malformed(err.to_string()));
    }
    DrawMatrix::from_columns(columns).map_err(|err| OracleError::Malformed(err.to_string()))
}

fn panicked(payload: &(dyn Any + Send)) -> OracleError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned());
    OracleError::Panicked(message)
}
