// Begin/execute/commit loop with abort retries until a deadline.
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

use crate::clock::{Clock, TokioClock};
use crate::config::RetryConfig;
use crate::error::TransactionError;
use crate::executor::{CommitResult, TransactionExecutor};
use crate::retry::backoff_delay;
use crate::state::{AttemptStatus, StateTracker, TxnState};
use crate::transaction::Transaction;

/// Successful outcome of [`TransactionRunner::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct Committed<T> {
    pub value: T,
    pub commit: CommitResult,
    /// Attempts made, including the one that committed.
    pub attempts: u32,
}

/// Runs units of work in fresh transactions, retrying aborts.
///
/// Each `run` is independent; concurrent runs share only the executor.
#[derive(Clone)]
pub struct TransactionRunner {
    executor: Arc<dyn TransactionExecutor>,
    clock: Arc<dyn Clock>,
    config: RetryConfig,
}

impl TransactionRunner {
    pub fn new(executor: Arc<dyn TransactionExecutor>) -> Self {
        Self {
            executor,
            clock: Arc::new(TokioClock),
            config: RetryConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: RetryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub async fn run_with_timeout<T, F, Fut>(
        &self,
        work: F,
        timeout: Duration,
    ) -> Result<Committed<T>, TransactionError>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T, TransactionError>>,
    {
        let deadline = self.clock.now() + timeout;
        self.run(work, deadline).await
    }

    pub async fn run_with_default_timeout<T, F, Fut>(
        &self,
        work: F,
    ) -> Result<Committed<T>, TransactionError>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T, TransactionError>>,
    {
        self.run_with_timeout(work, self.config.timeout()).await
    }

    /// Run `work` until it commits, fails fatally, or `deadline` passes.
    ///
    /// The deadline is checked before each attempt starts and before any
    /// backoff sleep; an attempt that is already running is never cut short.
    pub async fn run<T, F, Fut>(
        &self,
        mut work: F,
        deadline: Instant,
    ) -> Result<Committed<T>, TransactionError>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T, TransactionError>>,
    {
        let seqno = Arc::new(AtomicU64::new(1));
        let mut state = StateTracker::new();
        let mut attempts: u32 = 0;
        let mut last_error: Option<TransactionError> = None;
        loop {
            if self.clock.now() > deadline {
                state.advance(TxnState::Failed);
                tracing::debug!(
                    attempts,
                    status = ?AttemptStatus::AbortedFatal,
                    "transaction deadline exceeded"
                );
                return Err(TransactionError::DeadlineExceeded {
                    attempts,
                    last_error: last_error.map(Box::new),
                });
            }
            if attempts > 0 {
                state.advance(TxnState::Beginning);
            }
            attempts += 1;
            metrics::counter!("courier_txn_attempts_total").increment(1);

            match self.attempt(&mut work, attempts, &seqno, &mut state).await {
                Ok((value, commit)) => {
                    state.advance(TxnState::Succeeded);
                    tracing::debug!(attempts, status = ?AttemptStatus::Committed, "transaction committed");
                    return Ok(Committed {
                        value,
                        commit,
                        attempts,
                    });
                }
                Err(err) if err.is_aborted() => {
                    metrics::counter!("courier_txn_aborted_total").increment(1);
                    let delay = err.retry_hint().delay().unwrap_or_else(|| {
                        backoff_delay(
                            self.config.base_delay(),
                            self.config.multiplier,
                            attempts - 1,
                        )
                    });
                    if self.clock.now() > deadline {
                        state.advance(TxnState::Failed);
                        tracing::debug!(
                            attempts,
                            status = ?AttemptStatus::AbortedFatal,
                            "transaction deadline passed during attempt"
                        );
                        return Err(TransactionError::DeadlineExceeded {
                            attempts,
                            last_error: Some(Box::new(err)),
                        });
                    }
                    tracing::debug!(
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        status = ?AttemptStatus::AbortedRetryable,
                        error = %err,
                        "transaction aborted; backing off"
                    );
                    state.advance(TxnState::BackingOff);
                    self.clock.sleep(delay).await;
                    last_error = Some(err);
                }
                Err(err) => {
                    state.advance(TxnState::Failed);
                    tracing::debug!(
                        attempt = attempts,
                        status = ?AttemptStatus::OtherError,
                        error = %err,
                        "transaction failed"
                    );
                    return Err(err);
                }
            }
        }
    }

    async fn attempt<T, F, Fut>(
        &self,
        work: &mut F,
        attempt: u32,
        seqno: &Arc<AtomicU64>,
        state: &mut StateTracker,
    ) -> Result<(T, CommitResult), TransactionError>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T, TransactionError>>,
    {
        let id = self
            .executor
            .begin()
            .await
            .map_err(TransactionError::from_executor)?;
        let transaction = Transaction::new(id, attempt, self.executor.clone(), seqno.clone());
        state.advance(TxnState::Executing);

        let value = match work(transaction.clone()).await {
            Ok(value) => match transaction.take_abort() {
                // The statement abort was swallowed; the transaction is dead anyway.
                Some(aborted) => Err(aborted),
                None => Ok(value),
            },
            Err(err) => Err(err.normalize()),
        };
        let value = match value {
            Ok(value) => value,
            Err(err) => {
                if !err.is_aborted() {
                    self.rollback(&transaction).await;
                }
                return Err(err);
            }
        };

        state.advance(TxnState::Committing);
        match self
            .executor
            .commit(transaction.id(), transaction.take_mutations())
            .await
        {
            Ok(commit) => Ok((value, commit)),
            Err(err) => {
                let err = TransactionError::from_executor(err);
                if !err.is_aborted() {
                    self.rollback(&transaction).await;
                }
                Err(err)
            }
        }
    }

    async fn rollback(&self, transaction: &Transaction) {
        if let Err(err) = self.executor.rollback(transaction.id()).await {
            tracing::warn!(
                transaction = %transaction.id(),
                error = %err,
                "transaction rollback failed"
            );
        }
    }
}
