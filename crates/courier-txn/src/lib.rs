// Optimistic transaction runner with abort retries and server-hinted backoff.
//
// A run begins a transaction, hands it to user work, and commits the buffered
// mutations. An "aborted" outcome from any step (begin, a statement, the work
// itself, or commit) sends the run back to the start after a delay: the
// server's retry hint when one is attached, otherwise a geometric backoff.
// Any other error rolls back and ends the run. The deadline is only checked
// between attempts.
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod retry;
pub mod runner;
pub mod state;
pub mod transaction;

pub use clock::{Clock, TokioClock};
pub use config::RetryConfig;
pub use error::TransactionError;
pub use executor::{
    BatchDmlResult, CommitResult, ExecutorError, Mutation, ResultSet, Row, Statement, StatusCode,
    TransactionExecutor, TransactionId,
};
pub use retry::{RetryHint, backoff_delay};
pub use runner::{Committed, TransactionRunner};
pub use state::{AttemptStatus, TxnState};
pub use transaction::Transaction;
