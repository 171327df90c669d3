// Handle for one attempt: statements go to the executor, mutations are buffered.
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::TransactionError;
use crate::executor::{
    ExecutorError, Mutation, ResultSet, Row, Statement, StatusCode, TransactionExecutor,
    TransactionId,
};

/// The transaction passed to `work`.
///
/// Cheap to clone; clones share the same attempt. Every statement takes the
/// next sequence number from a counter that spans all attempts of a run.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<AttemptInner>,
}

struct AttemptInner {
    id: TransactionId,
    attempt: u32,
    executor: Arc<dyn TransactionExecutor>,
    seqno: Arc<AtomicU64>,
    mutations: Mutex<Vec<Mutation>>,
    // First abort seen by a statement, even if `work` swallowed it.
    aborted: Mutex<Option<TransactionError>>,
}

impl Transaction {
    pub(crate) fn new(
        id: TransactionId,
        attempt: u32,
        executor: Arc<dyn TransactionExecutor>,
        seqno: Arc<AtomicU64>,
    ) -> Self {
        Self {
            inner: Arc::new(AttemptInner {
                id,
                attempt,
                executor,
                seqno,
                mutations: Mutex::new(Vec::new()),
                aborted: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &TransactionId {
        &self.inner.id
    }

    /// 1-based attempt number within the run.
    pub fn attempt(&self) -> u32 {
        self.inner.attempt
    }

    fn next_seqno(&self) -> u64 {
        self.inner.seqno.fetch_add(1, Ordering::SeqCst)
    }

    fn classify(&self, err: ExecutorError) -> TransactionError {
        let err = TransactionError::from_executor(err);
        if let TransactionError::Aborted { message, hint } = &err {
            let mut aborted = self.inner.aborted.lock();
            if aborted.is_none() {
                *aborted = Some(TransactionError::aborted(message.clone(), *hint));
            }
        }
        err
    }

    pub async fn execute_query(
        &self,
        statement: impl Into<Statement>,
    ) -> Result<ResultSet, TransactionError> {
        let statement = statement.into();
        let seqno = self.next_seqno();
        tracing::trace!(transaction = %self.inner.id, seqno, sql = %statement.sql, "execute sql");
        self.inner
            .executor
            .execute_sql(&self.inner.id, &statement, seqno)
            .await
            .map_err(|err| self.classify(err))
    }

    /// Run a DML statement and return the number of modified rows.
    pub async fn execute_update(&self, statement: impl Into<Statement>) -> Result<i64, TransactionError> {
        let result = self.execute_query(statement).await?;
        result.row_count.ok_or_else(|| {
            TransactionError::Other(ExecutorError::new(
                StatusCode::FailedPrecondition,
                "statement did not return an exact row count",
            ))
        })
    }

    /// Run DML statements in order; returns one row count per statement.
    pub async fn batch_update(&self, statements: Vec<Statement>) -> Result<Vec<i64>, TransactionError> {
        if statements.is_empty() {
            return Err(TransactionError::EmptyBatch);
        }
        let seqno = self.next_seqno();
        tracing::trace!(
            transaction = %self.inner.id,
            seqno,
            statements = statements.len(),
            "execute batch dml"
        );
        let result = self
            .inner
            .executor
            .execute_batch_dml(&self.inner.id, &statements, seqno)
            .await
            .map_err(|err| self.classify(err))?;
        match result.status {
            None => Ok(result.row_counts),
            Some(status) if status.is_aborted() => Err(self.classify(status)),
            Some(status) => Err(TransactionError::BatchUpdate {
                row_counts: result.row_counts,
                source: status,
            }),
        }
    }

    pub fn insert(&self, table: impl Into<String>, rows: Vec<Row>) {
        self.buffer(Mutation::Insert {
            table: table.into(),
            rows,
        });
    }

    pub fn update(&self, table: impl Into<String>, rows: Vec<Row>) {
        self.buffer(Mutation::Update {
            table: table.into(),
            rows,
        });
    }

    pub fn insert_or_update(&self, table: impl Into<String>, rows: Vec<Row>) {
        self.buffer(Mutation::InsertOrUpdate {
            table: table.into(),
            rows,
        });
    }

    pub fn replace(&self, table: impl Into<String>, rows: Vec<Row>) {
        self.buffer(Mutation::Replace {
            table: table.into(),
            rows,
        });
    }

    pub fn delete(&self, table: impl Into<String>, keys: Vec<serde_json::Value>) {
        self.buffer(Mutation::Delete {
            table: table.into(),
            keys,
        });
    }

    fn buffer(&self, mutation: Mutation) {
        self.inner.mutations.lock().push(mutation);
    }

    pub fn pending_mutations(&self) -> usize {
        self.inner.mutations.lock().len()
    }

    pub(crate) fn take_mutations(&self) -> Vec<Mutation> {
        std::mem::take(&mut *self.inner.mutations.lock())
    }

    pub(crate) fn take_abort(&self) -> Option<TransactionError> {
        self.inner.aborted.lock().take()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("attempt", &self.inner.attempt)
            .field("pending_mutations", &self.pending_mutations())
            .finish()
    }
}
