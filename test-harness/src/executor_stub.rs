// Scripted transaction executor that records every call.
use async_trait::async_trait;
use courier_txn::{
    BatchDmlResult, CommitResult, ExecutorError, Mutation, ResultSet, Statement,
    TransactionExecutor, TransactionId,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorCall {
    Begin(TransactionId),
    ExecuteSql {
        transaction: TransactionId,
        sql: String,
        seqno: u64,
    },
    BatchDml {
        transaction: TransactionId,
        statements: Vec<String>,
        seqno: u64,
    },
    Commit {
        transaction: TransactionId,
        mutations: Vec<Mutation>,
    },
    Rollback(TransactionId),
}

#[derive(Default)]
struct ScriptState {
    next_transaction: u64,
    begin_failures: VecDeque<ExecutorError>,
    sql_failures: VecDeque<ExecutorError>,
    commit_failures: VecDeque<ExecutorError>,
    // Returned by every commit once the queued failures run out.
    persistent_commit_failure: Option<ExecutorError>,
    rollback_failure: Option<ExecutorError>,
    results: HashMap<String, ResultSet>,
    batch_results: VecDeque<BatchDmlResult>,
    calls: Vec<ExecutorCall>,
}

/// Executor whose failures are queued up front by the test.
#[derive(Default)]
pub struct ScriptedExecutor {
    state: Mutex<ScriptState>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_begin(&self, err: ExecutorError) {
        self.state.lock().begin_failures.push_back(err);
    }

    pub fn fail_next_sql(&self, err: ExecutorError) {
        self.state.lock().sql_failures.push_back(err);
    }

    pub fn fail_next_commit(&self, err: ExecutorError) {
        self.state.lock().commit_failures.push_back(err);
    }

    pub fn fail_every_commit(&self, err: ExecutorError) {
        self.state.lock().persistent_commit_failure = Some(err);
    }

    pub fn fail_rollbacks(&self, err: ExecutorError) {
        self.state.lock().rollback_failure = Some(err);
    }

    /// Result for statements with exactly this SQL. Unknown SQL returns no
    /// rows and a row count of 1.
    pub fn set_result(&self, sql: impl Into<String>, result: ResultSet) {
        self.state.lock().results.insert(sql.into(), result);
    }

    pub fn push_batch_result(&self, result: BatchDmlResult) {
        self.state.lock().batch_results.push_back(result);
    }

    pub fn calls(&self) -> Vec<ExecutorCall> {
        self.state.lock().calls.clone()
    }

    pub fn begin_count(&self) -> usize {
        self.count(|call| matches!(call, ExecutorCall::Begin(_)))
    }

    pub fn rollback_count(&self) -> usize {
        self.count(|call| matches!(call, ExecutorCall::Rollback(_)))
    }

    pub fn commits(&self) -> Vec<(TransactionId, Vec<Mutation>)> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                ExecutorCall::Commit {
                    transaction,
                    mutations,
                } => Some((transaction.clone(), mutations.clone())),
                _ => None,
            })
            .collect()
    }

    /// Sequence numbers of every statement call, in order.
    pub fn seqnos(&self) -> Vec<u64> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                ExecutorCall::ExecuteSql { seqno, .. } | ExecutorCall::BatchDml { seqno, .. } => {
                    Some(*seqno)
                }
                _ => None,
            })
            .collect()
    }

    fn count(&self, predicate: impl Fn(&ExecutorCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|call| predicate(call)).count()
    }
}

#[async_trait]
impl TransactionExecutor for ScriptedExecutor {
    async fn begin(&self) -> Result<TransactionId, ExecutorError> {
        let mut state = self.state.lock();
        if let Some(err) = state.begin_failures.pop_front() {
            return Err(err);
        }
        state.next_transaction += 1;
        let id = TransactionId::new(format!("tx-{}", state.next_transaction));
        state.calls.push(ExecutorCall::Begin(id.clone()));
        Ok(id)
    }

    async fn execute_sql(
        &self,
        transaction: &TransactionId,
        statement: &Statement,
        seqno: u64,
    ) -> Result<ResultSet, ExecutorError> {
        let mut state = self.state.lock();
        state.calls.push(ExecutorCall::ExecuteSql {
            transaction: transaction.clone(),
            sql: statement.sql.clone(),
            seqno,
        });
        if let Some(err) = state.sql_failures.pop_front() {
            return Err(err);
        }
        Ok(state
            .results
            .get(&statement.sql)
            .cloned()
            .unwrap_or(ResultSet {
                rows: Vec::new(),
                row_count: Some(1),
            }))
    }

    async fn execute_batch_dml(
        &self,
        transaction: &TransactionId,
        statements: &[Statement],
        seqno: u64,
    ) -> Result<BatchDmlResult, ExecutorError> {
        let mut state = self.state.lock();
        state.calls.push(ExecutorCall::BatchDml {
            transaction: transaction.clone(),
            statements: statements.iter().map(|s| s.sql.clone()).collect(),
            seqno,
        });
        Ok(state.batch_results.pop_front().unwrap_or(BatchDmlResult {
            row_counts: vec![1; statements.len()],
            status: None,
        }))
    }

    async fn commit(
        &self,
        transaction: &TransactionId,
        mutations: Vec<Mutation>,
    ) -> Result<CommitResult, ExecutorError> {
        let mut state = self.state.lock();
        state.calls.push(ExecutorCall::Commit {
            transaction: transaction.clone(),
            mutations,
        });
        if let Some(err) = state.commit_failures.pop_front() {
            tracing::debug!(%transaction, error = %err, "scripted commit failure");
            return Err(err);
        }
        if let Some(err) = state.persistent_commit_failure.clone() {
            return Err(err);
        }
        Ok(CommitResult {
            commit_timestamp: SystemTime::UNIX_EPOCH + Duration::from_secs(state.next_transaction),
        })
    }

    async fn rollback(&self, transaction: &TransactionId) -> Result<(), ExecutorError> {
        let mut state = self.state.lock();
        state.calls.push(ExecutorCall::Rollback(transaction.clone()));
        match state.rollback_failure.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
