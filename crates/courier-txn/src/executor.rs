// Backend seam for transactional statements and commits.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

pub type Row = BTreeMap<String, serde_json::Value>;

/// Status class of a failed executor call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Aborted,
    Unavailable,
    DeadlineExceeded,
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    PermissionDenied,
    Internal,
    Unknown,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Aborted => "aborted",
            Self::Unavailable => "unavailable",
            Self::DeadlineExceeded => "deadline exceeded",
            Self::InvalidArgument => "invalid argument",
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::FailedPrecondition => "failed precondition",
            Self::PermissionDenied => "permission denied",
            Self::Internal => "internal",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Error returned by a [`TransactionExecutor`] call.
///
/// `metadata` carries loosely typed trailing details, such as a server
/// retry delay on an aborted commit.
///
/// ```
/// use courier_txn::ExecutorError;
/// use serde_json::json;
///
/// let err = ExecutorError::aborted("conflict").with_metadata(json!({"retryDelay": {"seconds": 2}}));
/// assert!(err.is_aborted());
/// assert_eq!(err.to_string(), "aborted: conflict");
/// ```
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{code}: {message}")]
pub struct ExecutorError {
    pub code: StatusCode,
    pub message: String,
    pub metadata: serde_json::Value,
}

impl ExecutorError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Aborted, message)
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_aborted(&self) -> bool {
        self.code == StatusCode::Aborted
    }
}

/// Identifier assigned by [`TransactionExecutor::begin`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Arc<str>);

impl TransactionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Self::new(sql)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub rows: Vec<Row>,
    /// Exact count of modified rows, present for DML.
    pub row_count: Option<i64>,
}

/// Outcome of a batch DML call.
///
/// Statements run in order and stop at the first failure: `row_counts` has
/// one entry per successful statement and `status` holds the failure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchDmlResult {
    pub row_counts: Vec<i64>,
    pub status: Option<ExecutorError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    pub commit_timestamp: SystemTime,
}

/// Write buffered by a transaction and applied atomically at commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    Insert { table: String, rows: Vec<Row> },
    Update { table: String, rows: Vec<Row> },
    InsertOrUpdate { table: String, rows: Vec<Row> },
    Replace { table: String, rows: Vec<Row> },
    Delete { table: String, keys: Vec<serde_json::Value> },
}

impl Mutation {
    pub fn table(&self) -> &str {
        match self {
            Self::Insert { table, .. }
            | Self::Update { table, .. }
            | Self::InsertOrUpdate { table, .. }
            | Self::Replace { table, .. }
            | Self::Delete { table, .. } => table,
        }
    }
}

#[async_trait]
pub trait TransactionExecutor: Send + Sync {
    async fn begin(&self) -> Result<TransactionId, ExecutorError>;

    /// Run one statement. `seqno` orders idempotency-sensitive requests
    /// across every attempt of a run.
    async fn execute_sql(
        &self,
        transaction: &TransactionId,
        statement: &Statement,
        seqno: u64,
    ) -> Result<ResultSet, ExecutorError>;

    async fn execute_batch_dml(
        &self,
        transaction: &TransactionId,
        statements: &[Statement],
        seqno: u64,
    ) -> Result<BatchDmlResult, ExecutorError>;

    async fn commit(
        &self,
        transaction: &TransactionId,
        mutations: Vec<Mutation>,
    ) -> Result<CommitResult, ExecutorError>;

    async fn rollback(&self, transaction: &TransactionId) -> Result<(), ExecutorError>;
}
