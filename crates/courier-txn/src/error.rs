// Transaction error taxonomy.
use crate::executor::ExecutorError;
use crate::retry::RetryHint;

#[derive(thiserror::Error, Debug)]
pub enum TransactionError {
    /// Conflict reported by the backend; the runner retries these.
    #[error("transaction aborted: {message}")]
    Aborted { message: String, hint: RetryHint },
    #[error(transparent)]
    Other(ExecutorError),
    #[error("transaction work failed: {0:#}")]
    Work(anyhow::Error),
    #[error("batch update failed after {} statements: {source}", .row_counts.len())]
    BatchUpdate {
        row_counts: Vec<i64>,
        source: ExecutorError,
    },
    #[error("batch update requires at least one statement")]
    EmptyBatch,
    #[error("transaction deadline exceeded after {attempts} attempts")]
    DeadlineExceeded {
        attempts: u32,
        last_error: Option<Box<TransactionError>>,
    },
}

impl TransactionError {
    /// Classify an executor failure as retryable abort or fatal error.
    pub fn from_executor(err: ExecutorError) -> Self {
        if err.is_aborted() {
            Self::Aborted {
                hint: RetryHint::from_metadata(&err.metadata),
                message: err.message,
            }
        } else {
            Self::Other(err)
        }
    }

    pub fn aborted(message: impl Into<String>, hint: RetryHint) -> Self {
        Self::Aborted {
            message: message.into(),
            hint,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    pub fn retry_hint(&self) -> RetryHint {
        match self {
            Self::Aborted { hint, .. } => *hint,
            _ => RetryHint::None,
        }
    }

    /// Unwrap an abort hidden inside user `Work` errors so it is retried.
    pub(crate) fn normalize(self) -> Self {
        let err = match self {
            Self::Work(err) => err,
            other => return other,
        };
        if let Some(TransactionError::Aborted { message, hint }) = err.downcast_ref::<TransactionError>() {
            return Self::aborted(message.clone(), *hint);
        }
        if let Some(executor) = err.downcast_ref::<ExecutorError>()
            && executor.is_aborted()
        {
            return Self::from_executor(executor.clone());
        }
        Self::Work(err)
    }
}

impl From<anyhow::Error> for TransactionError {
    fn from(err: anyhow::Error) -> Self {
        Self::Work(err)
    }
}
