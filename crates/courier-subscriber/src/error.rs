// Subscriber error taxonomy.
use std::fmt;

/// Status class reported by the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    Unavailable,
    Internal,
    DeadlineExceeded,
    ResourceExhausted,
    Aborted,
    Unknown,
    Cancelled,
    NotFound,
    PermissionDenied,
    InvalidArgument,
    Unauthenticated,
}

impl TransportErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Unavailable
                | Self::Internal
                | Self::DeadlineExceeded
                | Self::ResourceExhausted
                | Self::Aborted
                | Self::Unknown
        )
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
            Self::DeadlineExceeded => "deadline exceeded",
            Self::ResourceExhausted => "resource exhausted",
            Self::Aborted => "aborted",
            Self::Unknown => "unknown",
            Self::Cancelled => "cancelled",
            Self::NotFound => "not found",
            Self::PermissionDenied => "permission denied",
            Self::InvalidArgument => "invalid argument",
            Self::Unauthenticated => "unauthenticated",
        };
        f.write_str(name)
    }
}

/// Error surfaced by a `StreamTransport` or `AckTransport`.
///
/// ```
/// use courier_subscriber::{TransportError, TransportErrorKind};
///
/// let err = TransportError::new(TransportErrorKind::Unavailable, "connection reset");
/// assert!(err.is_retryable());
/// assert_eq!(err.to_string(), "unavailable: connection reset");
/// ```
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Unavailable, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SubscriberError {
    /// A stream failed and will be reopened; never surfaced to callers.
    #[error("stream {stream_index} interrupted: {source}")]
    TransientStream {
        stream_index: usize,
        source: TransportError,
    },
    #[error("stream {stream_index} failed after {attempts} reconnect attempts: {source}")]
    PermanentStream {
        stream_index: usize,
        attempts: u32,
        source: TransportError,
    },
    /// Ack or modack send failed; entries stay queued for the next flush.
    #[error("failed to deliver {count} ack dispositions: {source}")]
    AckDelivery { count: usize, source: TransportError },
    #[error("invalid subscriber config: {0}")]
    Config(String),
    #[error("blocking flush requires a tokio runtime context")]
    NoRuntime,
}
