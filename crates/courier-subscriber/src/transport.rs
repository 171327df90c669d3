// Collaborator seams for the RPC layer.
use async_trait::async_trait;
use courier_common::{AckId, StreamingPullRequest, StreamingPullResponse, SubscriptionPath};
use futures::stream::BoxStream;

use crate::error::TransportError;

/// Lazy, non-restartable sequence of response batches from one open stream.
///
/// Ends with `None` when the peer closes cleanly; an `Err` item ends the
/// stream with a failure.
pub type PullStream = BoxStream<'static, Result<StreamingPullResponse, TransportError>>;

#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Open a new pull stream, sending `request` as its first message.
    async fn open(&self, request: StreamingPullRequest) -> Result<PullStream, TransportError>;
}

/// Batched, fire-and-forget ack/lease calls.
#[async_trait]
pub trait AckTransport: Send + Sync {
    async fn acknowledge(
        &self,
        subscription: &SubscriptionPath,
        ack_ids: &[AckId],
    ) -> Result<(), TransportError>;

    /// `seconds == 0` releases the messages for immediate redelivery.
    async fn modify_ack_deadline(
        &self,
        subscription: &SubscriptionPath,
        ack_ids: &[AckId],
        seconds: u32,
    ) -> Result<(), TransportError>;
}
