// Handle passed to the user callback for one received message.
use bytes::Bytes;
use courier_common::{AckId, Message};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use crate::buffer::{Disposition, FlushStats};
use crate::error::SubscriberError;
use crate::lease::LeaseContext;

/// A delivered message plus the means to settle it.
///
/// `ack` and `nack` are terminal: only the first call on a handle has any
/// effect. Settlement is buffered and sent by the flusher.
pub struct ReceivedMessage {
    ack_id: AckId,
    message: Message,
    size: usize,
    stream_index: usize,
    lease: Arc<LeaseContext>,
    settled: AtomicBool,
}

impl ReceivedMessage {
    pub(crate) fn new(
        ack_id: AckId,
        message: Message,
        size: usize,
        stream_index: usize,
        lease: Arc<LeaseContext>,
    ) -> Self {
        Self {
            ack_id,
            message,
            size,
            stream_index,
            lease,
            settled: AtomicBool::new(false),
        }
    }

    pub fn ack(&self) {
        self.settle(Disposition::Ack);
    }

    /// Release the message for immediate redelivery.
    pub fn nack(&self) {
        self.settle(Disposition::ModifyDeadline(0));
    }

    /// Extend the lease by `seconds`; `0` is equivalent to [`Self::nack`].
    pub fn modify_ack_deadline(&self, seconds: u32) {
        if seconds == 0 {
            self.nack();
            return;
        }
        if self.is_settled() {
            tracing::debug!(ack_id = %self.ack_id, "ignoring extension of settled message");
            return;
        }
        self.lease.extend(&self.ack_id, seconds);
    }

    fn settle(&self, disposition: Disposition) {
        if self.settled.swap(true, Ordering::AcqRel) {
            tracing::debug!(ack_id = %self.ack_id, ?disposition, "message already settled");
            return;
        }
        self.lease.dispose(&self.ack_id, disposition);
    }

    /// Send every queued disposition of this subscriber now, from the
    /// callback thread.
    pub fn flush_blocking(&self) -> Result<FlushStats, SubscriberError> {
        self.lease.buffer().flush_blocking()
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    pub fn ack_id(&self) -> &AckId {
        &self.ack_id
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn data(&self) -> &Bytes {
        self.message.data()
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        self.message.attributes()
    }

    pub fn message_id(&self) -> &str {
        self.message.message_id()
    }

    pub fn publish_time(&self) -> SystemTime {
        self.message.publish_time()
    }

    /// Bytes charged against flow control.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn stream_index(&self) -> usize {
        self.stream_index
    }

    pub(crate) fn abandon(&self) {
        if !self.settled.swap(true, Ordering::AcqRel) {
            self.lease.abandon(&self.ack_id);
        }
    }
}

impl fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("ack_id", &self.ack_id)
            .field("message_id", &self.message.message_id())
            .field("size", &self.size)
            .field("stream_index", &self.stream_index)
            .field("settled", &self.is_settled())
            .finish()
    }
}
