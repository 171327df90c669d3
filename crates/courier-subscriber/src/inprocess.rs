// In-memory message source implementing both transports.
use async_trait::async_trait;
use bytes::Bytes;
use courier_common::{
    AckId, Message, PulledMessage, StreamingPullRequest, StreamingPullResponse, SubscriptionPath,
};
use futures::stream;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::TransportError;
use crate::transport::{AckTransport, PullStream, StreamTransport};

pub const DEFAULT_MAX_BATCH: usize = 100;

/// Source with at-least-once semantics that lives in this process.
///
/// Every delivery gets a fresh ack id and a lease; unacked messages are
/// redelivered once their lease lapses or they are nacked.
///
/// ```
/// use bytes::Bytes;
/// use courier_subscriber::InProcessSource;
///
/// let source = InProcessSource::new();
/// let id = source.publish(Bytes::from_static(b"hello"));
/// assert_eq!(id, "m-1");
/// assert_eq!(source.pending_count(), 1);
/// ```
#[derive(Clone)]
pub struct InProcessSource {
    inner: Arc<SourceInner>,
}

struct SourceInner {
    state: Mutex<SourceState>,
    changed: Notify,
    max_batch: usize,
}

#[derive(Default)]
struct SourceState {
    next_message: u64,
    next_ack: u64,
    ready: VecDeque<Message>,
    leased: HashMap<AckId, Lease>,
    acked: usize,
    // Bumped by close_streams; streams from older generations end.
    generation: u64,
}

struct Lease {
    message: Message,
    expires_at: Instant,
}

impl SourceState {
    fn expire(&mut self, now: Instant) {
        let expired: Vec<AckId> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(ack_id, _)| ack_id.clone())
            .collect();
        for ack_id in expired {
            if let Some(lease) = self.leased.remove(&ack_id) {
                self.ready.push_back(lease.message);
            }
        }
    }

    fn lease_batch(&mut self, max_batch: usize, deadline: Duration, now: Instant) -> Vec<PulledMessage> {
        let take = self.ready.len().min(max_batch);
        let mut batch = Vec::with_capacity(take);
        for message in self.ready.drain(..take) {
            self.next_ack += 1;
            let Ok(ack_id) = AckId::new(format!("ack-{}", self.next_ack)) else {
                continue;
            };
            self.leased.insert(
                ack_id.clone(),
                Lease {
                    message: message.clone(),
                    expires_at: now + deadline,
                },
            );
            batch.push(PulledMessage { ack_id, message });
        }
        batch
    }
}

impl Default for InProcessSource {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessSource {
    pub fn new() -> Self {
        Self::with_max_batch(DEFAULT_MAX_BATCH)
    }

    pub fn with_max_batch(max_batch: usize) -> Self {
        Self {
            inner: Arc::new(SourceInner {
                state: Mutex::new(SourceState::default()),
                changed: Notify::new(),
                max_batch: max_batch.max(1),
            }),
        }
    }

    /// Enqueue a payload and return its assigned message id.
    pub fn publish(&self, data: Bytes) -> String {
        self.publish_with_attributes(data, BTreeMap::new())
    }

    pub fn publish_with_attributes(&self, data: Bytes, attributes: BTreeMap<String, String>) -> String {
        let message_id = {
            let mut state = self.inner.state.lock();
            state.next_message += 1;
            let message_id = format!("m-{}", state.next_message);
            let message = Message::new(message_id.clone(), data)
                .with_attributes(attributes)
                .with_publish_time(SystemTime::now());
            state.ready.push_back(message);
            message_id
        };
        self.inner.changed.notify_waiters();
        message_id
    }

    /// End every currently open stream cleanly.
    pub fn close_streams(&self) {
        self.inner.state.lock().generation += 1;
        self.inner.changed.notify_waiters();
    }

    pub fn acked_count(&self) -> usize {
        self.inner.state.lock().acked
    }

    /// Messages published but not yet acked, leased or not.
    pub fn pending_count(&self) -> usize {
        let state = self.inner.state.lock();
        state.ready.len() + state.leased.len()
    }

    pub fn leased_count(&self) -> usize {
        self.inner.state.lock().leased.len()
    }
}

#[async_trait]
impl StreamTransport for InProcessSource {
    async fn open(&self, request: StreamingPullRequest) -> Result<PullStream, TransportError> {
        let inner = self.inner.clone();
        let generation = inner.state.lock().generation;
        let deadline = Duration::from_secs(u64::from(request.stream_ack_deadline_seconds));
        tracing::debug!(subscription = %request.subscription, "in-process stream opened");

        let pulls = stream::unfold(inner, move |inner| async move {
            loop {
                let waker = inner.clone();
                let changed = waker.changed.notified();
                tokio::pin!(changed);
                changed.as_mut().enable();

                let next_expiry = {
                    let mut state = inner.state.lock();
                    if state.generation != generation {
                        return None;
                    }
                    let now = Instant::now();
                    state.expire(now);
                    if !state.ready.is_empty() {
                        let batch = state.lease_batch(inner.max_batch, deadline, now);
                        drop(state);
                        return Some((Ok(StreamingPullResponse::new(batch)), inner));
                    }
                    state.leased.values().map(|lease| lease.expires_at).min()
                };
                match next_expiry {
                    Some(at) => {
                        tokio::select! {
                            _ = &mut changed => {}
                            _ = tokio::time::sleep_until(at) => {}
                        }
                    }
                    None => changed.await,
                }
            }
        });
        Ok(Box::pin(pulls))
    }
}

#[async_trait]
impl AckTransport for InProcessSource {
    async fn acknowledge(
        &self,
        _subscription: &SubscriptionPath,
        ack_ids: &[AckId],
    ) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock();
        for ack_id in ack_ids {
            // Acks for lapsed leases are ignored; the message was redelivered.
            if state.leased.remove(ack_id).is_some() {
                state.acked += 1;
            }
        }
        Ok(())
    }

    async fn modify_ack_deadline(
        &self,
        _subscription: &SubscriptionPath,
        ack_ids: &[AckId],
        seconds: u32,
    ) -> Result<(), TransportError> {
        let released = {
            let mut state = self.inner.state.lock();
            let now = Instant::now();
            let mut released = false;
            for ack_id in ack_ids {
                if seconds == 0 {
                    if let Some(lease) = state.leased.remove(ack_id) {
                        state.ready.push_front(lease.message);
                        released = true;
                    }
                } else if let Some(lease) = state.leased.get_mut(ack_id) {
                    lease.expires_at = now + Duration::from_secs(u64::from(seconds));
                }
            }
            released
        };
        if released {
            self.inner.changed.notify_waiters();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn request(deadline: u32) -> StreamingPullRequest {
        StreamingPullRequest {
            subscription: SubscriptionPath::new("projects/p/subscriptions/s").expect("path"),
            stream_ack_deadline_seconds: deadline,
        }
    }

    #[tokio::test]
    async fn delivers_published_messages_with_fresh_ack_ids() {
        let source = InProcessSource::with_max_batch(2);
        for payload in ["a", "b", "c"] {
            source.publish(Bytes::from(payload));
        }
        let mut pulls = source.open(request(60)).await.expect("open");
        let first = pulls.next().await.expect("batch").expect("ok");
        let second = pulls.next().await.expect("batch").expect("ok");
        assert_eq!(first.received_messages.len(), 2);
        assert_eq!(second.received_messages.len(), 1);
        assert_eq!(first.received_messages[0].ack_id.as_str(), "ack-1");
        assert_eq!(second.received_messages[0].message.message_id(), "m-3");
        assert_eq!(source.leased_count(), 3);
    }

    #[tokio::test]
    async fn ack_retires_and_nack_redelivers() {
        let source = InProcessSource::new();
        source.publish(Bytes::from_static(b"a"));
        source.publish(Bytes::from_static(b"b"));
        let subscription = request(60).subscription;
        let mut pulls = source.open(request(60)).await.expect("open");
        let batch = pulls.next().await.expect("batch").expect("ok");
        let ids: Vec<AckId> = batch.received_messages.iter().map(|m| m.ack_id.clone()).collect();

        source
            .acknowledge(&subscription, &ids[..1])
            .await
            .expect("ack");
        source
            .modify_ack_deadline(&subscription, &ids[1..], 0)
            .await
            .expect("nack");
        assert_eq!(source.acked_count(), 1);

        let redelivered = pulls.next().await.expect("batch").expect("ok");
        assert_eq!(redelivered.received_messages.len(), 1);
        assert_eq!(redelivered.received_messages[0].message.message_id(), "m-2");
        assert_ne!(redelivered.received_messages[0].ack_id, ids[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn lapsed_lease_is_redelivered() {
        let source = InProcessSource::new();
        source.publish(Bytes::from_static(b"a"));
        let mut pulls = source.open(request(10)).await.expect("open");
        let first = pulls.next().await.expect("batch").expect("ok");
        let again = pulls.next().await.expect("batch").expect("ok");
        assert_eq!(
            first.received_messages[0].message.message_id(),
            again.received_messages[0].message.message_id()
        );
        assert_eq!(again.received_messages[0].ack_id.as_str(), "ack-2");
    }

    #[tokio::test]
    async fn close_streams_ends_open_streams() {
        let source = InProcessSource::new();
        let mut pulls = source.open(request(60)).await.expect("open");
        source.close_streams();
        assert!(pulls.next().await.is_none());
        source.publish(Bytes::from_static(b"a"));
        let mut reopened = source.open(request(60)).await.expect("open");
        assert!(reopened.next().await.is_some());
    }
}
