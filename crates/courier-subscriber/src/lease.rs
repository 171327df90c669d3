// Lease registry for received-but-undisposed messages, plus the renewal task.
use courier_common::AckId;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;

use crate::buffer::{AckBuffer, Disposition};
use crate::config::RENEWAL_FRACTION;
use crate::flow::FlowController;
use crate::shutdown::stopped;

#[derive(Debug, Clone, Copy)]
pub(crate) struct LeaseEntry {
    pub(crate) received_at: Instant,
    pub(crate) last_extended_at: Instant,
    /// Seconds granted by the most recent extension.
    pub(crate) granted_secs: u32,
    pub(crate) stream_index: usize,
    pub(crate) bytes: usize,
}

impl LeaseEntry {
    /// When this lease must be extended again to not lapse.
    pub(crate) fn renew_at(&self) -> Instant {
        self.last_extended_at
            + Duration::from_secs(u64::from(self.granted_secs)).mul_f64(RENEWAL_FRACTION)
    }
}

/// Registry plus the buffer and flow state it must stay consistent with.
///
/// Lock order is always registry, then buffer. Because a disposal removes the
/// entry and queues its disposition under the registry lock, the renewal scan
/// can never queue an extension for an id that was already acked.
pub(crate) struct LeaseContext {
    registry: Mutex<HashMap<AckId, LeaseEntry>>,
    buffer: Arc<AckBuffer>,
    flow: Arc<FlowController>,
    deadline_secs: u32,
    // Wakes the renewal task when a lease is shortened.
    rescheduled: Notify,
}

impl LeaseContext {
    pub(crate) fn new(buffer: Arc<AckBuffer>, flow: Arc<FlowController>, deadline_secs: u32) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            buffer,
            flow,
            deadline_secs,
            rescheduled: Notify::new(),
        }
    }

    pub(crate) fn buffer(&self) -> &Arc<AckBuffer> {
        &self.buffer
    }

    pub(crate) fn len(&self) -> usize {
        self.registry.lock().len()
    }

    pub(crate) fn contains(&self, ack_id: &AckId) -> bool {
        self.registry.lock().contains_key(ack_id)
    }

    /// Track a newly received message and queue its receipt extension.
    ///
    /// Returns `false` when the ack id is already leased; the caller owns the
    /// extra flow reservation in that case.
    pub(crate) fn register(&self, ack_id: &AckId, stream_index: usize, bytes: usize) -> bool {
        let now = Instant::now();
        let mut registry = self.registry.lock();
        if registry.contains_key(ack_id) {
            return false;
        }
        registry.insert(
            ack_id.clone(),
            LeaseEntry {
                received_at: now,
                last_extended_at: now,
                granted_secs: self.deadline_secs,
                stream_index,
                bytes,
            },
        );
        self.buffer
            .push(ack_id.clone(), Disposition::ModifyDeadline(self.deadline_secs));
        true
    }

    /// Retire a lease with a terminal disposition and return its flow reservation.
    pub(crate) fn dispose(&self, ack_id: &AckId, disposition: Disposition) {
        let released = {
            let mut registry = self.registry.lock();
            let entry = registry.remove(ack_id);
            self.buffer.push(ack_id.clone(), disposition);
            entry
        };
        if let Some(entry) = released {
            tracing::trace!(
                ack_id = %ack_id,
                stream_index = entry.stream_index,
                held_ms = entry.received_at.elapsed().as_millis() as u64,
                "lease disposed"
            );
            self.flow.release(entry.bytes);
        }
    }

    /// Extend a live lease without disposing it. `0` behaves like a nack.
    pub(crate) fn extend(&self, ack_id: &AckId, seconds: u32) {
        if seconds == 0 {
            self.dispose(ack_id, Disposition::ModifyDeadline(0));
            return;
        }
        let shortened = {
            let mut registry = self.registry.lock();
            let Some(entry) = registry.get_mut(ack_id) else {
                return;
            };
            let shortened = seconds < entry.granted_secs;
            entry.last_extended_at = Instant::now();
            entry.granted_secs = seconds;
            self.buffer
                .push(ack_id.clone(), Disposition::ModifyDeadline(seconds));
            shortened
        };
        if shortened {
            self.rescheduled.notify_one();
        }
    }

    /// Forget a lease; the source redelivers it once the lease lapses.
    ///
    /// A receipt extension that has not been sent yet is dropped as well, so
    /// it cannot push the redelivery back.
    pub(crate) fn abandon(&self, ack_id: &AckId) {
        let released = {
            let mut registry = self.registry.lock();
            let released = registry.remove(ack_id);
            if released.is_some() {
                self.buffer
                    .remove_if(ack_id, Disposition::ModifyDeadline(self.deadline_secs));
            }
            released
        };
        if let Some(entry) = released {
            self.flow.release(entry.bytes);
        }
    }

    /// Re-extend, by its own granted seconds, every lease whose renewal time
    /// has come.
    pub(crate) fn renew_due(&self, now: Instant) -> usize {
        let mut registry = self.registry.lock();
        let mut due: BTreeMap<u32, Vec<AckId>> = BTreeMap::new();
        for (ack_id, entry) in registry.iter_mut() {
            if entry.renew_at() <= now {
                entry.last_extended_at = now;
                due.entry(entry.granted_secs).or_default().push(ack_id.clone());
            }
        }
        let mut count = 0;
        for (seconds, ack_ids) in due {
            count += ack_ids.len();
            self.buffer
                .push_many(ack_ids, Disposition::ModifyDeadline(seconds));
        }
        count
    }

    /// Earliest renewal time across all leases.
    pub(crate) fn next_renewal(&self) -> Option<Instant> {
        self.registry.lock().values().map(LeaseEntry::renew_at).min()
    }

    /// Drop every lease and return all flow reservations.
    pub(crate) fn clear(&self) -> usize {
        let drained: Vec<LeaseEntry> = self.registry.lock().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            self.flow.release(entry.bytes);
        }
        drained.len()
    }
}

/// Extend each lease shortly before it would lapse, until stopped.
///
/// Sleeps until the earliest renewal time, or `idle_period` when nothing is
/// due sooner. New leases always fall due after `idle_period`; shortened ones
/// wake the task early.
pub(crate) async fn run_lease_renewal(
    lease: Arc<LeaseContext>,
    idle_period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let now = Instant::now();
        let renewed = lease.renew_due(now);
        if renewed > 0 {
            tracing::debug!(renewed, "extended leases");
        }
        let idle_until = now + idle_period;
        let wake = lease
            .next_renewal()
            .map_or(idle_until, |due| due.min(idle_until));
        tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            _ = tokio::time::sleep_until(wake) => {}
            _ = lease.rescheduled.notified() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::transport::AckTransport;
    use async_trait::async_trait;
    use courier_common::SubscriptionPath;

    struct NoopAcks;

    #[async_trait]
    impl AckTransport for NoopAcks {
        async fn acknowledge(
            &self,
            _subscription: &SubscriptionPath,
            _ack_ids: &[AckId],
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn modify_ack_deadline(
            &self,
            _subscription: &SubscriptionPath,
            _ack_ids: &[AckId],
            _seconds: u32,
        ) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn context() -> (LeaseContext, Arc<FlowController>) {
        let subscription = SubscriptionPath::new("projects/p/subscriptions/s").expect("path");
        let buffer = Arc::new(AckBuffer::new(subscription, Arc::new(NoopAcks), 100, 100));
        let flow = Arc::new(FlowController::new(100, 1 << 20));
        (LeaseContext::new(buffer, flow.clone(), 60), flow)
    }

    fn ack_id(id: &str) -> AckId {
        AckId::new(id).expect("ack id")
    }

    #[tokio::test]
    async fn register_queues_receipt_extension_once() {
        let (lease, _flow) = context();
        assert!(lease.register(&ack_id("a"), 0, 10));
        assert!(!lease.register(&ack_id("a"), 0, 10));
        assert_eq!(lease.len(), 1);
        assert_eq!(
            lease.buffer().pending_disposition(&ack_id("a")),
            Some(Disposition::ModifyDeadline(60))
        );
    }

    #[tokio::test]
    async fn dispose_removes_lease_and_releases_flow() {
        let (lease, flow) = context();
        assert!(flow.try_reserve(10));
        lease.register(&ack_id("a"), 0, 10);
        lease.dispose(&ack_id("a"), Disposition::Ack);
        assert!(!lease.contains(&ack_id("a")));
        assert_eq!(flow.outstanding().messages, 0);
        assert_eq!(
            lease.buffer().pending_disposition(&ack_id("a")),
            Some(Disposition::Ack)
        );
    }

    #[tokio::test]
    async fn renewal_skips_disposed_and_recent_entries() {
        let (lease, flow) = context();
        for id in ["a", "b"] {
            assert!(flow.try_reserve(1));
            lease.register(&ack_id(id), 0, 1);
        }
        lease.dispose(&ack_id("a"), Disposition::Ack);

        let now = Instant::now();
        assert_eq!(lease.renew_due(now + Duration::from_secs(53)), 0);
        assert_eq!(lease.renew_due(now + Duration::from_secs(55)), 1);
        assert_eq!(
            lease.buffer().pending_disposition(&ack_id("a")),
            Some(Disposition::Ack)
        );
    }

    #[tokio::test]
    async fn shortened_lease_is_renewed_by_its_own_deadline() {
        let (lease, flow) = context();
        assert!(flow.try_reserve(1));
        lease.register(&ack_id("a"), 0, 1);
        lease.extend(&ack_id("a"), 10);

        let now = Instant::now();
        let due = lease.next_renewal().expect("leased");
        assert!(due <= now + Duration::from_secs(9), "due in {:?}", due - now);
        assert_eq!(lease.renew_due(now + Duration::from_secs(8)), 0);
        assert_eq!(lease.renew_due(now + Duration::from_secs(10)), 1);
        assert_eq!(
            lease.buffer().pending_disposition(&ack_id("a")),
            Some(Disposition::ModifyDeadline(10))
        );
    }

    #[tokio::test]
    async fn abandon_drops_unsent_receipt_extension() {
        let (lease, flow) = context();
        for id in ["a", "b"] {
            assert!(flow.try_reserve(1));
            lease.register(&ack_id(id), 0, 1);
        }
        lease.extend(&ack_id("b"), 30);

        lease.abandon(&ack_id("a"));
        lease.abandon(&ack_id("b"));
        assert_eq!(lease.len(), 0);
        assert_eq!(flow.outstanding().messages, 0);
        assert_eq!(lease.buffer().pending_disposition(&ack_id("a")), None);
        // Only the receipt is dropped; an extension asked for by the callback stays.
        assert_eq!(
            lease.buffer().pending_disposition(&ack_id("b")),
            Some(Disposition::ModifyDeadline(30))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_task_wakes_early_for_shortened_lease() {
        let (lease, flow) = context();
        let lease = Arc::new(lease);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_lease_renewal(
            lease.clone(),
            Duration::from_secs(54),
            stop_rx,
        ));
        assert!(flow.try_reserve(1));
        lease.register(&ack_id("a"), 0, 1);
        lease.extend(&ack_id("a"), 10);
        lease.buffer().remove_if(&ack_id("a"), Disposition::ModifyDeadline(10));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(
            lease.buffer().pending_disposition(&ack_id("a")),
            Some(Disposition::ModifyDeadline(10))
        );

        stop_tx.send_replace(true);
        task.await.expect("renewal join");
    }

    #[tokio::test]
    async fn extend_zero_behaves_like_nack() {
        let (lease, flow) = context();
        assert!(flow.try_reserve(4));
        lease.register(&ack_id("a"), 0, 4);
        lease.extend(&ack_id("a"), 0);
        assert_eq!(lease.len(), 0);
        assert_eq!(flow.outstanding().bytes, 0);
        assert_eq!(
            lease.buffer().pending_disposition(&ack_id("a")),
            Some(Disposition::ModifyDeadline(0))
        );
    }

    #[tokio::test]
    async fn clear_releases_everything() {
        let (lease, flow) = context();
        for id in ["a", "b", "c"] {
            assert!(flow.try_reserve(2));
            lease.register(&ack_id(id), 1, 2);
        }
        assert_eq!(lease.clear(), 3);
        assert_eq!(flow.outstanding().messages, 0);
        assert_eq!(lease.len(), 0);
    }
}
