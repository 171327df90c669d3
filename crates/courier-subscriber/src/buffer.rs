// Pending ack/modack dispositions and the flusher task that drains them.
use courier_common::{AckId, SubscriptionPath};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{SubscriberError, TransportError};
use crate::shutdown::stopped;
use crate::transport::AckTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Extend (or with 0, release) the lease by this many seconds.
    ModifyDeadline(u32),
}

/// Counts from one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub ack_requests: usize,
    pub modify_requests: usize,
    pub acked: usize,
    pub modified: usize,
}

impl FlushStats {
    pub fn is_empty(&self) -> bool {
        self.ack_requests == 0 && self.modify_requests == 0
    }
}

/// Bounded map of ack id to its latest disposition, drained in batches.
///
/// Keying by ack id means an `Ack` queued after a pending extension replaces
/// it, so an acked message never gets its deadline modified afterwards.
///
/// Receivers call [`AckBuffer::wait_for_room`] before leasing a message, so
/// while sends keep failing the map stops growing at about `capacity` plus
/// the number of leased messages.
pub struct AckBuffer {
    subscription: SubscriptionPath,
    transport: Arc<dyn AckTransport>,
    pending: Mutex<Pending>,
    capacity: usize,
    max_batch: usize,
    // Serializes flushes so a drained entry is sent by exactly one caller.
    flush_lock: tokio::sync::Mutex<()>,
    full: Notify,
    flushed: Notify,
}

#[derive(Default)]
struct Pending {
    queued: HashMap<AckId, Disposition>,
    // Drained by a flush still in progress; they come back if the send fails.
    sending: usize,
}

impl Pending {
    fn occupied(&self) -> usize {
        self.queued.len() + self.sending
    }
}

impl AckBuffer {
    pub(crate) fn new(
        subscription: SubscriptionPath,
        transport: Arc<dyn AckTransport>,
        capacity: usize,
        max_batch: usize,
    ) -> Self {
        Self {
            subscription,
            transport,
            pending: Mutex::new(Pending::default()),
            capacity: capacity.max(1),
            max_batch: max_batch.max(1),
            flush_lock: tokio::sync::Mutex::new(()),
            full: Notify::new(),
            flushed: Notify::new(),
        }
    }

    pub fn subscription(&self) -> &SubscriptionPath {
        &self.subscription
    }

    /// Dispositions queued or being sent.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().occupied()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pending_disposition(&self, ack_id: &AckId) -> Option<Disposition> {
        self.pending.lock().queued.get(ack_id).copied()
    }

    pub(crate) fn push(&self, ack_id: AckId, disposition: Disposition) {
        let len = {
            let mut pending = self.pending.lock();
            pending.queued.insert(ack_id, disposition);
            pending.occupied()
        };
        self.after_push(len);
    }

    /// Drop the queued disposition for `ack_id` if it is still `expected`.
    pub(crate) fn remove_if(&self, ack_id: &AckId, expected: Disposition) -> bool {
        let mut pending = self.pending.lock();
        if pending.queued.get(ack_id) != Some(&expected) {
            return false;
        }
        pending.queued.remove(ack_id);
        metrics::gauge!("courier_sub_ack_buffer_len").set(pending.occupied() as f64);
        true
    }

    /// Wait until fewer than `capacity` dispositions are queued or in flight.
    ///
    /// Returns `false` if the subscriber stopped first.
    pub(crate) async fn wait_for_room(&self, stop: &mut watch::Receiver<bool>) -> bool {
        loop {
            let flushed = self.flushed.notified();
            tokio::pin!(flushed);
            flushed.as_mut().enable();
            if self.pending.lock().occupied() < self.capacity {
                return true;
            }
            tracing::trace!(subscription = %self.subscription, "ack buffer full; holding receiver");
            tokio::select! {
                _ = stopped(stop) => return false,
                _ = &mut flushed => {}
            }
        }
    }

    pub(crate) fn push_many(&self, ack_ids: Vec<AckId>, disposition: Disposition) {
        if ack_ids.is_empty() {
            return;
        }
        let len = {
            let mut pending = self.pending.lock();
            for ack_id in ack_ids {
                pending.queued.insert(ack_id, disposition);
            }
            pending.occupied()
        };
        self.after_push(len);
    }

    fn after_push(&self, len: usize) {
        metrics::gauge!("courier_sub_ack_buffer_len").set(len as f64);
        if len >= self.capacity {
            // Wake the flusher instead of waiting for the next tick.
            self.full.notify_one();
        }
    }

    /// Send every queued disposition now.
    ///
    /// Calling this again with nothing new queued sends nothing. Failed
    /// batches are re-queued (unless superseded) and reported.
    pub async fn flush(&self) -> Result<FlushStats, SubscriberError> {
        let _guard = self.flush_lock.lock().await;
        let drained = {
            let mut pending = self.pending.lock();
            let drained = std::mem::take(&mut pending.queued);
            pending.sending = drained.len();
            drained
        };
        if drained.is_empty() {
            return Ok(FlushStats::default());
        }

        let mut acks = Vec::new();
        let mut modifies: BTreeMap<u32, Vec<AckId>> = BTreeMap::new();
        for (ack_id, disposition) in drained {
            match disposition {
                Disposition::Ack => acks.push(ack_id),
                Disposition::ModifyDeadline(seconds) => {
                    modifies.entry(seconds).or_default().push(ack_id)
                }
            }
        }
        acks.sort();

        let mut stats = FlushStats::default();
        let mut failed: Vec<(AckId, Disposition)> = Vec::new();
        let mut last_error: Option<TransportError> = None;

        // Extensions go out before acks so a receipt lease is registered first.
        for (seconds, mut ack_ids) in modifies {
            ack_ids.sort();
            for chunk in ack_ids.chunks(self.max_batch) {
                match self
                    .transport
                    .modify_ack_deadline(&self.subscription, chunk, seconds)
                    .await
                {
                    Ok(()) => {
                        stats.modify_requests += 1;
                        stats.modified += chunk.len();
                        metrics::counter!("courier_sub_modacks_sent_total")
                            .increment(chunk.len() as u64);
                    }
                    Err(err) => {
                        failed.extend(
                            chunk
                                .iter()
                                .map(|id| (id.clone(), Disposition::ModifyDeadline(seconds))),
                        );
                        last_error = Some(err);
                    }
                }
            }
        }
        for chunk in acks.chunks(self.max_batch) {
            match self.transport.acknowledge(&self.subscription, chunk).await {
                Ok(()) => {
                    stats.ack_requests += 1;
                    stats.acked += chunk.len();
                    metrics::counter!("courier_sub_acks_sent_total").increment(chunk.len() as u64);
                }
                Err(err) => {
                    failed.extend(chunk.iter().map(|id| (id.clone(), Disposition::Ack)));
                    last_error = Some(err);
                }
            }
        }

        let count = failed.len();
        self.requeue(failed);

        match last_error {
            None => Ok(stats),
            Some(source) => {
                metrics::counter!("courier_sub_ack_send_failures_total").increment(count as u64);
                Err(SubscriberError::AckDelivery { count, source })
            }
        }
    }

    /// Flush from a synchronous context running on the blocking pool, such as
    /// a message callback.
    pub fn flush_blocking(&self) -> Result<FlushStats, SubscriberError> {
        let handle =
            tokio::runtime::Handle::try_current().map_err(|_| SubscriberError::NoRuntime)?;
        handle.block_on(self.flush())
    }

    /// Put failed entries back and end the in-flight accounting of a flush.
    fn requeue(&self, failed: Vec<(AckId, Disposition)>) {
        let len = {
            let mut pending = self.pending.lock();
            for (ack_id, disposition) in failed {
                // A newer disposition queued during the send wins.
                pending.queued.entry(ack_id).or_insert(disposition);
            }
            pending.sending = 0;
            pending.occupied()
        };
        metrics::gauge!("courier_sub_ack_buffer_len").set(len as f64);
        self.flushed.notify_waiters();
    }
}

/// Flush on every tick and whenever the buffer fills up, until stopped.
pub(crate) async fn run_ack_flusher(
    buffer: Arc<AckBuffer>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            _ = ticker.tick() => {}
            _ = buffer.full.notified() => {}
        }
        if let Err(err) = buffer.flush().await {
            tracing::warn!(error = %err, "ack flush failed; will retry on next tick");
        }
    }
    tracing::debug!(subscription = %buffer.subscription, "ack flusher stopped");
}
