// Per-stream receiver: open, pump batches into dispatch, reconnect on failure.
use courier_common::{StreamingPullRequest, StreamingPullResponse, SubscriptionPath};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::config::SubscriberConfig;
use crate::error::{SubscriberError, TransportError};
use crate::flow::FlowController;
use crate::lease::LeaseContext;
use crate::message::ReceivedMessage;
use crate::shutdown::{is_stopped, stopped};
use crate::subscriber::ErrorCallback;
use crate::transport::{PullStream, StreamTransport};

pub(crate) struct Receiver {
    pub(crate) stream_index: usize,
    pub(crate) subscription: SubscriptionPath,
    pub(crate) transport: Arc<dyn StreamTransport>,
    pub(crate) config: Arc<SubscriberConfig>,
    pub(crate) lease: Arc<LeaseContext>,
    pub(crate) flow: Arc<FlowController>,
    pub(crate) dispatch_tx: mpsc::Sender<ReceivedMessage>,
    pub(crate) on_error: ErrorCallback,
    pub(crate) stop: watch::Receiver<bool>,
}

enum StreamEnd {
    Stopped,
    Closed,
    Failed(TransportError),
}

impl Receiver {
    pub(crate) async fn run(mut self) {
        // Consecutive failures since the last delivered batch.
        let mut failures: u32 = 0;
        loop {
            if is_stopped(&self.stop) {
                break;
            }
            let request = StreamingPullRequest {
                subscription: self.subscription.clone(),
                stream_ack_deadline_seconds: self.config.stream_ack_deadline_secs,
            };
            let transport = self.transport.clone();
            let opened = tokio::select! {
                biased;
                _ = stopped(&mut self.stop) => break,
                opened = transport.open(request) => opened,
            };
            let end = match opened {
                Ok(stream) => {
                    tracing::debug!(stream_index = self.stream_index, "pull stream opened");
                    self.pump(stream, &mut failures).await
                }
                Err(err) => StreamEnd::Failed(err),
            };

            let delay = match end {
                StreamEnd::Stopped => break,
                StreamEnd::Closed => {
                    tracing::debug!(stream_index = self.stream_index, "pull stream closed");
                    self.config.reconnect_delay(1)
                }
                StreamEnd::Failed(source) => {
                    if !source.is_retryable() || failures >= self.config.max_reconnect_attempts {
                        (self.on_error)(SubscriberError::PermanentStream {
                            stream_index: self.stream_index,
                            attempts: failures,
                            source,
                        });
                        break;
                    }
                    failures += 1;
                    let err = SubscriberError::TransientStream {
                        stream_index: self.stream_index,
                        source,
                    };
                    tracing::warn!(error = %err, attempt = failures, "reconnecting pull stream");
                    self.config.reconnect_delay(failures)
                }
            };
            metrics::counter!("courier_sub_reconnects_total").increment(1);
            tokio::select! {
                biased;
                _ = stopped(&mut self.stop) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::debug!(stream_index = self.stream_index, "receiver stopped");
    }

    async fn pump(&mut self, mut stream: PullStream, failures: &mut u32) -> StreamEnd {
        loop {
            let next = tokio::select! {
                biased;
                _ = stopped(&mut self.stop) => return StreamEnd::Stopped,
                next = stream.next() => next,
            };
            match next {
                None => return StreamEnd::Closed,
                Some(Err(err)) => return StreamEnd::Failed(err),
                Some(Ok(response)) => {
                    *failures = 0;
                    if !self.deliver(response).await {
                        return StreamEnd::Stopped;
                    }
                }
            }
        }
    }

    /// Lease and enqueue every message of one batch. Returns `false` once
    /// stopped or the dispatcher is gone.
    async fn deliver(&mut self, response: StreamingPullResponse) -> bool {
        let count = response.received_messages.len();
        metrics::counter!("courier_sub_messages_received_total").increment(count as u64);
        for pulled in response.received_messages {
            let size = pulled.message.size();
            if !self.flow.acquire(size, &mut self.stop).await {
                return false;
            }
            // The lease is registered right after the room check, with no await between.
            if !self.lease.buffer().wait_for_room(&mut self.stop).await {
                self.flow.release(size);
                return false;
            }
            if !self.lease.register(&pulled.ack_id, self.stream_index, size) {
                tracing::debug!(
                    stream_index = self.stream_index,
                    ack_id = %pulled.ack_id,
                    "dropping duplicate delivery"
                );
                self.flow.release(size);
                continue;
            }
            let permit = tokio::select! {
                biased;
                _ = stopped(&mut self.stop) => None,
                permit = self.dispatch_tx.reserve() => permit.ok(),
            };
            let Some(permit) = permit else {
                self.lease.abandon(&pulled.ack_id);
                return false;
            };
            permit.send(ReceivedMessage::new(
                pulled.ack_id,
                pulled.message,
                size,
                self.stream_index,
                self.lease.clone(),
            ));
        }
        true
    }
}
