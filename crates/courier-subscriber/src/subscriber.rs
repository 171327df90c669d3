// Subscriber builder and the handle that owns its background tasks.
use courier_common::SubscriptionPath;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::buffer::{AckBuffer, FlushStats, run_ack_flusher};
use crate::config::SubscriberConfig;
use crate::dispatch::run_dispatcher;
use crate::error::SubscriberError;
use crate::flow::{FlowController, Outstanding};
use crate::lease::{LeaseContext, run_lease_renewal};
use crate::message::ReceivedMessage;
use crate::stream::Receiver;
use crate::transport::{AckTransport, StreamTransport};

pub type MessageCallback = Arc<dyn Fn(ReceivedMessage) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(SubscriberError) + Send + Sync>;

/// Configures and starts a streaming pull subscription.
pub struct StreamSubscriber {
    subscription: SubscriptionPath,
    stream_transport: Arc<dyn StreamTransport>,
    ack_transport: Arc<dyn AckTransport>,
    config: SubscriberConfig,
    on_error: Option<ErrorCallback>,
}

impl StreamSubscriber {
    pub fn new(
        subscription: SubscriptionPath,
        stream_transport: Arc<dyn StreamTransport>,
        ack_transport: Arc<dyn AckTransport>,
    ) -> Self {
        Self {
            subscription,
            stream_transport,
            ack_transport,
            config: SubscriberConfig::default(),
            on_error: None,
        }
    }

    pub fn with_config(mut self, config: SubscriberConfig) -> Self {
        self.config = config;
        self
    }

    /// Receives errors that end a stream for good. Defaults to an error log.
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(SubscriberError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Spawn the receivers, dispatcher, flusher and lease renewal tasks.
    ///
    /// Returns immediately. `callback` runs on the blocking pool, once per
    /// delivered message, and should end by acking or nacking it.
    pub fn start<F>(self, callback: F) -> Result<SubscriberHandle, SubscriberError>
    where
        F: Fn(ReceivedMessage) + Send + Sync + 'static,
    {
        self.config.validate()?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| SubscriberError::NoRuntime)?;
        let config = Arc::new(self.config);
        let on_error: ErrorCallback = match self.on_error {
            Some(handler) => handler,
            None => Arc::new(log_permanent_error),
        };

        let buffer = Arc::new(AckBuffer::new(
            self.subscription.clone(),
            self.ack_transport,
            config.ack_buffer_capacity(),
            config.max_ack_batch,
        ));
        let flow = Arc::new(FlowController::new(
            config.max_outstanding_messages,
            config.max_outstanding_bytes,
        ));
        let lease = Arc::new(LeaseContext::new(
            buffer.clone(),
            flow.clone(),
            config.stream_ack_deadline_secs,
        ));
        let (stop_tx, stop_rx) = watch::channel(false);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.workers);

        let mut tasks = Vec::with_capacity(config.streams + 3);
        for stream_index in 0..config.streams {
            let receiver = Receiver {
                stream_index,
                subscription: self.subscription.clone(),
                transport: self.stream_transport.clone(),
                config: config.clone(),
                lease: lease.clone(),
                flow: flow.clone(),
                dispatch_tx: dispatch_tx.clone(),
                on_error: on_error.clone(),
                stop: stop_rx.clone(),
            };
            tasks.push(runtime.spawn(receiver.run()));
        }
        drop(dispatch_tx);
        tasks.push(runtime.spawn(run_dispatcher(
            dispatch_rx,
            Arc::new(callback),
            config.workers,
            stop_rx.clone(),
        )));
        tasks.push(runtime.spawn(run_ack_flusher(
            buffer.clone(),
            config.flush_interval(),
            stop_rx.clone(),
        )));
        tasks.push(runtime.spawn(run_lease_renewal(
            lease.clone(),
            config.renewal_interval(),
            stop_rx,
        )));
        tracing::debug!(
            subscription = %self.subscription,
            streams = config.streams,
            workers = config.workers,
            "subscriber started"
        );

        Ok(SubscriberHandle {
            subscription: self.subscription,
            buffer,
            lease,
            flow,
            stop_tx,
            tasks: Mutex::new(tasks),
        })
    }
}

fn log_permanent_error(err: SubscriberError) {
    tracing::error!(error = %err, "subscriber stream failed permanently");
}

/// Running subscriber. Dropping it signals stop without waiting.
pub struct SubscriberHandle {
    subscription: SubscriptionPath,
    buffer: Arc<AckBuffer>,
    lease: Arc<LeaseContext>,
    flow: Arc<FlowController>,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SubscriberHandle {
    pub fn subscription(&self) -> &SubscriptionPath {
        &self.subscription
    }

    /// Signal every task to stop. In-flight callbacks run to completion.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Join all tasks, send whatever is still queued, then drop the leases.
    ///
    /// Does not stop the subscriber by itself; call [`Self::stop`] first or
    /// use [`Self::shutdown`].
    pub async fn wait(&self) -> Result<(), SubscriberError> {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "subscriber task failed");
            }
        }
        let flushed = self.buffer.flush().await;
        let dropped = self.lease.clear();
        tracing::debug!(
            subscription = %self.subscription,
            dropped_leases = dropped,
            "subscriber stopped"
        );
        flushed.map(|_| ())
    }

    pub async fn shutdown(&self) -> Result<(), SubscriberError> {
        self.stop();
        self.wait().await
    }

    /// Send queued acks and extensions now.
    pub async fn flush(&self) -> Result<FlushStats, SubscriberError> {
        self.buffer.flush().await
    }

    /// Shared ack buffer, e.g. for [`AckBuffer::flush_blocking`] from a callback.
    pub fn buffer(&self) -> Arc<AckBuffer> {
        self.buffer.clone()
    }

    pub fn outstanding(&self) -> Outstanding {
        self.flow.outstanding()
    }

    /// Number of received messages not yet acked or nacked.
    pub fn leased(&self) -> usize {
        self.lease.len()
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}
