// Scripted streaming pull transport that records every ack and modack.
use async_trait::async_trait;
use courier_common::{AckId, StreamingPullRequest, StreamingPullResponse, SubscriptionPath};
use courier_subscriber::{AckTransport, PullStream, StreamTransport, TransportError};
use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

/// One item of a scripted stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Batch(StreamingPullResponse),
    /// Ends the stream with this error.
    Error(TransportError),
    /// Ends the stream cleanly.
    Close,
}

#[derive(Debug, Clone)]
enum OpenScript {
    Stream(Vec<StreamEvent>),
    Refuse(TransportError),
}

/// Fake transport driven by per-open scripts.
///
/// Each `open` consumes the next script. A script that does not end in
/// `Error` or `Close` stays open (pending) after its last batch; with no
/// scripts left, `open` returns a stream that never yields.
#[derive(Default)]
pub struct StreamingPullStub {
    scripts: Mutex<VecDeque<OpenScript>>,
    requests: Mutex<Vec<StreamingPullRequest>>,
    acknowledge_requests: Mutex<Vec<(String, Vec<String>)>>,
    modify_ack_deadline_requests: Mutex<Vec<(String, Vec<String>, u32)>>,
    ack_failures: Mutex<VecDeque<TransportError>>,
    recorded: Notify,
}

impl StreamingPullStub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next opened stream with a sequence of batches.
    pub fn with_responses(self, responses: Vec<StreamingPullResponse>) -> Self {
        self.push_stream(responses.into_iter().map(StreamEvent::Batch).collect());
        self
    }

    pub fn push_stream(&self, events: Vec<StreamEvent>) {
        self.scripts.lock().push_back(OpenScript::Stream(events));
    }

    /// Make the next `open` call fail outright.
    pub fn push_open_error(&self, err: TransportError) {
        self.scripts.lock().push_back(OpenScript::Refuse(err));
    }

    /// Fail the next ack/modack sends, one error per call.
    pub fn fail_next_ack_sends(&self, err: TransportError, count: usize) {
        let mut failures = self.ack_failures.lock();
        for _ in 0..count {
            failures.push_back(err.clone());
        }
    }

    pub fn requests(&self) -> Vec<StreamingPullRequest> {
        self.requests.lock().clone()
    }

    pub fn open_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// `(subscription, sorted ack ids)` per acknowledge call.
    pub fn acknowledge_requests(&self) -> Vec<(String, Vec<String>)> {
        self.acknowledge_requests.lock().clone()
    }

    /// `(subscription, sorted ack ids, seconds)` per modify call.
    pub fn modify_ack_deadline_requests(&self) -> Vec<(String, Vec<String>, u32)> {
        self.modify_ack_deadline_requests.lock().clone()
    }

    /// Every acked id across all calls, sorted.
    pub fn acked_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .acknowledge_requests
            .lock()
            .iter()
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect();
        ids.sort();
        ids
    }

    /// Every id sent with a modify of exactly `seconds`, sorted.
    pub fn modified_ids(&self, seconds: u32) -> Vec<String> {
        let mut ids: Vec<String> = self
            .modify_ack_deadline_requests
            .lock()
            .iter()
            .filter(|(_, _, value)| *value == seconds)
            .flat_map(|(_, ids, _)| ids.iter().cloned())
            .collect();
        ids.sort();
        ids
    }

    /// Resolves once `condition` holds for the recorded state.
    pub async fn wait_for<F>(&self, mut condition: F)
    where
        F: FnMut(&Self) -> bool,
    {
        loop {
            let recorded = self.recorded.notified();
            tokio::pin!(recorded);
            recorded.as_mut().enable();
            if condition(self) {
                return;
            }
            recorded.await;
        }
    }

    fn take_ack_failure(&self) -> Option<TransportError> {
        self.ack_failures.lock().pop_front()
    }
}

fn sorted_ids(ack_ids: &[AckId]) -> Vec<String> {
    let mut ids: Vec<String> = ack_ids.iter().map(|id| id.as_str().to_string()).collect();
    ids.sort();
    ids
}

#[async_trait]
impl StreamTransport for StreamingPullStub {
    async fn open(&self, request: StreamingPullRequest) -> Result<PullStream, TransportError> {
        self.requests.lock().push(request);
        let script = self.scripts.lock().pop_front();
        self.recorded.notify_waiters();
        let events = match script {
            None => return Ok(stream::pending().boxed()),
            Some(OpenScript::Refuse(err)) => {
                tracing::debug!(error = %err, "stub refusing stream open");
                return Err(err);
            }
            Some(OpenScript::Stream(events)) => events,
        };

        let mut items = Vec::with_capacity(events.len());
        let mut ends = false;
        for event in events {
            match event {
                StreamEvent::Batch(response) => items.push(Ok(response)),
                StreamEvent::Error(err) => {
                    items.push(Err(err));
                    ends = true;
                    break;
                }
                StreamEvent::Close => {
                    ends = true;
                    break;
                }
            }
        }
        if ends {
            Ok(stream::iter(items).boxed())
        } else {
            Ok(stream::iter(items).chain(stream::pending()).boxed())
        }
    }
}

#[async_trait]
impl AckTransport for StreamingPullStub {
    async fn acknowledge(
        &self,
        subscription: &SubscriptionPath,
        ack_ids: &[AckId],
    ) -> Result<(), TransportError> {
        if let Some(err) = self.take_ack_failure() {
            tracing::debug!(error = %err, "stub failing ack send");
            return Err(err);
        }
        self.acknowledge_requests
            .lock()
            .push((subscription.to_string(), sorted_ids(ack_ids)));
        self.recorded.notify_waiters();
        Ok(())
    }

    async fn modify_ack_deadline(
        &self,
        subscription: &SubscriptionPath,
        ack_ids: &[AckId],
        seconds: u32,
    ) -> Result<(), TransportError> {
        if let Some(err) = self.take_ack_failure() {
            tracing::debug!(error = %err, "stub failing ack send");
            return Err(err);
        }
        self.modify_ack_deadline_requests.lock().push((
            subscription.to_string(),
            sorted_ids(ack_ids),
            seconds,
        ));
        self.recorded.notify_waiters();
        Ok(())
    }
}
