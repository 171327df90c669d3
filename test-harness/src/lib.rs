// Shared fakes for courier integration tests.
pub mod clock;
pub mod executor_stub;
pub mod pull_stub;

pub use clock::ManualClock;
pub use executor_stub::{ExecutorCall, ScriptedExecutor};
pub use pull_stub::{StreamEvent, StreamingPullStub};

use bytes::Bytes;
use courier_common::{AckId, Message, PulledMessage, StreamingPullResponse, SubscriptionPath};
use std::time::Duration;

pub const TEST_SUBSCRIPTION: &str = "projects/test/subscriptions/my-sub";

pub fn subscription() -> SubscriptionPath {
    SubscriptionPath::new(TEST_SUBSCRIPTION).expect("test subscription path")
}

pub fn pulled(ack_id: &str, message_id: &str, data: &'static [u8]) -> PulledMessage {
    PulledMessage {
        ack_id: AckId::new(ack_id).expect("ack id"),
        message: Message::new(message_id, Bytes::from_static(data)),
    }
}

/// Batch of `{ack_id, payload}` pairs; message ids are `msg-<ack_id>`.
pub fn batch(items: &[(&str, &'static [u8])]) -> StreamingPullResponse {
    StreamingPullResponse::new(
        items
            .iter()
            .map(|(ack_id, data)| pulled(ack_id, &format!("msg-{ack_id}"), data))
            .collect(),
    )
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
