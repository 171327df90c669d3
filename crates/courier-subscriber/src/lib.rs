// Streaming pull subscriber with batched acknowledgement and lease management.
//
// TASK LAYOUT
// -----------
// One subscriber owns:
// - a receiver task per pull stream: opens the stream, applies flow control,
//   waits for room in the ack buffer, registers a lease for every message and
//   hands it to the dispatch queue;
// - a dispatcher: runs the user callback on the blocking pool, bounded by a
//   semaphore of `workers` slots;
// - a flusher: drains the ack buffer on a timer or when it fills up;
// - a lease renewal task: re-extends each lease at 90% of its last grant.
//
// Acks and extensions never go out from the callback thread. They are queued in
// the `AckBuffer`, keyed by ack id so only the latest disposition is sent.
// The lease registry lock is always taken before the buffer lock; this is what
// keeps an acked message from being extended afterwards.
//
// Stop is a single `watch` flag. Every task selects on it at each suspension
// point; `SubscriberHandle::wait` joins the tasks, runs a final flush and drops
// whatever leases remain so the source can redeliver them.
pub mod buffer;
pub mod config;
mod dispatch;
pub mod error;
mod flow;
pub mod inprocess;
mod lease;
pub mod message;
mod shutdown;
mod stream;
pub mod subscriber;
pub mod transport;

pub use buffer::{AckBuffer, Disposition, FlushStats};
pub use config::SubscriberConfig;
pub use courier_common::{
    AckId, Message, PulledMessage, StreamingPullRequest, StreamingPullResponse, SubscriptionPath,
};
pub use error::{SubscriberError, TransportError, TransportErrorKind};
pub use flow::Outstanding;
pub use inprocess::InProcessSource;
pub use message::ReceivedMessage;
pub use subscriber::{ErrorCallback, MessageCallback, StreamSubscriber, SubscriberHandle};
pub use transport::{AckTransport, PullStream, StreamTransport};
