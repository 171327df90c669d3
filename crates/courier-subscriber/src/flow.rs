// Outstanding message/byte limits shared by all receivers of one subscriber.
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};

use crate::shutdown::stopped;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Outstanding {
    pub messages: usize,
    pub bytes: usize,
}

pub(crate) struct FlowController {
    max_messages: usize,
    max_bytes: usize,
    state: Mutex<Outstanding>,
    released: Notify,
}

impl FlowController {
    pub(crate) fn new(max_messages: usize, max_bytes: usize) -> Self {
        Self {
            max_messages: max_messages.max(1),
            max_bytes: max_bytes.max(1),
            state: Mutex::new(Outstanding::default()),
            released: Notify::new(),
        }
    }

    pub(crate) fn outstanding(&self) -> Outstanding {
        *self.state.lock()
    }

    /// Reserve room for one message, waiting for releases as needed.
    ///
    /// A message larger than `max_bytes` is admitted only when nothing else
    /// is outstanding. Returns `false` if the subscriber stopped first.
    pub(crate) async fn acquire(&self, bytes: usize, stop: &mut watch::Receiver<bool>) -> bool {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            // Register before checking so a release between check and await is seen.
            released.as_mut().enable();
            if self.try_reserve(bytes) {
                return true;
            }
            tokio::select! {
                _ = stopped(stop) => return false,
                _ = &mut released => {}
            }
        }
    }

    pub(crate) fn try_reserve(&self, bytes: usize) -> bool {
        let mut state = self.state.lock();
        let idle = state.messages == 0;
        let fits = state.messages < self.max_messages
            && state.bytes.saturating_add(bytes) <= self.max_bytes;
        if !(fits || idle) {
            return false;
        }
        state.messages += 1;
        state.bytes = state.bytes.saturating_add(bytes);
        record(&state);
        true
    }

    pub(crate) fn release(&self, bytes: usize) {
        {
            let mut state = self.state.lock();
            state.messages = state.messages.saturating_sub(1);
            state.bytes = state.bytes.saturating_sub(bytes);
            record(&state);
        }
        self.released.notify_waiters();
    }
}

fn record(state: &Outstanding) {
    metrics::gauge!("courier_sub_outstanding_messages").set(state.messages as f64);
    metrics::gauge!("courier_sub_outstanding_bytes").set(state.bytes as f64);
}
