// Runs the user callback for queued messages on the blocking pool.
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinError, JoinSet};

use crate::message::ReceivedMessage;
use crate::shutdown::stopped;
use crate::subscriber::MessageCallback;

pub(crate) async fn run_dispatcher(
    mut queue: mpsc::Receiver<ReceivedMessage>,
    callback: MessageCallback,
    workers: usize,
    mut stop: watch::Receiver<bool>,
) {
    let slots = Arc::new(Semaphore::new(workers.max(1)));
    let mut in_flight = JoinSet::new();
    loop {
        let permit = tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            permit = slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let message = tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            message = queue.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        metrics::counter!("courier_sub_dispatch_total").increment(1);
        let callback = callback.clone();
        in_flight.spawn_blocking(move || {
            let _permit = permit;
            callback(message);
        });
        while let Some(result) = in_flight.try_join_next() {
            log_callback_result(result);
        }
    }

    // Undispatched messages go back to the source by lease expiry.
    queue.close();
    let mut dropped = 0usize;
    while let Ok(message) = queue.try_recv() {
        message.abandon();
        dropped += 1;
    }
    if dropped > 0 {
        tracing::debug!(dropped, "dropped undispatched messages on stop");
    }
    while let Some(result) = in_flight.join_next().await {
        log_callback_result(result);
    }
    tracing::debug!("dispatcher stopped");
}

fn log_callback_result(result: Result<(), JoinError>) {
    if let Err(err) = result {
        tracing::error!(error = %err, "message callback panicked");
    }
}
