// Stop signal shared by every subscriber task.
use tokio::sync::watch;

/// Resolve once the stop flag is set or its sender is gone.
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    // A dropped sender counts as stopped.
    let _ = stop.wait_for(|stopped| *stopped).await;
}

pub(crate) fn is_stopped(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}
