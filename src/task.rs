use std::future::Future;
use tokio::task::JoinHandle;

/// Spawn a long-lived background task. The name shows up in trace logs and
/// makes panics attributable.
pub fn spawn_named<T, F>(name: &'static str, future: F) -> JoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(async move {
        tracing::trace!(task = name, "background task started");
        future.await
    })
}

/// Sleep that wakes early on shutdown. Returns false when cancelled.
pub async fn interruptible_sleep(
    duration: std::time::Duration,
    shutdown: &tokio_util::sync::CancellationToken,
) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
