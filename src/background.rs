use std::future::Future;

/// Run `fut` on its own task and wait for it, logging (never propagating) a
/// panic. Used by the scheduler's per-job loops so one job body panicking
/// doesn't silently kill that job's entire long-lived loop task.
pub async fn run_isolated<F>(name: &'static str, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(fut);
    if let Err(err) = handle.await {
        eprintln!("[background] task '{name}' panicked: {err}");
    }
}

/// Fire off `fut` without waiting for it, logging (never propagating) a
/// panic. Used by HTTP handlers that trigger a slow sync and want to
/// acknowledge the request immediately instead of blocking on it.
pub fn spawn_background<F>(name: &'static str, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let handle = tokio::spawn(fut);
        if let Err(err) = handle.await {
            eprintln!("[background] task '{name}' panicked: {err}");
        }
    });
}
