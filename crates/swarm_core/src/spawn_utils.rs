use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, trace};

/// Spawns a background task inside `span`, logging how it ended.
pub fn spawn(
    span: tracing::Span,
    name: &'static str,
    fut: impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    let fut = async move {
        trace!(task = name, "started");
        match fut.await {
            Ok(()) => trace!(task = name, "finished"),
            Err(e) => error!(task = name, "finished with error: {:#}", e),
        }
    }
    .instrument(span);
    tokio::task::spawn(fut)
}

/// Like [`spawn`], but the task stops as soon as `cancellation_token` fires.
pub fn spawn_with_cancel(
    span: tracing::Span,
    name: &'static str,
    cancellation_token: CancellationToken,
    fut: impl std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    spawn(span, name, async move {
        tokio::select! {
            _ = cancellation_token.cancelled() => {
                debug!(task = name, "cancelled");
                Ok(())
            },
            r = fut => r
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_spawn_with_cancel_stops_task() {
        let token = CancellationToken::new();
        let handle = spawn_with_cancel(
            tracing::debug_span!("test"),
            "forever",
            token.clone(),
            async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
            },
        );
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
