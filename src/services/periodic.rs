use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Spawn `tick` every `period` until `token` is cancelled.
///
/// The first run happens one full period after spawning. A tick that is
/// already running finishes before cancellation is observed.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!(task = name, "Periodic task shutting down");
                    break;
                }
                _ = ticker.tick() => tick().await,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_runs_until_cancelled() {
        let runs = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        let counter = Arc::clone(&runs);
        let handle = spawn_periodic("test", Duration::from_millis(10), token.clone(), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(75)).await;
        token.cancel();
        handle.await.unwrap();

        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several ticks, saw {seen}");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }
}
