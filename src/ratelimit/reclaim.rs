//! Background reclamation of idle limiter state.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// State that can drop its idle entries.
pub trait Reclaim: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Remove idle entries, returning how many were removed.
    fn reclaim(&self) -> usize;
}

/// Run `reclaim` on every target each `period` until `shutdown` is cancelled.
///
/// The first sweep happens one full period after spawning. Cancelling the
/// token ends the loop at its next suspension point; awaiting the returned
/// handle then completes without leaving work behind.
pub fn spawn_reclaimer(
    targets: Vec<Arc<dyn Reclaim>>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            period_ms = period.as_millis() as u64,
            targets = targets.len(),
            "Starting reclamation sweep"
        );

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    for target in &targets {
                        let removed = target.reclaim();
                        debug!(state = target.name(), removed, "Reclamation sweep finished");
                    }
                }
            }
        }

        info!("Reclamation sweep stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTarget {
        sweeps: AtomicUsize,
    }

    impl Reclaim for CountingTarget {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn reclaim(&self) -> usize {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            0
        }
    }

    #[tokio::test]
    async fn test_reclaimer_sweeps_periodically() {
        let target = Arc::new(CountingTarget::default());
        let shutdown = CancellationToken::new();

        let handle = spawn_reclaimer(
            vec![target.clone() as Arc<dyn Reclaim>],
            Duration::from_millis(20),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert!(target.sweeps.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_reclaimer_stops_on_cancel() {
        let target = Arc::new(CountingTarget::default());
        let shutdown = CancellationToken::new();

        let handle = spawn_reclaimer(
            vec![target.clone() as Arc<dyn Reclaim>],
            Duration::from_secs(3600),
            shutdown.clone(),
        );

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reclaimer did not stop")
            .unwrap();

        assert_eq!(target.sweeps.load(Ordering::SeqCst), 0);
    }
}
