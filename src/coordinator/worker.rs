use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A periodic task that runs until its token is cancelled, then runs its
/// termination callback once.
pub struct Worker {
    name: &'static str,
    period: Duration,
    token: CancellationToken,
}

impl Worker {
    pub fn new(name: &'static str, period: Duration, token: CancellationToken) -> Self {
        Self { name, period, token }
    }

    /// First tick fires one period after spawning. Overrunning bodies skip
    /// missed ticks instead of bursting.
    pub fn spawn<B, BF, C, CF>(self, mut body: B, on_cancel: C) -> JoinHandle<()>
    where
        B: FnMut() -> BF + Send + 'static,
        BF: Future<Output = ()> + Send,
        C: FnOnce() -> CF + Send + 'static,
        CF: Future<Output = ()> + Send,
    {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.period, self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!(worker = self.name, period = ?self.period, "Worker started.");

            loop {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => {
                        debug!(worker = self.name, "Worker stopping.");
                        on_cancel().await;
                        return;
                    }
                    _ = ticker.tick() => body().await,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_cancelled_then_calls_back() {
        let token = CancellationToken::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));

        let t = ticks.clone();
        let s = stopped.clone();
        let handle = Worker::new("test", Duration::from_secs(10), token.clone()).spawn(
            move || {
                let t = t.clone();
                async move {
                    t.fetch_add(1, Ordering::SeqCst);
                }
            },
            move || async move {
                s.fetch_add(1, Ordering::SeqCst);
            },
        );

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        token.cancel();
        handle.await.unwrap();
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
