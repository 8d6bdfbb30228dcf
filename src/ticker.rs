//! Fixed-interval background loops and their reentrancy guard.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// An in-flight flag. A routine that finds it set returns without work.
#[derive(Debug, Default)]
pub struct InFlight(AtomicBool);

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the flag, or `None` when another run holds it.
    pub fn try_enter(&self) -> Option<InFlightGuard<'_>> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard(&self.0))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Releases the flag on drop, including on panic unwind.
pub struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Spawn a loop that runs `tick` every `period`.
///
/// Each run executes on its own task so a panic is caught at the loop
/// boundary, logged, and the loop keeps going. Missed ticks are skipped.
pub fn spawn_ticker<F, Fut>(
    name: &'static str,
    session_id: String,
    period: Duration,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tracing::debug!(
            session = %session_id,
            loop_name = name,
            period_ms = period.as_millis() as u64,
            "Loop started"
        );
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            if let Err(e) = tokio::spawn(tick()).await
                && e.is_panic()
            {
                tracing::error!(
                    session = %session_id,
                    loop_name = name,
                    "Loop iteration panicked: {e}"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn second_enter_is_refused_until_release() {
        let flag = InFlight::new();
        let guard = flag.try_enter().unwrap();
        assert!(flag.try_enter().is_none());
        assert!(flag.is_running());
        drop(guard);
        assert!(flag.try_enter().is_some());
    }

    #[tokio::test]
    async fn ticker_survives_panics() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let handle = spawn_ticker("test", "s1".into(), Duration::from_millis(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    panic!("first run blows up");
                }
            }
        });

        tokio::time::timeout(Duration::from_secs(2), async {
            while runs.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        handle.abort();
    }
}
