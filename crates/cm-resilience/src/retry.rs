//! Debounced retry scheduling
//!
//! ```text
//! idle ──try_again──▶ pending ──interval──▶ attempt ──▶ idle
//!   ▲                   │  ▲                   │
//!   │                   │  └─ try_again (no-op)│
//!   └───── cancel ──────┘                      └─ attempt may call try_again
//! ```

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

type AttemptFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Inner {
    attempt: AttemptFn,
    interval: Duration,
    /// Scheduled retry, if any
    scheduled: Mutex<Option<JoinHandle<()>>>,
    /// Bumped on every schedule and cancel so a stale task never clears a newer one
    generation: AtomicU64,
}

impl Inner {
    fn scheduled(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.scheduled.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Schedules reconnect attempts without stacking timers
///
/// Typical use: a resource calls `try_now()` after loading, and
/// `try_again()` whenever its connection drops. Any number of `try_again()`
/// calls while a retry is pending collapse into that single retry.
#[derive(Clone)]
pub struct RetryTimer {
    inner: Arc<Inner>,
}

impl RetryTimer {
    /// Create a timer that runs `attempt` after `interval` when retried
    pub fn new<F, Fut>(interval: Duration, attempt: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let attempt: AttemptFn = Arc::new(move || Box::pin(attempt()) as BoxFuture<'static, ()>);
        Self {
            inner: Arc::new(Inner {
                attempt,
                interval,
                scheduled: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Run the attempt immediately, dropping any pending retry
    pub async fn try_now(&self) {
        self.cancel();
        (self.inner.attempt)().await;
    }

    /// Schedule one attempt after the interval
    ///
    /// Returns `false` if a retry was already pending.
    pub fn try_again(&self) -> bool {
        let mut scheduled = self.inner.scheduled();
        if scheduled.is_some() {
            trace!("Retry already pending");
            return false;
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::clone(&self.inner);

        debug!(interval_secs = inner.interval.as_secs_f64(), "Scheduling retry");

        *scheduled = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.interval).await;
            {
                let mut scheduled = inner.scheduled();
                if inner.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                // Clear before attempting so the attempt can reschedule itself
                scheduled.take();
            }
            (inner.attempt)().await;
        }));

        true
    }

    /// Drop a pending retry. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        let mut scheduled = self.inner.scheduled();
        match scheduled.take() {
            Some(handle) => {
                self.inner.generation.fetch_add(1, Ordering::SeqCst);
                handle.abort();
                debug!("Cancelled pending retry");
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.inner.scheduled().is_some()
    }
}

impl std::fmt::Debug for RetryTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryTimer")
            .field("interval", &self.inner.interval)
            .field("pending", &self.is_pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_timer(interval: Duration) -> (RetryTimer, Arc<AtomicUsize>) {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let timer = RetryTimer::new(interval, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        (timer, attempts)
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_now_runs_immediately() {
        let (timer, attempts) = counting_timer(Duration::from_secs(60));
        timer.try_now().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_again_debounced() {
        let (timer, attempts) = counting_timer(Duration::from_secs(60));

        assert!(timer.try_again());
        for _ in 0..9 {
            assert!(!timer.try_again());
        }
        assert!(timer.is_pending());

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());

        // Nothing else was queued behind the first retry
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_try_again() {
        let (timer, attempts) = counting_timer(Duration::from_secs(5));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let timer = timer.clone();
            tasks.push(tokio::spawn(async move { timer.try_again() }));
        }
        let mut scheduled = 0;
        for task in tasks {
            if task.await.unwrap() {
                scheduled += 1;
            }
        }
        assert_eq!(scheduled, 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_now_cancels_pending() {
        let (timer, attempts) = counting_timer(Duration::from_secs(10));

        timer.try_again();
        timer.try_now().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_can_reschedule() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<RetryTimer>>> = Arc::new(Mutex::new(None));

        let counter = attempts.clone();
        let slot_for_attempt = slot.clone();
        let timer = RetryTimer::new(Duration::from_secs(1), move || {
            let counter = counter.clone();
            let slot = slot_for_attempt.clone();
            async move {
                // Fail the first two attempts
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    if let Some(timer) = slot.lock().unwrap().as_ref() {
                        assert!(timer.try_again());
                    }
                }
            }
        });
        *slot.lock().unwrap() = Some(timer.clone());

        timer.try_again();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(!timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let (timer, attempts) = counting_timer(Duration::from_secs(1));

        assert!(!timer.cancel());
        timer.try_again();
        assert!(timer.cancel());
        assert!(!timer.is_pending());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }
}
