//! Election timer and heartbeat ticker.

use crate::shutdown::ShutdownSignal;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};

/// Pick an election timeout uniformly in `[min, max]`.
pub(crate) fn random_timeout(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let ms = rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64);
    Duration::from_millis(ms)
}

/// Resettable one-shot election timer.
///
/// The deadline is shared with the task spawned by [`ElectionTimer::spawn`],
/// so pushing it back never needs a message round trip.
pub(crate) struct ElectionTimer {
    deadline: Arc<Mutex<Instant>>,
    min: Duration,
    max: Duration,
}

impl ElectionTimer {
    pub(crate) fn new(min: Duration, max: Duration) -> Self {
        Self {
            deadline: Arc::new(Mutex::new(Instant::now() + random_timeout(min, max))),
            min,
            max,
        }
    }

    /// Push the deadline to a fresh random timeout from now.
    pub(crate) fn reset(&self) {
        *self.deadline.lock() = Instant::now() + random_timeout(self.min, self.max);
    }

    /// Run the timer until it expires (calling `on_expire` once) or `signal` fires.
    pub(crate) fn spawn<F>(&self, signal: ShutdownSignal, on_expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Arc::clone(&self.deadline);
        tokio::spawn(async move {
            loop {
                let target = *deadline.lock();
                tokio::select! {
                    _ = signal.cancelled() => return,
                    _ = sleep_until(target) => {}
                }
                // The deadline may have been pushed back while we slept.
                if Instant::now() >= *deadline.lock() {
                    break;
                }
            }
            if !signal.is_triggered() {
                on_expire();
            }
        });
    }
}

/// Call `on_tick` every `period` until `signal` fires. The first tick is one period out.
pub(crate) fn spawn_ticker<F>(period: Duration, signal: ShutdownSignal, on_tick: F)
where
    F: Fn() + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = signal.cancelled() => return,
                _ = ticker.tick() => on_tick(),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_random_timeout_bounds() {
        let min = Duration::from_millis(150);
        let max = Duration::from_millis(300);
        for _ in 0..100 {
            let t = random_timeout(min, max);
            assert!(t >= min && t <= max);
        }
        assert_eq!(random_timeout(max, min), max);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once() {
        let timer = ElectionTimer::new(Duration::from_millis(100), Duration::from_millis(100));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        timer.spawn(ShutdownSignal::new(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_pushes_deadline_back() {
        let timer = ElectionTimer::new(Duration::from_millis(100), Duration::from_millis(100));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        timer.spawn(ShutdownSignal::new(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            timer.reset();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let timer = ElectionTimer::new(Duration::from_millis(100), Duration::from_millis(100));
        let signal = ShutdownSignal::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        timer.spawn(signal.clone(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        signal.trigger();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker() {
        let signal = ShutdownSignal::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        spawn_ticker(Duration::from_millis(50), signal.clone(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(175)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        signal.trigger();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
