//! Timer driver: a single background task that acquires the
//! stack lock, drives the embedded stack's timeout processing, releases the
//! lock, sleeps for a fixed interval, and repeats until asked to stop.
//!
//! The task is a `tokio::spawn`'d loop selecting on a ticker, tracked through
//! a `JoinHandle` so `stop` can abort it, with two stop modes: an immediate
//! stop and a delayed one that only takes effect if nothing restarts the
//! timer first.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(250);
pub const DELAYED_STOP_DELAY: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Stops the tick task synchronously.
    Instant,
    /// Defers the stop by 30 minutes; a fresh `start_timeouts` call before
    /// then cancels it.
    Delayed,
}

struct Inner {
    tick_fn: Arc<dyn Fn() + Send + Sync>,
    running: AtomicBool,
    generation: AtomicU64,
    tick_task: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn stop_now(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.tick_task.lock().take() {
            handle.abort();
        }
    }
}

/// Drives `tick_fn` on a fixed interval from its own task. `tick_fn` is
/// expected to acquire the stack lock itself, do its work, and release it
/// before returning — the driver holds no lock of its own.
pub struct TimerDriver {
    inner: Arc<Inner>,
    delayed_stop_task: Mutex<Option<JoinHandle<()>>>,
}

impl TimerDriver {
    pub fn new(tick_fn: Arc<dyn Fn() + Send + Sync>) -> Self {
        Self {
            inner: Arc::new(Inner {
                tick_fn,
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                tick_task: Mutex::new(None),
            }),
            delayed_stop_task: Mutex::new(None),
        }
    }

    /// Starts the tick task if it isn't already running, and cancels any
    /// pending delayed stop.
    pub fn start_timeouts(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.delayed_stop_task.lock().take() {
            handle.abort();
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DEFAULT_TICK_INTERVAL);
            loop {
                ticker.tick().await;
                if !inner.running.load(Ordering::SeqCst) {
                    break;
                }
                (inner.tick_fn)();
            }
        });
        *self.inner.tick_task.lock() = Some(handle);
    }

    pub fn stop_timeouts(&self, mode: StopMode) {
        match mode {
            StopMode::Instant => {
                self.inner.generation.fetch_add(1, Ordering::SeqCst);
                if let Some(handle) = self.delayed_stop_task.lock().take() {
                    handle.abort();
                }
                self.inner.stop_now();
            }
            StopMode::Delayed => {
                let my_generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let inner = Arc::clone(&self.inner);
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(DELAYED_STOP_DELAY).await;
                    if inner.generation.load(Ordering::SeqCst) == my_generation {
                        inner.stop_now();
                    }
                });
                *self.delayed_stop_task.lock() = Some(handle);
            }
        }
    }

    /// Equivalent to `start_timeouts`: ensures the tick task is running and
    /// clears any pending delayed stop.
    pub fn restart_timeouts(&self) {
        self.start_timeouts();
    }

    pub fn get_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn delayed_stop_cancelled_by_fresh_start() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = Arc::clone(&ticks);
        let timer = TimerDriver::new(Arc::new(move || {
            ticks_clone.fetch_add(1, Ordering::SeqCst);
        }));

        timer.start_timeouts();
        timer.stop_timeouts(StopMode::Delayed);
        timer.start_timeouts();

        tokio::time::advance(DELAYED_STOP_DELAY + Duration::from_secs(1)).await;
        tokio::task::yield_now().await;

        assert!(timer.get_running());
    }

    #[tokio::test(start_paused = true)]
    async fn instant_stop_halts_ticking() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = Arc::clone(&ticks);
        let timer = TimerDriver::new(Arc::new(move || {
            ticks_clone.fetch_add(1, Ordering::SeqCst);
        }));

        timer.start_timeouts();
        tokio::time::advance(DEFAULT_TICK_INTERVAL * 2).await;
        tokio::task::yield_now().await;
        timer.stop_timeouts(StopMode::Instant);

        assert!(!timer.get_running());
    }
}
