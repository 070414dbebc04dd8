//! Deterministic time seam for the activation engine.
//!
//! The activation worker (see [`crate::activation`]) sleeps at fixed,
//! contractually-bounded durations (association pauses, radio settle delays,
//! key-wait and cancel-wait polling). Routing every sleep through a [`Clock`]
//! lets tests assert those durations at minute granularity without actually
//! waiting, by swapping in [`MockClock`].

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Abstracts over real and mocked time for the activation worker.
pub trait Clock: Send + Sync + 'static {
    /// Block the calling thread for `dur`, or until `cancelled` fires.
    ///
    /// Returns `true` if the sleep ran to completion, `false` if cancellation
    /// interrupted it early.
    fn sleep(&self, dur: Duration, cancelled: &CancelFlag) -> bool;

    fn now(&self) -> Instant;
}

/// Real wall-clock implementation used outside of tests.
#[derive(Default, Clone, Copy, Debug)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, dur: Duration, cancelled: &CancelFlag) -> bool {
        !cancelled.wait_timeout(dur)
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Cooperative cancellation flag shared between the owning thread and an
/// activation worker.
///
/// Modelled as an atomic boolean plus a condition variable (per the design
/// notes): setting the flag wakes any thread blocked in [`Clock::sleep`]
/// immediately, rather than waiting out a poll interval.
#[derive(Clone)]
pub struct CancelFlag {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self { inner: Arc::new((Mutex::new(false), Condvar::new())) }
    }

    /// Set the flag. Idempotent: a second call is a no-op.
    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        let mut cancelled = lock.lock().unwrap();
        *cancelled = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap()
    }

    /// Wait up to `dur` for cancellation. Returns `true` if cancelled before
    /// the timeout elapsed, `false` if the timeout elapsed first.
    fn wait_timeout(&self, dur: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap();
        if *guard {
            return true;
        }
        let (guard, _) = cvar.wait_timeout(guard, dur).unwrap();
        *guard
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Virtual clock for tests: `sleep` advances an internal counter instead of
/// blocking, so assertions about association-pause/settle-delay durations run
/// at minute granularity instantly.
#[derive(Default)]
pub struct MockClock {
    elapsed: Mutex<Duration>,
}

impl MockClock {
    pub fn new() -> Self {
        Self { elapsed: Mutex::new(Duration::ZERO) }
    }

    /// Total duration requested across all `sleep` calls so far.
    pub fn total_elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap()
    }
}

impl Clock for MockClock {
    fn sleep(&self, dur: Duration, cancelled: &CancelFlag) -> bool {
        *self.elapsed.lock().unwrap() += dur;
        !cancelled.is_cancelled()
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn mock_clock_records_requested_duration_without_blocking() {
        let clock = MockClock::new();
        let cancelled = CancelFlag::new();

        let start = Instant::now();
        assert!(clock.sleep(Duration::from_secs(10), &cancelled));
        assert!(start.elapsed() < Duration::from_millis(50));

        assert_eq!(clock.total_elapsed(), Duration::from_secs(10));
    }

    #[test]
    fn cancel_flag_wakes_sleeping_thread_immediately() {
        let cancelled = CancelFlag::new();
        let clock = SystemClock;

        let waiter = cancelled.clone();
        let handle = thread::spawn(move || clock.sleep(Duration::from_secs(30), &waiter));

        thread::sleep(Duration::from_millis(20));
        cancelled.cancel();

        let completed = handle.join().unwrap();
        assert!(!completed);
    }

    #[test]
    fn cancel_is_idempotent() {
        let cancelled = CancelFlag::new();
        cancelled.cancel();
        cancelled.cancel();
        assert!(cancelled.is_cancelled());
    }
}
