//! Monotonic time and retry/abort timers
//!
//! Every retry loop and deadline in the protocol is a [`Timer`] reading a
//! shared [`Clock`]. Production code uses [`SystemClock`]; state machine tests
//! drive a [`ManualClock`] forward explicitly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Source of monotonic time, measured from an arbitrary origin
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Wall-clock time elapsed since the clock was created
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }
}

/// A single retry or deadline timer
#[derive(Clone)]
pub struct Timer {
    clock: Arc<dyn Clock>,
    start: Duration,
    timeout: Duration,
}

impl Timer {
    /// Start a timer that fires `timeout` from now
    pub fn new(clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        let start = clock.now();
        Self {
            clock,
            start,
            timeout,
        }
    }

    /// Whether at least `timeout` has elapsed since the last reset
    pub fn is_time(&self) -> bool {
        self.clock.now().saturating_sub(self.start) >= self.timeout
    }

    pub fn reset_timer(&mut self) {
        self.start = self.clock.now();
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("start", &self.start)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Builds timers that share one clock
#[derive(Clone)]
pub struct TimerFactory {
    clock: Arc<dyn Clock>,
}

impl TimerFactory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock::new()))
    }

    pub fn create(&self, timeout: Duration) -> Timer {
        Timer::new(Arc::clone(&self.clock), timeout)
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }
}

impl std::fmt::Debug for TimerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerFactory").field("now", &self.clock.now()).finish()
    }
}
