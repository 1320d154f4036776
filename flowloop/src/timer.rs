//! # Tick pacing

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Longest single sleep between stop flag checks.
const SLEEP_SLICE: Duration = Duration::from_millis(5);

/// Delay before the next tick given the time spent on the current one.
///
/// Never negative: a tick that overruns the interval schedules the next one immediately, without
/// trying to catch up.
pub fn next_delay(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

/// Frame interval for a target rate. Non-positive rates disable throttling.
///
/// Returns `None` if the interval is not representable as a `Duration`.
pub fn try_frame_interval(fps: f64) -> Option<Duration> {
    if fps > 0.0 {
        Duration::try_from_secs_f64(1.0 / fps).ok()
    } else {
        Some(Duration::ZERO)
    }
}

/// Frame interval for a target rate, saturating rates too low to represent.
pub fn frame_interval(fps: f64) -> Duration {
    try_frame_interval(fps).unwrap_or(Duration::MAX)
}

/// Measures a single tick.
pub struct Timer {
    start: Instant,
}

impl Default for Timer {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Timer {
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Delay to wait after this tick to keep to `interval`.
    pub fn delay(&self, interval: Duration) -> Duration {
        next_delay(interval, self.elapsed())
    }
}

/// Sleep for `duration`, waking up early if `running` turns false.
///
/// Returns whether the flag was still set at the end of the sleep.
pub fn sleep_while(running: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;

    loop {
        if !running.load(Ordering::Acquire) {
            return false;
        }

        match deadline.checked_duration_since(Instant::now()) {
            Some(left) if !left.is_zero() => std::thread::sleep(left.min(SLEEP_SLICE)),
            _ => return true,
        }
    }
}
