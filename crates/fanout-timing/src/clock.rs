use once_cell::sync::OnceCell;
use quanta::Clock;

static GLOBAL_CLOCK: OnceCell<Clock> = OnceCell::new();

/// Process-global monotonic clock.
///
/// Calibration happens once, on first use; every thread after that reads
/// the same clock so timestamps taken on different threads are comparable.
#[inline]
pub fn clock() -> &'static Clock {
    GLOBAL_CLOCK.get_or_init(Clock::new)
}

#[inline]
pub fn now() -> quanta::Instant {
    clock().now()
}

/// Wall-clock seconds since the unix epoch.
///
/// Only for externally visible stamps (spill file names, graphite lines).
/// Never use this for stall or reconnect decisions.
#[inline]
pub fn epoch_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
