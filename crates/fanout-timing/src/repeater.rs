use std::time::Duration;

use crate::{Instant, now};

/// Fires at most once per interval, on the monotonic clock.
#[derive(Clone, Copy, Debug)]
pub struct Repeater {
    interval: Duration,
    // None means the next check fires immediately.
    last_acted: Option<Instant>,
}

impl Repeater {
    #[inline]
    pub fn every(interval: Duration) -> Self {
        Self { interval, last_acted: None }
    }

    #[inline]
    pub fn fired(&mut self) -> bool {
        match self.last_acted {
            Some(last) if now().duration_since(last) < self.interval => false,
            _ => {
                self.last_acted = Some(now());
                true
            }
        }
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn reset(&mut self) {
        self.last_acted = Some(now());
    }

    pub fn force_fire(&mut self) {
        self.last_acted = None;
    }
}
