use std::time::Duration;

/// Exponential reconnect backoff.
///
/// Starts at `floor`, doubles on every consecutive failure, saturates at
/// `cap`. `reset` on the first success.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    floor: Duration,
    cap: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, cap: Duration) -> Self {
        let cap = cap.max(floor);
        Self { floor, cap, next: floor }
    }

    /// The delay to sleep before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.cap);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.floor;
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }
}
