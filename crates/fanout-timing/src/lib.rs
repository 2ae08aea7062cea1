mod backoff;
mod clock;
mod pace;
mod repeater;

pub use backoff::Backoff;
pub use clock::{clock, epoch_secs, now};
pub use pace::IngressPace;
pub use repeater::Repeater;

/// Monotonic timestamp used for all stall/reconnect decisions.
pub type Instant = quanta::Instant;
