mod blob;
mod counters;
mod error;
mod queue;

pub use blob::{Blob, MAX_CHUNK_SIZE};
pub use counters::{Counters, CountersSnapshot};
pub use error::{PopError, PushError};
pub use queue::BlobQueue;
