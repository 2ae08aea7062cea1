use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use bytes::Bytes;
use fanout_timing::Instant;

/// Upper bound on a single payload, chosen to match the UDP datagram limit.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// One received packet, shared across every destination queue.
///
/// The payload lives in a single heap allocation; `clone` bumps a refcount
/// and the bytes are freed when the last handle drops. Payload bytes are
/// immutable once the listener has built the blob, so readers never lock.
#[derive(Clone, Debug)]
pub struct Blob {
    payload: Bytes,
    born: Instant,
    id: u64,
}

impl Blob {
    /// Copies `buf` into a fresh blob. The one copy on the ingest path.
    /// Callers enforce `0 < len <= MAX_CHUNK_SIZE` at the wire boundary.
    pub fn copy_from(buf: &[u8]) -> Self {
        debug_assert!(
            !buf.is_empty() && buf.len() <= MAX_CHUNK_SIZE,
            "blob of {} bytes",
            buf.len()
        );
        Self {
            payload: Bytes::copy_from_slice(buf),
            born: fanout_timing::now(),
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Monotonic time since the listener accepted this packet.
    #[inline]
    pub fn age(&self) -> Duration {
        fanout_timing::now().duration_since(self.born)
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }
}
