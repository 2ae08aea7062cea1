use std::{
    collections::VecDeque,
    sync::{
        Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use crate::{Blob, PopError, PushError};

struct Inner {
    items: VecDeque<Blob>,
    cancelled: bool,
    hiwater: usize,
}

/// Bounded FIFO of blob handles, one per destination worker and one per
/// spill writer.
///
/// Internally a mutex + condvar; the lock is held only for the push/pop
/// itself, never across a send or a disk write. The capacity is a soft cap:
/// a push beyond it hands the blob back and the caller decides whether to
/// divert it to the spill sibling or drop it.
///
/// Cancellation is one-way. A cancelled queue rejects new pushes and wakes
/// every blocked popper, but items already queued can still be popped, so
/// shutdown paths drain rather than discard.
pub struct BlobQueue {
    inner: Mutex<Inner>,
    available: Condvar,
    cap: usize,
    bytes_enqueued: AtomicU64,
}

impl BlobQueue {
    pub fn bounded(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                cancelled: false,
                hiwater: 0,
            }),
            available: Condvar::new(),
            cap,
            bytes_enqueued: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned queue lock only means a peer thread panicked between
        // push/pop bookkeeping; the VecDeque itself is still consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, blob: Blob) -> Result<(), PushError> {
        let mut inner = self.lock();
        if inner.cancelled || inner.items.len() >= self.cap {
            return Err(PushError::Full(blob));
        }
        self.bytes_enqueued.fetch_add(blob.len() as u64, Ordering::Relaxed);
        inner.items.push_back(blob);
        inner.hiwater = inner.hiwater.max(inner.items.len());
        drop(inner);
        self.available.notify_one();
        Ok(())
    }

    /// `Duration::ZERO` is a non-blocking poll; anything else suspends on
    /// the condvar until an item arrives, the timeout elapses, or the queue
    /// is cancelled.
    pub fn pop(&self, timeout: Duration) -> Result<Blob, PopError> {
        let deadline = fanout_timing::now() + timeout;
        let mut inner = self.lock();
        loop {
            if let Some(blob) = inner.items.pop_front() {
                return Ok(blob);
            }
            if inner.cancelled {
                return Err(PopError::Cancelled);
            }
            let remaining = deadline.duration_since(fanout_timing::now());
            if remaining.is_zero() {
                return Err(PopError::Empty);
            }
            let (guard, _) = self
                .available
                .wait_timeout(inner, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;
        }
    }

    /// Moves up to `max` head-of-queue items into `other`, preserving FIFO
    /// order. Items `other` cannot take are dropped. Returns (moved,
    /// dropped); neither queue's lock is held while touching the other.
    pub fn drain_into(&self, other: &BlobQueue, max: usize) -> (usize, usize) {
        let batch: Vec<Blob> = {
            let mut inner = self.lock();
            let take = max.min(inner.items.len());
            inner.items.drain(..take).collect()
        };
        let mut moved = 0;
        let mut dropped = 0;
        for blob in batch {
            match other.push(blob) {
                Ok(()) => moved += 1,
                Err(PushError::Full(_)) => dropped += 1,
            }
        }
        (moved, dropped)
    }

    /// Wakes every blocked popper and rejects all future pushes.
    pub fn cancel(&self) {
        self.lock().cancelled = true;
        self.available.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deepest the queue has ever been.
    pub fn hiwater(&self) -> usize {
        self.lock().hiwater
    }

    /// Total payload bytes ever accepted, monotonic.
    pub fn bytes_enqueued(&self) -> u64 {
        self.bytes_enqueued.load(Ordering::Relaxed)
    }

    /// Age of the item at the head, if any.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.lock().items.front().map(Blob::age)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn blob(byte: u8) -> Blob {
        Blob::copy_from(&[byte])
    }

    #[test]
    fn fifo_order() {
        let q = BlobQueue::bounded(16);
        for i in 0..10u8 {
            q.push(blob(i)).unwrap();
        }
        assert_eq!(q.bytes_enqueued(), 10);
        for i in 0..10u8 {
            assert_eq!(q.pop(Duration::ZERO).unwrap().payload(), &[i]);
        }
        assert!(matches!(q.pop(Duration::ZERO), Err(PopError::Empty)));
    }

    #[test]
    fn push_beyond_cap_returns_blob() {
        let q = BlobQueue::bounded(2);
        q.push(blob(0)).unwrap();
        q.push(blob(1)).unwrap();
        let Err(PushError::Full(rejected)) = q.push(blob(2)) else {
            panic!("push past cap accepted");
        };
        assert_eq!(rejected.payload(), &[2]);
        assert_eq!(q.len(), 2);
        assert_eq!(q.hiwater(), 2);
    }

    #[test]
    fn pop_times_out() {
        let q = BlobQueue::bounded(2);
        let started = std::time::Instant::now();
        assert!(matches!(q.pop(Duration::from_millis(20)), Err(PopError::Empty)));
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn cancel_wakes_blocked_popper() {
        let q = std::sync::Arc::new(BlobQueue::bounded(2));
        let q2 = q.clone();
        let popper = std::thread::spawn(move || q2.pop(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(20));
        q.cancel();
        assert!(matches!(popper.join().unwrap(), Err(PopError::Cancelled)));
    }

    #[test]
    fn cancelled_queue_still_drains() {
        let q = BlobQueue::bounded(4);
        q.push(blob(1)).unwrap();
        q.cancel();
        assert!(matches!(q.push(blob(2)), Err(PushError::Full(_))));
        assert_eq!(q.pop(Duration::ZERO).unwrap().payload(), &[1]);
        assert!(matches!(q.pop(Duration::ZERO), Err(PopError::Cancelled)));
    }

    #[test]
    fn oldest_age_tracks_the_head() {
        let q = BlobQueue::bounded(4);
        assert!(q.oldest_age().is_none());
        q.push(blob(0)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        q.push(blob(1)).unwrap();
        let age = q.oldest_age().unwrap();
        assert!(age >= Duration::from_millis(4), "head age {age:?}");
        let _ = q.pop(Duration::ZERO).unwrap();
        assert!(q.oldest_age().unwrap() < age);
    }

    #[test]
    fn drain_into_preserves_order_and_counts_overflow() {
        let src = BlobQueue::bounded(16);
        let dst = BlobQueue::bounded(2);
        for i in 0..5u8 {
            src.push(blob(i)).unwrap();
        }
        let (moved, dropped) = src.drain_into(&dst, 4);
        assert_eq!((moved, dropped), (2, 2));
        assert_eq!(src.len(), 1);
        assert_eq!(dst.pop(Duration::ZERO).unwrap().payload(), &[0]);
        assert_eq!(dst.pop(Duration::ZERO).unwrap().payload(), &[1]);
        assert_eq!(src.pop(Duration::ZERO).unwrap().payload(), &[4]);
    }

    #[test]
    fn multithread_producers_consumers() {
        let q = std::sync::Arc::new(BlobQueue::bounded(1024));
        const PER_PRODUCER: usize = 5_000;
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;

        let consumed = std::sync::Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..CONSUMERS {
            let q = q.clone();
            let consumed = consumed.clone();
            handles.push(std::thread::spawn(move || {
                loop {
                    match q.pop(Duration::from_millis(10)) {
                        Ok(_) => {
                            consumed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(PopError::Empty) => {}
                        Err(PopError::Cancelled) => break,
                    }
                }
            }));
        }
        let mut producers = Vec::new();
        for _ in 0..PRODUCERS {
            let q = q.clone();
            producers.push(std::thread::spawn(move || {
                let mut pushed = 0;
                while pushed < PER_PRODUCER {
                    if q.push(Blob::copy_from(b"payload")).is_ok() {
                        pushed += 1;
                    } else {
                        std::thread::yield_now();
                    }
                }
            }));
        }
        for p in producers {
            p.join().unwrap();
        }
        // Let the consumers finish the tail, then wake them for exit.
        while consumed.load(Ordering::Relaxed) < (PRODUCERS * PER_PRODUCER) as u64 {
            std::thread::sleep(Duration::from_millis(1));
        }
        q.cancel();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(consumed.load(Ordering::Relaxed), (PRODUCERS * PER_PRODUCER) as u64);
    }
}
