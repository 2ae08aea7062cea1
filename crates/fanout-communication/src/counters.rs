use std::sync::atomic::{AtomicU64, Ordering};

/// Per-worker (and listener-global) relay statistics.
///
/// Every field except the `tcp_connections` gauge is monotonic. Fields are
/// individually atomic; a snapshot is not transactional across fields, which
/// is fine because every reader is advisory.
#[derive(Debug, Default)]
pub struct Counters {
    /// Blobs accepted by the listener.
    pub received_count: AtomicU64,
    /// Blobs fully written to a destination socket.
    pub sent_count: AtomicU64,
    /// Blobs a send moved partially before the deadline; treated as failed.
    pub partial_count: AtomicU64,
    /// Blobs diverted to the disk spill sibling.
    pub spilled_count: AtomicU64,
    /// Blobs discarded outright (queues full, spill unusable, pps limit).
    pub dropped_count: AtomicU64,
    /// Send failures that triggered a reconnect.
    pub error_count: AtomicU64,
    /// Blobs appended to a spill file.
    pub disk_count: AtomicU64,
    /// Spill writes that failed.
    pub disk_error_count: AtomicU64,
    /// Cumulative microseconds spent inside send calls.
    pub send_elapsed_usec: AtomicU64,
    /// Gauge: currently open inbound TCP connections.
    pub tcp_connections: AtomicU64,
}

macro_rules! snapshot_fields {
    ($($field:ident),+ $(,)?) => {
        impl Counters {
            pub fn snapshot(&self) -> CountersSnapshot {
                CountersSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)+
                }
            }
        }

        /// Plain copy of [`Counters`] at one point in time.
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
        pub struct CountersSnapshot {
            $(pub $field: u64,)+
        }

        impl CountersSnapshot {
            /// Field-wise `self - earlier`, for rate windows. The gauge is
            /// carried over as-is rather than differenced.
            pub fn delta(&self, earlier: &Self) -> Self {
                let mut delta = Self {
                    $($field: self.$field.saturating_sub(earlier.$field),)+
                };
                delta.tcp_connections = self.tcp_connections;
                delta
            }

            /// Field-wise accumulate, for totals across workers.
            pub fn accumulate(&mut self, other: &Self) {
                $(self.$field = self.$field.saturating_add(other.$field);)+
            }

            /// Stable (name, value) pairs, the order the stats emitter
            /// publishes them in.
            pub fn fields(&self) -> [(&'static str, u64); 10] {
                [$((stringify!($field), self.$field),)+]
            }
        }
    };
}

snapshot_fields!(
    received_count,
    sent_count,
    partial_count,
    spilled_count,
    dropped_count,
    error_count,
    disk_count,
    disk_error_count,
    send_elapsed_usec,
    tcp_connections,
);

impl Counters {
    #[inline]
    pub fn inc(field: &AtomicU64, n: u64) {
        field.fetch_add(n, Ordering::Relaxed);
    }

    /// Gauge decrement; saturates at zero rather than wrapping.
    #[inline]
    pub fn dec(field: &AtomicU64, n: u64) {
        let _ = field.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(n))
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn snapshot_copies_fields() {
        let c = Counters::default();
        Counters::inc(&c.received_count, 3);
        Counters::inc(&c.sent_count, 2);
        let snap = c.snapshot();
        assert_eq!(snap.received_count, 3);
        assert_eq!(snap.sent_count, 2);
        assert_eq!(snap.dropped_count, 0);
    }

    #[test]
    fn delta_subtracts_but_keeps_gauge() {
        let c = Counters::default();
        Counters::inc(&c.sent_count, 5);
        Counters::inc(&c.tcp_connections, 2);
        let early = c.snapshot();
        Counters::inc(&c.sent_count, 7);
        Counters::dec(&c.tcp_connections, 1);
        let late = c.snapshot();
        let d = late.delta(&early);
        assert_eq!(d.sent_count, 7);
        assert_eq!(d.tcp_connections, 1);
    }

    #[test]
    fn gauge_dec_saturates() {
        let c = Counters::default();
        Counters::dec(&c.tcp_connections, 1);
        assert_eq!(c.snapshot().tcp_connections, 0);
    }

    #[test]
    fn accumulate_sums_workers() {
        let mut total = CountersSnapshot::default();
        let c = Counters::default();
        Counters::inc(&c.sent_count, 4);
        total.accumulate(&c.snapshot());
        total.accumulate(&c.snapshot());
        assert_eq!(total.sent_count, 8);
    }

    #[test]
    fn fields_cover_every_counter() {
        let snap = CountersSnapshot::default();
        let names: Vec<_> = snap.fields().iter().map(|(n, _)| *n).collect();
        assert!(names.contains(&"received_count"));
        assert!(names.contains(&"tcp_connections"));
        assert_eq!(names.len(), 10);
    }
}
