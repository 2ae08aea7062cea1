use std::{
    io,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use fanout_communication::{Blob, BlobQueue, Counters, PopError, PushError};
use fanout_network::{DestSender, SendError, SocketSpec, SpecError};
use fanout_timing::Backoff;
use thiserror::Error;
use tracing::{Level, debug, info, span, warn};

use crate::{config::Config, control::Control, spill::DiskWriter};

/// Head-of-queue items handed to the spill sibling per stall.
pub const SPILL_BATCH_MAX: usize = 1024;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}

/// The knobs a destination worker runs with, frozen at creation time.
#[derive(Clone, Debug)]
pub struct WorkerTuning {
    pub polling_interval: Duration,
    /// Blob age past which a failing destination's backlog goes to disk.
    pub spill: Duration,
    pub send_deadline: Duration,
    pub connect_timeout: Duration,
    pub backoff_cap: Duration,
    pub queue_cap: usize,
}

impl WorkerTuning {
    pub fn from_config(config: &Config) -> Self {
        Self {
            polling_interval: config.polling_interval,
            spill: config.spill,
            // tcp_send_timeout caps a single send even when the spill
            // threshold is longer
            send_deadline: config.spill.min(config.tcp_send_timeout),
            connect_timeout: config.tcp_send_timeout,
            backoff_cap: config.sleep_after_disaster,
            queue_cap: config.queue_cap,
        }
    }
}

/// Handle to one destination worker thread and its spill sibling.
pub struct SocketWorker {
    spec: SocketSpec,
    queue: Arc<BlobQueue>,
    spill_queue: Arc<BlobQueue>,
    counters: Arc<Counters>,
    exit: Arc<AtomicBool>,
    thread: JoinHandle<()>,
    writer: DiskWriter,
}

impl SocketWorker {
    /// Creates the worker pair (sender thread + disk writer). An
    /// unresolvable destination fails here, before any thread starts, so
    /// the pool can report partial startup.
    pub fn spawn(
        spec: SocketSpec,
        fallback_root: &Path,
        tuning: &WorkerTuning,
        control: Arc<Control>,
    ) -> Result<Self, WorkerError> {
        spec.resolve()?;

        let queue = Arc::new(BlobQueue::bounded(tuning.queue_cap));
        let spill_queue = Arc::new(BlobQueue::bounded(tuning.queue_cap));
        let counters = Arc::new(Counters::default());
        let exit = Arc::new(AtomicBool::new(false));

        let writer = DiskWriter::spawn(
            fallback_root.join(spec.dir_component()),
            Arc::clone(&spill_queue),
            Arc::clone(&counters),
        )?;

        let worker = WorkerLoop {
            sender: DestSender::new(spec.clone()),
            queue: Arc::clone(&queue),
            spill_queue: Arc::clone(&spill_queue),
            counters: Arc::clone(&counters),
            exit: Arc::clone(&exit),
            control,
            backoff: Backoff::new(tuning.polling_interval, tuning.backoff_cap),
            tuning: tuning.clone(),
        };
        let thread = thread::Builder::new()
            .name(format!("w-{}", spec.port))
            .spawn(move || worker.run())?;

        Ok(Self { spec, queue, spill_queue, counters, exit, thread, writer })
    }

    pub fn spec(&self) -> &SocketSpec {
        &self.spec
    }

    pub fn queue(&self) -> &Arc<BlobQueue> {
        &self.queue
    }

    pub fn spill_queue(&self) -> &Arc<BlobQueue> {
        &self.spill_queue
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    /// Stops the worker, then its spill sibling, joining both. Queued
    /// blobs are drained to disk first, so nothing in flight is lost
    /// silently.
    pub fn stop(self) {
        self.exit.store(true, Ordering::Relaxed);
        self.queue.cancel();
        if self.thread.join().is_err() {
            warn!(dest = %self.spec, "worker thread panicked");
        }
        self.writer.stop();
    }
}

struct WorkerLoop {
    sender: DestSender,
    queue: Arc<BlobQueue>,
    spill_queue: Arc<BlobQueue>,
    counters: Arc<Counters>,
    exit: Arc<AtomicBool>,
    control: Arc<Control>,
    backoff: Backoff,
    tuning: WorkerTuning,
}

impl WorkerLoop {
    fn stopping(&self) -> bool {
        self.control.stopping() || self.exit.load(Ordering::Relaxed)
    }

    fn run(mut self) {
        let _span = span!(Level::INFO, "worker", dest = %self.sender.spec()).entered();
        info!("destination worker up");
        let mut held: Option<Blob> = None;
        loop {
            if self.stopping() {
                break;
            }
            let blob = match held.take() {
                Some(blob) => blob,
                None => match self.queue.pop(self.tuning.polling_interval) {
                    Ok(blob) => blob,
                    Err(PopError::Empty) => continue,
                    Err(PopError::Cancelled) => break,
                },
            };
            held = self.dispatch(blob);
        }
        self.drain_to_spill(held.take());
        info!("destination worker down");
    }

    /// One delivery attempt. Hands the blob back when it should be retried
    /// on the next iteration.
    fn dispatch(&mut self, blob: Blob) -> Option<Blob> {
        if !self.sender.is_connected() {
            if let Err(err) = self.sender.connect(self.tuning.connect_timeout) {
                debug!(?err, "connect failed");
                Counters::inc(&self.counters.error_count, 1);
                let held = self.spill_if_stalled(blob);
                thread::sleep(self.backoff.next_delay());
                return held;
            }
        }
        match self.sender.send(blob.payload(), self.tuning.send_deadline) {
            Ok(elapsed) => {
                Counters::inc(&self.counters.sent_count, 1);
                Counters::inc(&self.counters.send_elapsed_usec, elapsed.as_micros() as u64);
                self.backoff.reset();
                None
            }
            Err(err) => {
                if matches!(err, SendError::Partial { .. }) {
                    Counters::inc(&self.counters.partial_count, 1);
                }
                debug!(?err, blob = blob.id(), "send failed");
                Counters::inc(&self.counters.error_count, 1);
                // Mid-frame state is unrecoverable; reconnect lazily on the
                // next iteration.
                self.sender.close();
                self.spill_if_stalled(blob)
            }
        }
    }

    /// The stall watchdog: a blob still undelivered past the spill
    /// threshold takes the head of the backlog to disk with it. Younger
    /// blobs stay held for another attempt.
    fn spill_if_stalled(&mut self, blob: Blob) -> Option<Blob> {
        if blob.age() < self.tuning.spill {
            return Some(blob);
        }
        self.spill_one(blob);
        let (moved, dropped) = self.queue.drain_into(&self.spill_queue, SPILL_BATCH_MAX);
        Counters::inc(&self.counters.spilled_count, moved as u64);
        Counters::inc(&self.counters.dropped_count, dropped as u64);
        None
    }

    fn spill_one(&self, blob: Blob) {
        match self.spill_queue.push(blob) {
            Ok(()) => Counters::inc(&self.counters.spilled_count, 1),
            Err(PushError::Full(_)) => Counters::inc(&self.counters.dropped_count, 1),
        }
    }

    /// Exit path: whatever is still queued goes to the spill sibling, which
    /// drains to disk before joining.
    fn drain_to_spill(&self, held: Option<Blob>) {
        if let Some(blob) = held {
            self.spill_one(blob);
        }
        while let Ok(blob) = self.queue.pop(Duration::ZERO) {
            self.spill_one(blob);
        }
    }
}
