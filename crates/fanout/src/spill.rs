use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use fanout_communication::{Blob, BlobQueue, Counters, PopError};
use fanout_network::LEN_HEADER_SIZE;
use fanout_utils::ensure_dir;
use tracing::{Level, debug, info, span, warn};

/// Rotation limits for one spill file.
const MAX_FILE_BLOBS: u64 = 4096;
const MAX_FILE_BYTES: u64 = 16 * 1024 * 1024;

const POP_TIMEOUT: Duration = Duration::from_millis(100);

/// Disk-spill sibling of one destination worker.
///
/// Drains the spill queue into framed files under the destination's
/// directory: each blob is `{u32 LE length, payload}`, the exact inbound
/// TCP framing, so concatenated spill files replay through any TCP sender.
/// Write errors drop the blob and count `disk_error_count`; the writer
/// never retries and never blocks the worker feeding it.
pub struct DiskWriter {
    exit: Arc<AtomicBool>,
    queue: Arc<BlobQueue>,
    thread: JoinHandle<()>,
}

impl DiskWriter {
    pub fn spawn(
        dir: PathBuf,
        queue: Arc<BlobQueue>,
        counters: Arc<Counters>,
    ) -> io::Result<Self> {
        let exit = Arc::new(AtomicBool::new(false));
        let writer = WriterLoop {
            dir,
            queue: Arc::clone(&queue),
            counters,
            exit: Arc::clone(&exit),
            file: None,
            file_blobs: 0,
            file_bytes: 0,
            file_minute: 0,
            seq: 0,
        };
        let thread = thread::Builder::new().name("spill".into()).spawn(move || writer.run())?;
        Ok(Self { exit, queue, thread })
    }

    /// Signals exit, wakes the writer, and joins once the already-queued
    /// backlog has been flushed to disk.
    pub fn stop(self) {
        self.exit.store(true, Ordering::Relaxed);
        self.queue.cancel();
        if self.thread.join().is_err() {
            warn!("spill writer thread panicked");
        }
    }
}

struct WriterLoop {
    dir: PathBuf,
    queue: Arc<BlobQueue>,
    counters: Arc<Counters>,
    exit: Arc<AtomicBool>,
    file: Option<File>,
    file_blobs: u64,
    file_bytes: u64,
    file_minute: i64,
    seq: u32,
}

impl WriterLoop {
    fn run(mut self) {
        let _span = span!(Level::INFO, "spill", dir = %self.dir.display()).entered();
        loop {
            match self.queue.pop(POP_TIMEOUT) {
                Ok(blob) => self.write_blob(&blob),
                // Cancelled only surfaces once the queue is empty, so the
                // backlog present at cancel time always reaches disk.
                Err(PopError::Cancelled) => break,
                Err(PopError::Empty) => {
                    if self.exit.load(Ordering::Relaxed) {
                        break;
                    }
                }
            }
        }
        if let Some(file) = &mut self.file {
            let _ = file.sync_all();
        }
        info!(written = self.counters.disk_count.load(Ordering::Relaxed), "spill writer down");
    }

    fn write_blob(&mut self, blob: &Blob) {
        let frame_len = (LEN_HEADER_SIZE + blob.len()) as u64;
        match self.append(blob, frame_len) {
            Ok(()) => {
                Counters::inc(&self.counters.disk_count, 1);
                self.file_blobs += 1;
                self.file_bytes += frame_len;
            }
            Err(err) => {
                warn!(?err, blob = blob.id(), "spill write failed");
                Counters::inc(&self.counters.disk_error_count, 1);
                Counters::inc(&self.counters.dropped_count, 1);
                // A half-written frame would corrupt the file; reopen fresh
                // on the next blob.
                self.file = None;
            }
        }
    }

    fn append(&mut self, blob: &Blob, frame_len: u64) -> io::Result<()> {
        self.rotate_if_needed(frame_len)?;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        file.write_all(&(blob.len() as u32).to_le_bytes())?;
        file.write_all(blob.payload())?;
        Ok(())
    }

    /// Opens a new file when none is open, the blob/byte limits are hit,
    /// or the wall-clock minute rolled over. Names are
    /// `{epoch_secs}-{seq}.spill`, unique per destination directory.
    fn rotate_if_needed(&mut self, incoming: u64) -> io::Result<()> {
        let minute = fanout_timing::epoch_secs() / 60;
        let reopen = match self.file {
            None => true,
            Some(_) => {
                self.file_blobs >= MAX_FILE_BLOBS
                    || self.file_bytes + incoming > MAX_FILE_BYTES
                    || minute != self.file_minute
            }
        };
        if !reopen {
            return Ok(());
        }
        ensure_dir(&self.dir)?;
        let path = self.dir.join(format!("{}-{:04}.spill", fanout_timing::epoch_secs(), self.seq));
        self.seq = self.seq.wrapping_add(1);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), "spill file opened");
        self.file = Some(file);
        self.file_blobs = 0;
        self.file_bytes = 0;
        self.file_minute = minute;
        Ok(())
    }
}
