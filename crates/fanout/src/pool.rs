use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use fanout_communication::{Blob, Counters, CountersSnapshot, PushError};
use fanout_network::SocketSpec;
use tracing::{error, info};

use crate::{
    config::Config,
    control::Control,
    worker::{SocketWorker, WorkerTuning},
};

struct PoolState {
    workers: Vec<SocketWorker>,
    tuning: WorkerTuning,
    fallback_root: PathBuf,
}

/// The set of destination workers, shared between the listener (fan-out)
/// and the supervisor (reload/shutdown).
///
/// Fan-out takes the read lock and only touches in-memory queues under it;
/// reload and shutdown take the write lock, so a reload briefly pauses
/// ingestion while workers are diffed.
pub struct WorkerPool {
    state: RwLock<PoolState>,
    control: Arc<Control>,
}

impl WorkerPool {
    /// One worker (plus disk sibling) per destination. A destination that
    /// cannot be created is logged and skipped: partial startup, the rest
    /// of the relay proceeds.
    pub fn start(config: &Config, control: Arc<Control>) -> Arc<Self> {
        let pool = Arc::new(Self {
            state: RwLock::new(PoolState {
                workers: Vec::new(),
                tuning: WorkerTuning::from_config(config),
                fallback_root: config.fallback_root.clone(),
            }),
            control,
        });
        let mut state = pool.write();
        for spec in &config.destinations {
            spawn_into(&mut state, spec, &pool.control);
        }
        info!(workers = state.workers.len(), "worker pool up");
        drop(state);
        pool
    }

    fn read(&self) -> RwLockReadGuard<'_, PoolState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, PoolState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Places one blob on every worker's queue; the payload allocation is
    /// shared, each queue only holds a handle. A full main queue diverts
    /// to that worker's spill queue; a full spill queue drops.
    pub fn fanout(&self, blob: Blob) {
        let state = self.read();
        for worker in &state.workers {
            match worker.queue().push(blob.clone()) {
                Ok(()) => {}
                Err(PushError::Full(rejected)) => match worker.spill_queue().push(rejected) {
                    Ok(()) => Counters::inc(&worker.counters().spilled_count, 1),
                    Err(PushError::Full(_)) => {
                        Counters::inc(&worker.counters().dropped_count, 1);
                    }
                },
            }
        }
    }

    /// Diffs the worker set by destination spec: unchanged workers keep
    /// their thread and queues, removed ones are stopped (their backlog
    /// drains to disk), new ones are created.
    pub fn reload(&self, config: &Config) {
        let mut state = self.write();
        state.tuning = WorkerTuning::from_config(config);
        state.fallback_root = config.fallback_root.clone();

        let wanted: HashSet<String> =
            config.destinations.iter().map(ToString::to_string).collect();
        let mut kept = Vec::new();
        for worker in state.workers.drain(..) {
            if wanted.contains(&worker.spec().to_string()) {
                kept.push(worker);
            } else {
                info!(dest = %worker.spec(), "destination removed by reload");
                worker.stop();
            }
        }
        for spec in &config.destinations {
            if let Some(at) = kept.iter().position(|w| w.spec() == spec) {
                state.workers.push(kept.swap_remove(at));
            } else {
                info!(dest = %spec, "destination added by reload");
                spawn_into(&mut state, spec, &self.control);
            }
        }
        info!(workers = state.workers.len(), "worker pool reloaded");
    }

    /// Stops and joins every worker and its spill sibling.
    pub fn shutdown(&self) {
        let mut state = self.write();
        for worker in state.workers.drain(..) {
            worker.stop();
        }
        info!("worker pool down");
    }

    pub fn len(&self) -> usize {
        self.read().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn specs(&self) -> Vec<SocketSpec> {
        self.read().workers.iter().map(|w| w.spec().clone()).collect()
    }

    /// Live counter handles keyed by the destination's filesystem-safe
    /// name. The handles stay valid after the worker is diffed out or the
    /// pool shuts down, which is what shutdown accounting reads.
    pub fn counters(&self) -> Vec<(String, Arc<Counters>)> {
        self.read()
            .workers
            .iter()
            .map(|w| (w.spec().dir_component(), Arc::clone(w.counters())))
            .collect()
    }

    /// Per-worker counter snapshots keyed by the destination's
    /// filesystem-safe name.
    pub fn counter_snapshots(&self) -> Vec<(String, CountersSnapshot)> {
        self.read()
            .workers
            .iter()
            .map(|w| (w.spec().dir_component(), w.counters().snapshot()))
            .collect()
    }

    /// Sum of all worker counters, for status lines.
    pub fn aggregate(&self) -> CountersSnapshot {
        let mut total = CountersSnapshot::default();
        for (_, snap) in self.counter_snapshots() {
            total.accumulate(&snap);
        }
        total
    }

    /// (main, spill) queue depths summed across workers.
    pub fn queue_depths(&self) -> (usize, usize) {
        let state = self.read();
        state
            .workers
            .iter()
            .fold((0, 0), |(q, s), w| (q + w.queue().len(), s + w.spill_queue().len()))
    }
}

fn spawn_into(state: &mut PoolState, spec: &SocketSpec, control: &Arc<Control>) {
    match SocketWorker::spawn(
        spec.clone(),
        &state.fallback_root,
        &state.tuning,
        Arc::clone(control),
    ) {
        Ok(worker) => state.workers.push(worker),
        Err(err) => error!(dest = %spec, ?err, "cannot create destination worker"),
    }
}
