use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};

use fanout_communication::Counters;
use fanout_timing::Repeater;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    control::{self, Control, RELOADING, RUNNING, STARTING, STOPPING},
    listener::{Listener, ListenerError},
    pool::WorkerPool,
    stats::StatsEmitter,
};

const TICK: Duration = Duration::from_secs(1);
const ALIVE_EVERY: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] io::Error),
    #[error("failed to start stats emitter: {0}")]
    Stats(#[source] io::Error),
}

/// The main thread: owns the control bits, brings the pipeline up, ticks
/// once a second servicing reload/shutdown requests, and joins everything
/// on the way out.
///
/// Only this thread ever orchestrates lifecycle; signal handlers merely
/// flip control bits for it to act on.
pub fn run(mut config: Config, config_path: Option<PathBuf>) -> Result<(), SupervisorError> {
    let control = Control::new();
    control::install_signal_handlers(&control).map_err(SupervisorError::Signals)?;
    control.set(STARTING);
    let started = fanout_timing::now();

    let listener_counters = Arc::new(Counters::default());
    let pool = WorkerPool::start(&config, Arc::clone(&control));
    let mut stats = StatsEmitter::spawn(
        config.stats.clone(),
        Arc::clone(&listener_counters),
        Arc::clone(&pool),
    )
    .map_err(SupervisorError::Stats)?;
    let mut listener = match Listener::spawn(
        &config,
        Arc::clone(&pool),
        Arc::clone(&listener_counters),
        Arc::clone(&control),
    ) {
        Ok(listener) => listener,
        Err(err) => {
            stats.stop();
            pool.shutdown();
            return Err(err.into());
        }
    };
    control.set(RUNNING);
    control.unset(STARTING);
    info!(listener = %config.listener, destinations = pool.len(), "relay running");

    let mut alive = Repeater::every(ALIVE_EVERY);
    alive.reset();
    loop {
        if control.stopping() {
            break;
        }
        if listener.is_finished() {
            // The listener only exits on its own when its socket is
            // unrecoverable; stop() below collects the verdict.
            error!("listener thread exited unexpectedly");
            control.set(STOPPING);
            break;
        }
        if control.is(RELOADING) {
            let reloaded = perform_reload(
                config,
                config_path.as_deref(),
                listener,
                stats,
                &pool,
                &listener_counters,
                &control,
            )?;
            (config, listener, stats) = reloaded;
            control.unset(RELOADING);
        }

        let mut total = listener_counters.snapshot();
        total.accumulate(&pool.aggregate());
        let (queued, spill_queued) = pool.queue_depths();
        debug!(
            received = total.received_count,
            sent = total.sent_count,
            spilled = total.spilled_count,
            dropped = total.dropped_count,
            queued,
            spill_queued,
            "tick"
        );
        if alive.fired() {
            let uptime = fanout_timing::now().duration_since(started);
            info!(
                uptime = %humantime::format_duration(Duration::from_secs(uptime.as_secs())),
                received = total.received_count,
                sent = total.sent_count,
                spilled = total.spilled_count,
                dropped = total.dropped_count,
                connections = total.tcp_connections,
                "alive"
            );
        }
        thread::sleep(TICK);
    }

    // Shutdown order matters: first stop accepting, then let workers drain
    // to disk, then the stats thread.
    let listener_verdict = listener.stop();
    pool.shutdown();
    stats.stop();
    info!("bye");
    listener_verdict.map_err(Into::into)
}

/// SIGHUP path. A missing or unparsable config file keeps the current
/// snapshot running; only a failure to rebuild the listener is fatal,
/// because by then the old one is gone.
#[allow(clippy::too_many_arguments)]
fn perform_reload(
    config: Config,
    config_path: Option<&Path>,
    listener: Listener,
    stats: StatsEmitter,
    pool: &Arc<WorkerPool>,
    listener_counters: &Arc<Counters>,
    control: &Arc<Control>,
) -> Result<(Config, Listener, StatsEmitter), SupervisorError> {
    let Some(path) = config_path else {
        warn!("reload requested but no config file was given; ignoring");
        return Ok((config, listener, stats));
    };
    let next = match Config::from_file(path) {
        Ok(next) => next,
        Err(err) => {
            error!(%err, config = %path.display(), "reload failed, keeping previous config");
            return Ok((config, listener, stats));
        }
    };
    info!(config = %path.display(), "reloading");

    if let Err(err) = listener.stop() {
        warn!(%err, "old listener exited with an error during reload");
    }
    let listener = match Listener::spawn(
        &next,
        Arc::clone(pool),
        Arc::clone(listener_counters),
        Arc::clone(control),
    ) {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, "cannot rebuild listener after reload");
            stats.stop();
            pool.shutdown();
            return Err(err.into());
        }
    };
    pool.reload(&next);
    let stats = if *stats.config() == next.stats {
        stats
    } else {
        stats.stop();
        match StatsEmitter::spawn(
            next.stats.clone(),
            Arc::clone(listener_counters),
            Arc::clone(pool),
        ) {
            Ok(stats) => stats,
            Err(err) => {
                let _ = listener.stop();
                pool.shutdown();
                return Err(SupervisorError::Stats(err));
            }
        }
    };
    info!("reload complete");
    Ok((next, listener, stats))
}
