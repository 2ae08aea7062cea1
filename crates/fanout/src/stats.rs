use std::{
    fmt::Write as _,
    io::{self, Write},
    net::{TcpStream, UdpSocket},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use fanout_communication::{Counters, CountersSnapshot};
use fanout_network::{Proto, SocketSpec};
use fanout_timing::Repeater;
use tracing::{Level, debug, info, span, warn};

use crate::{config::StatsConfig, pool::WorkerPool};

const TICK: Duration = Duration::from_millis(250);
const SINK_TIMEOUT: Duration = Duration::from_secs(1);

/// Auxiliary worker publishing counter snapshots on a timer.
///
/// Every interval it logs an aggregate summary and, when a graphite sink
/// is configured, pushes `prefix.<source>.<field> <value> <epoch>` lines
/// over a short-lived connection. Sink failures are logged and skipped;
/// this thread must never push back on the pipeline.
pub struct StatsEmitter {
    config: StatsConfig,
    exit: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl StatsEmitter {
    pub fn spawn(
        config: StatsConfig,
        listener_counters: Arc<Counters>,
        pool: Arc<WorkerPool>,
    ) -> io::Result<Self> {
        let exit = Arc::new(AtomicBool::new(false));
        let emitter = EmitterLoop {
            config: config.clone(),
            listener_counters,
            pool,
            exit: Arc::clone(&exit),
        };
        let thread =
            thread::Builder::new().name("stats".into()).spawn(move || emitter.run())?;
        Ok(Self { config, exit, thread })
    }

    /// The config this emitter runs with; reload compares against it to
    /// decide whether the emitter must be recreated.
    pub fn config(&self) -> &StatsConfig {
        &self.config
    }

    pub fn stop(self) {
        self.exit.store(true, Ordering::Relaxed);
        if self.thread.join().is_err() {
            warn!("stats emitter thread panicked");
        }
    }
}

struct EmitterLoop {
    config: StatsConfig,
    listener_counters: Arc<Counters>,
    pool: Arc<WorkerPool>,
    exit: Arc<AtomicBool>,
}

impl EmitterLoop {
    fn run(self) {
        let _span = span!(Level::INFO, "stats").entered();
        let mut tick = Repeater::every(self.config.interval);
        tick.reset();
        while !self.exit.load(Ordering::Relaxed) {
            thread::sleep(TICK);
            if tick.fired() {
                self.emit();
            }
        }
    }

    fn emit(&self) {
        let listener = self.listener_counters.snapshot();
        let workers = self.pool.counter_snapshots();
        let mut total = listener;
        for (_, snap) in &workers {
            total.accumulate(snap);
        }
        info!(
            received = total.received_count,
            sent = total.sent_count,
            spilled = total.spilled_count,
            dropped = total.dropped_count,
            errors = total.error_count,
            disk = total.disk_count,
            connections = listener.tcp_connections,
            "counters"
        );
        if let Some(sink) = &self.config.graphite {
            let body = self.render(&listener, &workers);
            if let Err(err) = push_to_sink(sink, body.as_bytes()) {
                debug!(%err, %sink, "graphite push failed");
            }
        }
    }

    fn render(&self, listener: &CountersSnapshot, workers: &[(String, CountersSnapshot)]) -> String {
        let ts = fanout_timing::epoch_secs();
        let prefix = &self.config.prefix;
        let mut body = String::new();
        for (field, value) in listener.fields() {
            let _ = writeln!(body, "{prefix}.listener.{field} {value} {ts}");
        }
        for (name, snap) in workers {
            for (field, value) in snap.fields() {
                let _ = writeln!(body, "{prefix}.{name}.{field} {value} {ts}");
            }
        }
        body
    }
}

fn push_to_sink(sink: &SocketSpec, body: &[u8]) -> io::Result<()> {
    let addr = sink
        .resolve()
        .map_err(|e| io::Error::new(io::ErrorKind::AddrNotAvailable, e))?;
    match sink.proto {
        Proto::Tcp => {
            let mut stream = TcpStream::connect_timeout(&addr, SINK_TIMEOUT)?;
            stream.set_write_timeout(Some(SINK_TIMEOUT))?;
            stream.write_all(body)
        }
        Proto::Udp => {
            let socket = UdpSocket::bind("0.0.0.0:0")?;
            // one datagram per line; graphite's UDP receiver expects
            // line-sized packets
            for line in body.split_inclusive(|b| *b == b'\n') {
                socket.send_to(line, addr)?;
            }
            Ok(())
        }
    }
}
