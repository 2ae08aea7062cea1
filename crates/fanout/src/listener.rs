use std::{
    io,
    net::{SocketAddr, UdpSocket},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use fanout_communication::{Blob, Counters, MAX_CHUNK_SIZE};
use fanout_network::{
    SpecError, set_rcvbuf,
    tcp::{IngressEvent, TcpIngress},
};
use fanout_timing::IngressPace;
use thiserror::Error;
use tracing::{Level, error, info, span};

use crate::{config::Config, control::Control, pool::WorkerPool};

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error("listener bind failed: {0}")]
    Bind(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("listener thread panicked")]
    Panicked,
}

/// Everything the ingest path needs, shared by both listener modes.
struct Ingest {
    pool: Arc<WorkerPool>,
    counters: Arc<Counters>,
    pace: IngressPace,
    control: Arc<Control>,
    cancel: Arc<AtomicBool>,
    polling_interval: Duration,
}

impl Ingest {
    fn should_stop(&self) -> bool {
        self.control.stopping() || self.cancel.load(Ordering::Relaxed)
    }

    /// One accepted packet: admission control, accounting, fan-out.
    fn ingest(&self, payload: &[u8]) {
        if !self.pace.admit() {
            Counters::inc(&self.counters.dropped_count, 1);
            return;
        }
        Counters::inc(&self.counters.received_count, 1);
        self.pool.fanout(Blob::copy_from(payload));
    }
}

/// Handle to the single inbound listener thread.
///
/// The socket is bound synchronously in `spawn` so startup errors surface
/// immediately; the thread then owns it until `stop`. Cancellation is a
/// flag the loop re-checks every polling interval, the bound on unblock
/// time promised to the supervisor.
pub struct Listener {
    cancel: Arc<AtomicBool>,
    local_addr: SocketAddr,
    thread: JoinHandle<Result<(), ListenerError>>,
}

impl Listener {
    pub fn spawn(
        config: &Config,
        pool: Arc<WorkerPool>,
        counters: Arc<Counters>,
        control: Arc<Control>,
    ) -> Result<Self, ListenerError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let ingest = Ingest {
            pool,
            counters,
            pace: IngressPace::per_second(config.max_pps),
            control,
            cancel: Arc::clone(&cancel),
            polling_interval: config.polling_interval,
        };
        let addr = config.listener.resolve()?;
        let spec = config.listener.clone();

        if config.listener.is_tcp() {
            let ingress =
                TcpIngress::bind(addr, MAX_CHUNK_SIZE, Some(config.server_socket_rcvbuf))
                    .map_err(ListenerError::Bind)?;
            let local_addr = ingress.local_addr();
            let thread = thread::Builder::new().name("listener".into()).spawn(move || {
                let _span = span!(Level::INFO, "listener", %spec).entered();
                tcp_loop(ingress, &ingest)
            })?;
            Ok(Self { cancel, local_addr, thread })
        } else {
            let socket = UdpSocket::bind(addr).map_err(ListenerError::Bind)?;
            set_rcvbuf(&socket, config.server_socket_rcvbuf);
            socket.set_read_timeout(Some(config.polling_interval))?;
            let local_addr = socket.local_addr()?;
            let thread = thread::Builder::new().name("listener".into()).spawn(move || {
                let _span = span!(Level::INFO, "listener", %spec).entered();
                udp_loop(&socket, &ingest)
            })?;
            Ok(Self { cancel, local_addr, thread })
        }
    }

    /// Bound address; differs from the spec when port 0 was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the thread exited on its own, which is listener-fatal.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Cancels and joins, returning the thread's verdict.
    pub fn stop(self) -> Result<(), ListenerError> {
        self.cancel.store(true, Ordering::Relaxed);
        match self.thread.join() {
            Ok(result) => result,
            Err(_) => Err(ListenerError::Panicked),
        }
    }
}

fn udp_loop(socket: &UdpSocket, ingest: &Ingest) -> Result<(), ListenerError> {
    info!("udp listener up");
    let mut buf = vec![0u8; MAX_CHUNK_SIZE];
    loop {
        if ingest.should_stop() {
            info!("udp listener down");
            return Ok(());
        }
        match socket.recv(&mut buf) {
            // zero-length datagrams are ignored outright: no blob, no
            // counter movement
            Ok(0) => {}
            Ok(n) => ingest.ingest(&buf[..n]),
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(err) => {
                error!(%err, "udp recv failed");
                return Err(ListenerError::Io(err));
            }
        }
    }
}

fn tcp_loop(mut ingress: TcpIngress, ingest: &Ingest) -> Result<(), ListenerError> {
    info!("tcp listener up");
    let verdict = loop {
        if ingest.should_stop() {
            break Ok(());
        }
        match ingress.poll_with(ingest.polling_interval, |event| match event {
            IngressEvent::Accepted { .. } => {
                Counters::inc(&ingest.counters.tcp_connections, 1);
            }
            IngressEvent::Closed { .. } => {
                Counters::dec(&ingest.counters.tcp_connections, 1);
            }
            IngressEvent::Frame { payload } => ingest.ingest(payload),
        }) {
            Ok(()) => {}
            Err(err) => {
                error!(%err, "tcp poll failed");
                break Err(ListenerError::Io(err));
            }
        }
    };
    // Close surviving connections before the thread exits; the gauge must
    // read zero once no client fd is open.
    ingress.close_all(|event| {
        if let IngressEvent::Closed { .. } = event {
            Counters::dec(&ingest.counters.tcp_connections, 1);
        }
    });
    info!("tcp listener down");
    verdict
}
