use std::{
    io::{self, IoSlice, Write},
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, UdpSocket},
    time::Duration,
};

use thiserror::Error;
use tracing::debug;

use crate::{LEN_HEADER_SIZE, Proto, SocketSpec, SpecError};

#[derive(Error, Debug)]
pub enum SendError {
    /// Nothing moved before the deadline; the stall watchdog case.
    #[error("send timed out after {0:?}")]
    TimedOut(Duration),
    /// Some bytes moved, then the deadline hit mid-frame. The stream is
    /// unusable until reconnected.
    #[error("short send of {sent}/{expected} bytes")]
    Partial { sent: usize, expected: usize },
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

enum OutSocket {
    Udp(UdpSocket),
    Tcp(TcpStream),
}

/// Outbound side of one destination worker.
///
/// Exclusively owned by that worker's thread. The socket opens lazily and
/// stays closed between reconnect attempts; `send` is synchronous with a
/// monotonic deadline, retrying transient kernel pushback until the
/// deadline and reporting a timeout so the caller can treat it as a stall.
///
/// Frames match the inbound side: a UDP destination receives the raw
/// payload as one datagram, a TCP destination receives
/// `{u32 LE length, payload}`.
pub struct DestSender {
    spec: SocketSpec,
    socket: Option<OutSocket>,
}

impl DestSender {
    pub fn new(spec: SocketSpec) -> Self {
        Self { spec, socket: None }
    }

    pub fn spec(&self) -> &SocketSpec {
        &self.spec
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    pub fn connect(&mut self, timeout: Duration) -> Result<(), SendError> {
        let addr = self.spec.resolve()?;
        let socket = match self.spec.proto {
            Proto::Udp => {
                let socket = UdpSocket::bind(unspecified_for(&addr))?;
                socket.connect(addr)?;
                OutSocket::Udp(socket)
            }
            Proto::Tcp => {
                let stream = TcpStream::connect_timeout(&addr, timeout)?;
                stream.set_nodelay(true)?;
                OutSocket::Tcp(stream)
            }
        };
        debug!(dest = %self.spec, "connected");
        self.socket = Some(socket);
        Ok(())
    }

    pub fn close(&mut self) {
        self.socket = None;
    }

    /// Writes one blob to the destination, returning the time spent.
    pub fn send(&mut self, payload: &[u8], deadline: Duration) -> Result<Duration, SendError> {
        let started = fanout_timing::now();
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        match socket {
            OutSocket::Udp(udp) => send_datagram(udp, payload, deadline)?,
            OutSocket::Tcp(tcp) => send_frame(tcp, payload, deadline)?,
        }
        Ok(fanout_timing::now().duration_since(started))
    }
}

fn unspecified_for(addr: &SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    }
}

// set_write_timeout rejects a zero Duration.
fn write_window(remaining: Duration) -> Duration {
    remaining.max(Duration::from_micros(1))
}

fn is_pushback(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn send_datagram(
    socket: &UdpSocket,
    payload: &[u8],
    deadline: Duration,
) -> Result<(), SendError> {
    socket.set_write_timeout(Some(write_window(deadline)))?;
    match socket.send(payload) {
        Ok(n) if n == payload.len() => Ok(()),
        Ok(n) => Err(SendError::Partial { sent: n, expected: payload.len() }),
        Err(ref e) if is_pushback(e) => Err(SendError::TimedOut(deadline)),
        Err(e) => Err(e.into()),
    }
}

fn send_frame(stream: &mut TcpStream, payload: &[u8], deadline: Duration) -> Result<(), SendError> {
    let started = fanout_timing::now();
    let header = (payload.len() as u32).to_le_bytes();
    let total = LEN_HEADER_SIZE + payload.len();
    let mut written = 0;
    while written < total {
        let elapsed = fanout_timing::now().duration_since(started);
        let Some(remaining) = deadline.checked_sub(elapsed).filter(|r| !r.is_zero()) else {
            return Err(if written == 0 {
                SendError::TimedOut(deadline)
            } else {
                SendError::Partial { sent: written, expected: total }
            });
        };
        stream.set_write_timeout(Some(write_window(remaining)))?;
        let result = if written < LEN_HEADER_SIZE {
            stream.write_vectored(&[IoSlice::new(&header[written..]), IoSlice::new(payload)])
        } else {
            stream.write(&payload[written - LEN_HEADER_SIZE..])
        };
        match result {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => written += n,
            Err(ref e) if is_pushback(e) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::io::Read;

    use super::*;

    #[test]
    fn udp_sends_raw_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let spec: SocketSpec =
            format!("127.0.0.1:{}/udp", receiver.local_addr().unwrap().port()).parse().unwrap();
        let mut sender = DestSender::new(spec);
        sender.connect(Duration::from_secs(1)).unwrap();
        sender.send(b"datagram", Duration::from_secs(1)).unwrap();

        let mut buf = [0u8; 64];
        let n = receiver.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"datagram");
    }

    #[test]
    fn tcp_sends_length_prefixed_frame() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let spec: SocketSpec =
            format!("127.0.0.1:{}/tcp", listener.local_addr().unwrap().port()).parse().unwrap();
        let mut sender = DestSender::new(spec);
        sender.connect(Duration::from_secs(1)).unwrap();
        sender.send(&[0xAA, 0xBB, 0xCC], Duration::from_secs(1)).unwrap();

        let (mut conn, _) = listener.accept().unwrap();
        let mut buf = [0u8; 7];
        conn.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0x03, 0x00, 0x00, 0x00, 0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn send_without_connect_is_an_error() {
        let mut sender = DestSender::new("127.0.0.1:9/udp".parse().unwrap());
        assert!(matches!(
            sender.send(b"x", Duration::from_millis(10)),
            Err(SendError::Io(_))
        ));
    }

    #[test]
    fn connect_failure_reports_io() {
        // Port 1 on loopback is virtually always closed.
        let mut sender = DestSender::new("127.0.0.1:1/tcp".parse().unwrap());
        assert!(matches!(sender.connect(Duration::from_millis(200)), Err(SendError::Io(_))));
        assert!(!sender.is_connected());
    }
}
