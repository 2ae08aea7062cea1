use std::{io, io::Read, net::SocketAddr, time::Duration};

use mio::{
    Events, Interest, Poll, Token,
    net::{TcpListener, TcpStream},
};
use tracing::{debug, warn};

use crate::{LEN_HEADER_SIZE, sockopt::set_rcvbuf};

const LISTENER: Token = Token(usize::MAX);

/// Whether a connection survived the current readiness round.
#[derive(Debug, PartialEq, Eq)]
enum ConnState {
    Alive,
    Disconnected,
}

/// Event emitted by [`TcpIngress::poll_with`] for each notable occurrence.
pub enum IngressEvent<'a> {
    /// A new inbound connection was accepted.
    Accepted { peer: SocketAddr },
    /// A connection went away (peer hangup, IO error, or framing
    /// violation).
    Closed { peer: SocketAddr },
    /// A complete length-prefixed frame was assembled. The payload is only
    /// valid for the duration of the callback; zero-length frames are
    /// consumed silently and never reach the handler.
    Frame { payload: &'a [u8] },
}

/// One inbound client: its stream and a partial-frame read buffer.
///
/// The buffer holds at most one maximum frame plus its header; `pos` is how
/// many bytes of it are filled. After a frame is consumed the residual
/// bytes shift to the buffer head.
struct ClientConn {
    stream: TcpStream,
    peer: SocketAddr,
    buf: Box<[u8]>,
    pos: usize,
}

impl ClientConn {
    fn new(stream: TcpStream, peer: SocketAddr, max_frame: usize) -> Self {
        Self { stream, peer, buf: vec![0; max_frame + LEN_HEADER_SIZE].into_boxed_slice(), pos: 0 }
    }

    /// Drain the socket until it would block, handing every complete frame
    /// to `on_frame`.
    fn readable<F>(&mut self, max_frame: usize, on_frame: &mut F) -> ConnState
    where
        F: for<'a> FnMut(IngressEvent<'a>),
    {
        loop {
            if self.pos == self.buf.len() {
                // Full buffer with no consumable frame: the peer is not
                // speaking our framing.
                warn!(peer = %self.peer, "tcp: read buffer full without a complete frame");
                return ConnState::Disconnected;
            }
            match self.stream.read(&mut self.buf[self.pos..]) {
                Ok(0) => return ConnState::Disconnected,
                Ok(n) => {
                    self.pos += n;
                    if !self.consume_frames(max_frame, on_frame) {
                        return ConnState::Disconnected;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return ConnState::Alive,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(?err, peer = %self.peer, "tcp: read");
                    return ConnState::Disconnected;
                }
            }
        }
    }

    /// Consume as many complete frames as the buffer holds. Returns false
    /// when the peer announced an oversized frame and must be torn down.
    fn consume_frames<F>(&mut self, max_frame: usize, on_frame: &mut F) -> bool
    where
        F: for<'a> FnMut(IngressEvent<'a>),
    {
        while self.pos >= LEN_HEADER_SIZE {
            let expected =
                u32::from_le_bytes(self.buf[..LEN_HEADER_SIZE].try_into().unwrap()) as usize;
            if expected > max_frame {
                warn!(peer = %self.peer, expected, max_frame, "tcp: oversized frame");
                return false;
            }
            let frame_end = LEN_HEADER_SIZE + expected;
            if self.pos < frame_end {
                break;
            }
            if expected > 0 {
                on_frame(IngressEvent::Frame { payload: &self.buf[LEN_HEADER_SIZE..frame_end] });
            }
            self.buf.copy_within(frame_end..self.pos, 0);
            self.pos -= frame_end;
        }
        true
    }
}

struct ConnTable {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    conns: Vec<(Token, ClientConn)>,
    next_token: usize,
    max_frame: usize,
    rcvbuf: Option<usize>,
}

impl ConnTable {
    fn accept_ready<F>(&mut self, on_event: &mut F) -> io::Result<()>
    where
        F: for<'a> FnMut(IngressEvent<'a>),
    {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    if let Some(size) = self.rcvbuf {
                        set_rcvbuf(&stream, size);
                    }
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(err) =
                        self.poll.registry().register(&mut stream, token, Interest::READABLE)
                    {
                        warn!(?err, %peer, "tcp: register accepted client");
                        continue;
                    }
                    debug!(%peer, "tcp: client connected");
                    self.conns.push((token, ClientConn::new(stream, peer, self.max_frame)));
                    on_event(IngressEvent::Accepted { peer });
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    fn conn_ready<F>(&mut self, token: Token, on_event: &mut F)
    where
        F: for<'a> FnMut(IngressEvent<'a>),
    {
        // A stale token can show up when a peer closed earlier in the same
        // poll batch.
        let Some(index) = self.conns.iter().position(|(t, _)| *t == token) else {
            return;
        };
        let (_, conn) = &mut self.conns[index];
        if conn.readable(self.max_frame, on_event) == ConnState::Disconnected {
            self.teardown(index, on_event);
        }
    }

    fn teardown<F>(&mut self, index: usize, on_event: &mut F)
    where
        F: for<'a> FnMut(IngressEvent<'a>),
    {
        let (_, mut conn) = self.conns.swap_remove(index);
        let _ = self.poll.registry().deregister(&mut conn.stream);
        let _ = conn.stream.shutdown(std::net::Shutdown::Both);
        debug!(peer = %conn.peer, "tcp: client disconnected");
        on_event(IngressEvent::Closed { peer: conn.peer });
    }
}

/// Inbound framed-TCP engine: one listening socket, many non-blocking
/// client connections, driven by a `mio` readiness loop.
///
/// The caller owns the thread: it calls [`poll_with`] in a loop, checking
/// its stop condition between rounds (`timeout` bounds each round). Frames
/// are `{u32 LE length, payload}` with `0 < length <= max_frame`; a peer
/// announcing a larger frame is torn down, other connections are
/// unaffected.
pub struct TcpIngress {
    events: Events,
    table: ConnTable,
}

impl TcpIngress {
    pub fn bind(addr: SocketAddr, max_frame: usize, rcvbuf: Option<usize>) -> io::Result<Self> {
        let mut listener = TcpListener::bind(addr)?;
        if let Some(size) = rcvbuf {
            set_rcvbuf(&listener, size);
        }
        let local_addr = listener.local_addr()?;
        let poll = Poll::new()?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;
        Ok(Self {
            events: Events::with_capacity(128),
            table: ConnTable {
                poll,
                listener,
                local_addr,
                conns: Vec::new(),
                next_token: 0,
                max_frame,
                rcvbuf,
            },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.table.local_addr
    }

    /// Currently open client connections.
    pub fn connection_count(&self) -> usize {
        self.table.conns.len()
    }

    /// Tears down every client connection, emitting `Closed` for each, so
    /// callers can settle gauges before dropping the engine.
    pub fn close_all<F>(&mut self, mut on_event: F)
    where
        F: for<'a> FnMut(IngressEvent<'a>),
    {
        while !self.table.conns.is_empty() {
            let last = self.table.conns.len() - 1;
            self.table.teardown(last, &mut on_event);
        }
    }

    /// One readiness round, bounded by `timeout`.
    ///
    /// Errors returned here are listener-fatal (the accept socket itself
    /// failed); per-connection problems surface as `Closed` events instead.
    pub fn poll_with<F>(&mut self, timeout: Duration, mut on_event: F) -> io::Result<()>
    where
        F: for<'a> FnMut(IngressEvent<'a>),
    {
        match self.table.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        }
        for event in &self.events {
            if event.token() == LISTENER {
                self.table.accept_ready(&mut on_event)?;
            } else {
                self.table.conn_ready(event.token(), &mut on_event);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u32).to_le_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    fn conn_with_bytes(bytes: &[u8], max_frame: usize) -> ClientConn {
        // Loopback pair so ClientConn has a real stream; framing is
        // exercised directly through the buffer.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = listener.local_addr().unwrap();
        let sock = std::net::TcpStream::connect(peer).unwrap();
        let stream = TcpStream::from_std(sock);
        let mut conn = ClientConn::new(stream, peer, max_frame);
        conn.buf[..bytes.len()].copy_from_slice(bytes);
        conn.pos = bytes.len();
        conn
    }

    fn consume(conn: &mut ClientConn, max_frame: usize) -> (bool, Vec<Vec<u8>>) {
        let mut seen = Vec::new();
        let ok = conn.consume_frames(max_frame, &mut |ev| {
            if let IngressEvent::Frame { payload } = ev {
                seen.push(payload.to_vec());
            }
        });
        (ok, seen)
    }

    #[test]
    fn partial_header_waits() {
        let mut conn = conn_with_bytes(&[0x02, 0x00], 64);
        let (ok, seen) = consume(&mut conn, 64);
        assert!(ok);
        assert!(seen.is_empty());
        assert_eq!(conn.pos, 2);
    }

    #[test]
    fn complete_frames_consumed_in_order_with_residual() {
        let mut bytes = frame(&[0xAA, 0xBB]);
        bytes.extend_from_slice(&frame(&[0xCC]));
        bytes.extend_from_slice(&[0x05, 0x00]); // partial next header
        let mut conn = conn_with_bytes(&bytes, 64);
        let (ok, seen) = consume(&mut conn, 64);
        assert!(ok);
        assert_eq!(seen, vec![vec![0xAA, 0xBB], vec![0xCC]]);
        assert_eq!(&conn.buf[..conn.pos], &[0x05, 0x00]);
    }

    #[test]
    fn zero_length_frame_skipped() {
        let mut bytes = frame(&[]);
        bytes.extend_from_slice(&frame(&[0x01]));
        let mut conn = conn_with_bytes(&bytes, 64);
        let (ok, seen) = consume(&mut conn, 64);
        assert!(ok);
        assert_eq!(seen, vec![vec![0x01]]);
        assert_eq!(conn.pos, 0);
    }

    #[test]
    fn max_frame_boundary() {
        let payload = vec![0x42; 64];
        let mut conn = conn_with_bytes(&frame(&payload), 64);
        let (ok, seen) = consume(&mut conn, 64);
        assert!(ok);
        assert_eq!(seen, vec![payload]);

        // One past the limit is a framing violation.
        let bytes = 65u32.to_le_bytes();
        let mut conn = conn_with_bytes(&bytes, 64);
        let (ok, seen) = consume(&mut conn, 64);
        assert!(!ok);
        assert!(seen.is_empty());
    }
}
