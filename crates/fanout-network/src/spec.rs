use std::{
    fmt,
    net::{SocketAddr, ToSocketAddrs},
    str::FromStr,
};

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Proto {
    Udp,
    Tcp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Udp => write!(f, "udp"),
            Proto::Tcp => write!(f, "tcp"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("empty endpoint spec")]
    Empty,
    #[error("missing port in {0:?}")]
    MissingPort(String),
    #[error("bad port in {0:?}")]
    BadPort(String),
    #[error("unknown protocol {0:?}, expected udp or tcp")]
    BadProto(String),
    #[error("cannot resolve {0}")]
    Unresolvable(String),
}

/// One wire endpoint, `host:port` or `host:port/proto`.
///
/// The protocol defaults to udp, matching the listener and destination
/// conventions of the wire format. `Display` prints the canonical
/// `host:port/proto` form, and `parse(spec.to_string())` round-trips, which
/// is what the reload diff keys on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocketSpec {
    pub host: String,
    pub port: u16,
    pub proto: Proto,
}

impl FromStr for SocketSpec {
    type Err = SpecError;

    fn from_str(raw: &str) -> Result<Self, SpecError> {
        if raw.is_empty() {
            return Err(SpecError::Empty);
        }
        let (addr, proto) = match raw.rsplit_once('/') {
            Some((addr, "udp")) => (addr, Proto::Udp),
            Some((addr, "tcp")) => (addr, Proto::Tcp),
            Some((_, other)) => return Err(SpecError::BadProto(other.to_string())),
            None => (raw, Proto::Udp),
        };
        // rsplit so IPv6 hosts with colons keep their tail intact
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| SpecError::MissingPort(raw.to_string()))?;
        if host.is_empty() {
            return Err(SpecError::MissingPort(raw.to_string()));
        }
        let port = port.parse().map_err(|_| SpecError::BadPort(raw.to_string()))?;
        Ok(Self { host: host.to_string(), port, proto })
    }
}

impl fmt::Display for SocketSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.proto)
    }
}

impl SocketSpec {
    pub fn is_tcp(&self) -> bool {
        self.proto == Proto::Tcp
    }

    /// First resolved address for this endpoint.
    pub fn resolve(&self) -> Result<SocketAddr, SpecError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| SpecError::Unresolvable(self.to_string()))
    }

    /// Filesystem-safe name for this endpoint's spill directory.
    pub fn dir_component(&self) -> String {
        fanout_utils::sanitize_component(&self.to_string())
    }
}
