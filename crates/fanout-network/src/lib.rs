mod sender;
mod sockopt;
mod spec;
pub mod tcp;

pub use sender::{DestSender, SendError};
pub use sockopt::set_rcvbuf;
pub use spec::{Proto, SocketSpec, SpecError};

/// Byte width of the `u32` little-endian length prefix used by inbound TCP,
/// outbound TCP and spill files alike.
pub const LEN_HEADER_SIZE: usize = core::mem::size_of::<u32>();
