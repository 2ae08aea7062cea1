use std::os::fd::AsRawFd;

use tracing::warn;

/// Request a kernel SO_RCVBUF on any socket-like fd.
///
/// The kernel is free to clamp the value; failure is logged, not fatal,
/// since the relay still works with the default buffer.
pub fn set_rcvbuf(sock: &impl AsRawFd, size: usize) {
    let fd = sock.as_raw_fd();
    let size = size as libc::c_int;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        warn!(err = %std::io::Error::last_os_error(), size, "setsockopt SO_RCVBUF");
    }
}
