use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use signal_hook::{
    consts::{SIGHUP, SIGINT, SIGTERM},
    low_level,
};

pub const STARTING: u32 = 1 << 0;
pub const RUNNING: u32 = 1 << 1;
pub const RELOADING: u32 = 1 << 2;
pub const STOPPING: u32 = 1 << 3;

/// Process lifecycle bit-set, shared by every thread.
///
/// All accesses are SeqCst read-modify-writes so signal handlers and worker
/// threads observe a single total order of transitions. STOPPING is
/// latched: once set, `unset` will not clear it.
#[derive(Debug, Default)]
pub struct Control {
    bits: AtomicU32,
}

impl Control {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[inline]
    pub fn set(&self, bits: u32) {
        self.bits.fetch_or(bits, Ordering::SeqCst);
    }

    #[inline]
    pub fn unset(&self, bits: u32) {
        self.bits.fetch_and(!(bits & !STOPPING), Ordering::SeqCst);
    }

    #[inline]
    pub fn is(&self, bits: u32) -> bool {
        self.bits.load(Ordering::SeqCst) & bits != 0
    }

    #[inline]
    pub fn is_not(&self, bits: u32) -> bool {
        !self.is(bits)
    }

    #[inline]
    pub fn get(&self) -> u32 {
        self.bits.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn stopping(&self) -> bool {
        self.is(STOPPING)
    }
}

/// Routes lifecycle signals into the control bits: SIGHUP requests a
/// reload, SIGTERM/SIGINT request shutdown.
///
/// The handlers only flip atomic bits; never allocate, log or join from
/// them. SIGPIPE needs no handler here, the Rust runtime already ignores
/// it before `main`.
pub fn install_signal_handlers(control: &Arc<Control>) -> io::Result<()> {
    unsafe {
        let c = Arc::clone(control);
        low_level::register(SIGHUP, move || c.set(RELOADING))?;
        let c = Arc::clone(control);
        low_level::register(SIGTERM, move || c.set(STOPPING))?;
        let c = Arc::clone(control);
        low_level::register(SIGINT, move || c.set(STOPPING))?;
    }
    Ok(())
}
