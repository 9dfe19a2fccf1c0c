//! Process-wide signal counting.
//!
//! The handler only bumps a counter and pokes every attached manager through
//! its self-pipe. Managers compare the counters against what their sources
//! have already seen.

use super::poller::cvt;
use crate::utils::retry_with_backoff;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

const NSIG: usize = 65;

/// Managers that can be attached to the handler at the same time.
const MAX_PIPES: usize = 32;

static COUNTS: [AtomicU64; NSIG] = [const { AtomicU64::new(0) }; NSIG];
static HANDLED: [AtomicBool; NSIG] = [const { AtomicBool::new(false) }; NSIG];
static PIPES: [AtomicI32; MAX_PIPES] = [const { AtomicI32::new(-1) }; MAX_PIPES];

extern "C" fn on_signal(signo: libc::c_int) {
    // Only async-signal-safe calls below.
    let errno = unsafe { *libc::__errno_location() };

    if let Some(count) = COUNTS.get(signo as usize) {
        count.fetch_add(1, Ordering::SeqCst);
    }

    let byte = signo as u8;
    for pipe in &PIPES {
        let fd = pipe.load(Ordering::SeqCst);
        if fd >= 0 {
            // A full pipe already has a wakeup pending.
            unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
        }
    }

    unsafe { *libc::__errno_location() = errno };
}

/// Installs the counting handler for `signal`. The first call per signal
/// replaces whatever disposition was there, later calls are no-ops.
pub(super) fn install_handler(signal: Signal) -> nix::Result<()> {
    let signo = signal as usize;
    if HANDLED[signo].swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    // Safety: the handler only touches atomics and calls write(2).
    match unsafe { sigaction(signal, &action) } {
        Ok(_) => Ok(()),
        Err(e) => {
            HANDLED[signo].store(false, Ordering::SeqCst);
            Err(e)
        }
    }
}

/// Deliveries of `signal` since the handler was installed.
pub(super) fn count(signal: Signal) -> u64 {
    COUNTS[signal as usize].load(Ordering::SeqCst)
}

/// The read end is watched by a manager. The write end is published to the
/// handler once attached.
#[derive(Debug)]
pub(super) struct SignalPipe {
    read: OwnedFd,
    write: OwnedFd,
    slot: Option<usize>,
}

impl SignalPipe {
    pub(super) fn new() -> io::Result<Self> {
        let mut fds = [-1; 2];
        retry_with_backoff("pipe2", || {
            cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) })
        })?;

        // Safety: both ends were just created.
        Ok(Self {
            read: unsafe { OwnedFd::from_raw_fd(fds[0]) },
            write: unsafe { OwnedFd::from_raw_fd(fds[1]) },
            slot: None,
        })
    }

    pub(super) fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Returns false if every slot is taken.
    pub(super) fn attach(&mut self) -> bool {
        if self.slot.is_some() {
            return true;
        }

        let fd = self.write.as_raw_fd();
        let slot = PIPES.iter().position(|pipe| {
            pipe.compare_exchange(-1, fd, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        });

        self.slot = slot;
        slot.is_some()
    }

    pub(super) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.read.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };

            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            PIPES[slot].store(-1, Ordering::SeqCst);
        }
    }
}
