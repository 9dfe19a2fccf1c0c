//! The manager thread.
//!
//! Every runtime runs one manager thread owning all kernel registrations of
//! its sources: an epoll set for descriptors and pidfds, one timerfd per
//! clock and timer tier, and a self-pipe fed by the signal handler. Other
//! threads never touch those. They queue [`Command`]s and wake the manager
//! through its eventfd.

use crate::object::ObjRef;
use crate::runtime::RuntimeConfig;
use crate::source::SourceInner;
use crate::utils::retry_with_backoff;
use anyhow::{Context, Result, anyhow};
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::io;
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

mod event_loop;
use event_loop::EventLoop;

mod poller;

mod registry;

mod signal;

mod timerfd;

const THREAD_NAME: &str = "rdispatch-mgr";

/// Requests handed to the manager thread.
#[derive(Debug)]
pub(crate) enum Command {
    /// Register an activated source with the kernel.
    Install(ObjRef<SourceInner>),
    /// The event handler of a descriptor source returned.
    Rearm(ObjRef<SourceInner>),
    /// Tear the registration down, then run the cancel handler.
    Cancel(ObjRef<SourceInner>),
    /// The timer spec of an installed timer source changed.
    ConfigureTimer(ObjRef<SourceInner>),
    /// A timer source was suspended.
    DisarmTimer(ObjRef<SourceInner>),
    /// A timer source was resumed.
    ResumeTimer(ObjRef<SourceInner>),
    Shutdown,
}

/// Proof of running on a manager thread. Source state that only the manager
/// may change takes one.
#[derive(Debug)]
pub(crate) struct ManagerToken {
    _not_send: PhantomData<*const ()>,
}

impl ManagerToken {
    fn new() -> Self {
        Self {
            _not_send: PhantomData,
        }
    }
}

#[derive(Debug)]
struct Inbox {
    commands: SegQueue<Command>,
    /// eventfd the manager waits on along with everything else.
    wake: OwnedFd,
    shutdown: AtomicBool,
}

impl Inbox {
    fn new() -> io::Result<Self> {
        let fd = retry_with_backoff("eventfd", || {
            poller::cvt(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })
        })?;

        Ok(Self {
            commands: SegQueue::new(),
            // Safety: freshly created, owned by nobody else.
            wake: unsafe { OwnedFd::from_raw_fd(fd) },
            shutdown: AtomicBool::new(false),
        })
    }

    fn wake(&self) {
        let one: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.wake.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };

        // EAGAIN: the counter is saturated, a wakeup is pending anyway.
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EAGAIN) {
                warn_once!(error = %err, "failed to wake the manager thread");
            }
        }
    }

    fn drain_wake(&self) {
        let mut count: u64 = 0;
        unsafe {
            libc::read(
                self.wake.as_raw_fd(),
                &mut count as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
    }
}

/// Handle to the manager thread of a runtime.
#[derive(Debug)]
pub(crate) struct Manager {
    inbox: Arc<Inbox>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    pub(crate) fn start(cfg: &RuntimeConfig) -> Result<Manager> {
        let inbox = Arc::new(Inbox::new().context("failed to create manager eventfd")?);
        let event_loop =
            EventLoop::new(Arc::clone(&inbox)).context("failed to set up manager thread")?;

        let mut builder = thread::Builder::new().name(THREAD_NAME.to_string());
        if let Some(stack_size) = cfg.thread_stack_size {
            builder = builder.stack_size(stack_size);
        }

        let handle = builder
            .spawn(move || event_loop.run())
            .context("failed to spawn manager thread")?;

        Ok(Manager {
            inbox,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Queues `command` for the manager thread. Dropped once the manager shut
    /// down.
    pub(crate) fn send(&self, command: Command) {
        if self.inbox.shutdown.load(Ordering::Acquire) {
            tracing::trace!(?command, "manager shut down, dropping command");
            return;
        }

        self.inbox.commands.push(command);
        self.inbox.wake();
    }

    /// Stops the manager thread and waits for it, unless called from it.
    pub(crate) fn shutdown(&self) -> Result<()> {
        if self.inbox.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.inbox.commands.push(Command::Shutdown);
        self.inbox.wake();

        let Some(handle) = self.thread.lock().take() else {
            return Ok(());
        };

        if handle.thread().id() == thread::current().id() {
            return Ok(());
        }

        let res = handle.join().map_err(|_| anyhow!("manager thread panicked"));

        // Raced with the shutdown flag. Sources hold the runtime alive.
        let mut dropped = 0;
        while self.inbox.commands.pop().is_some() {
            dropped += 1;
        }
        tracing::debug!(dropped, "manager shut down");

        res
    }
}
