use crate::utils::retry_with_backoff;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Capacity of the event buffer handed to `epoll_wait`.
pub(super) const MAX_EVENTS: usize = 64;

pub(super) fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Owned epoll instance. Registrations carry a token, returned with their
/// events.
#[derive(Debug)]
pub(super) struct Poller {
    epoll: OwnedFd,
}

impl Poller {
    pub(super) fn new() -> io::Result<Self> {
        let fd = retry_with_backoff("epoll_create1", || {
            cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })
        })?;

        Ok(Self {
            // Safety: freshly created, owned by nobody else.
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: usize) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: token as u64,
        };
        cvt(unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut ev) }).map(drop)
    }

    pub(super) fn add(&self, fd: RawFd, events: u32, token: usize) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, token)
    }

    pub(super) fn modify(&self, fd: RawFd, events: u32, token: usize) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, token)
    }

    /// Descriptors already closed were removed by the kernel, that is not an
    /// error.
    pub(super) fn delete(&self, fd: RawFd) -> io::Result<()> {
        let ret = unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };

        match cvt(ret) {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.raw_os_error(), Some(libc::ENOENT | libc::EBADF)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Waits up to `timeout_ms` (-1 blocks) and fills `events`. Interrupted
    /// waits return no events.
    pub(super) fn wait(
        &self,
        events: &mut Vec<libc::epoll_event>,
        timeout_ms: i32,
    ) -> io::Result<usize> {
        events.clear();
        let capacity = events.capacity().min(i32::MAX as usize) as i32;

        let ret = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                events.as_mut_ptr(),
                capacity,
                timeout_ms,
            )
        };

        match cvt(ret) {
            Ok(n) => {
                // Safety: the kernel initialized the first `n` entries.
                unsafe { events.set_len(n as usize) };
                Ok(n as usize)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }
}
