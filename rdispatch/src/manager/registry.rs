use super::ManagerToken;
use super::poller::Poller;
use crate::object::{ObjRef, ObjectId};
use crate::source::{SourceInner, SourceType};
use crate::time::ClockKind;
use crate::timer::Tier;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use slab::Slab;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};

const EPOLLIN: u32 = libc::EPOLLIN as u32;
const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
const EPOLLERR: u32 = libc::EPOLLERR as u32;
const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
const EPOLLONESHOT: u32 = libc::EPOLLONESHOT as u32;

/// Readers and writers of one descriptor. They share a single oneshot epoll
/// registration whose interest is the union of the armed ones.
#[derive(Debug)]
pub(super) struct FdEntry {
    fd: RawFd,
    readers: Vec<ObjRef<SourceInner>>,
    writers: Vec<ObjRef<SourceInner>>,
    /// Added to the epoll set.
    added: bool,
    /// epoll refused the descriptor (regular files), it is polled instead.
    fallback: bool,
}

impl FdEntry {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            readers: Vec::new(),
            writers: Vec::new(),
            added: false,
            fallback: false,
        }
    }

    fn interest(&self) -> u32 {
        let mut events = 0;
        if self.readers.iter().any(|s| s.is_armed()) {
            events |= EPOLLIN;
        }
        if self.writers.iter().any(|s| s.is_armed()) {
            events |= EPOLLOUT;
        }
        events
    }

    fn is_empty(&self) -> bool {
        self.readers.is_empty() && self.writers.is_empty()
    }

    fn list_mut(&mut self, kind: SourceType) -> &mut Vec<ObjRef<SourceInner>> {
        match kind {
            SourceType::Write => &mut self.writers,
            _ => &mut self.readers,
        }
    }
}

#[derive(Debug)]
pub(super) enum Registration {
    /// The manager's eventfd.
    Wake,
    /// Read end of the signal self-pipe.
    Signals,
    Timer(ClockKind, Tier),
    Fd(FdEntry),
    Process {
        pidfd: OwnedFd,
        source: ObjRef<SourceInner>,
    },
}

/// Every epoll registration of one manager, keyed by the token epoll hands
/// back.
#[derive(Debug)]
pub(super) struct Registry {
    poller: Poller,
    slots: Slab<Registration>,
    fds: HashMap<RawFd, usize>,
    processes: HashMap<ObjectId, usize>,
}

impl Registry {
    pub(super) fn new(poller: Poller) -> Self {
        Self {
            poller,
            slots: Slab::new(),
            fds: HashMap::new(),
            processes: HashMap::new(),
        }
    }

    pub(super) fn poller(&self) -> &Poller {
        &self.poller
    }

    pub(super) fn get(&self, key: usize) -> Option<&Registration> {
        self.slots.get(key)
    }

    /// Level-triggered registration for the manager's own descriptors.
    pub(super) fn register(&mut self, fd: RawFd, reg: Registration) -> io::Result<usize> {
        let key = self.slots.insert(reg);
        if let Err(e) = self.poller.add(fd, EPOLLIN, key) {
            self.slots.remove(key);
            return Err(e);
        }
        Ok(key)
    }

    pub(super) fn install_fd(&mut self, source: &ObjRef<SourceInner>, token: &ManagerToken) {
        let fd = source.ident() as RawFd;

        let key = *self
            .fds
            .entry(fd)
            .or_insert_with(|| self.slots.insert(Registration::Fd(FdEntry::new(fd))));

        if let Some(Registration::Fd(entry)) = self.slots.get_mut(key) {
            entry.list_mut(source.kind()).push(source.clone());
        }

        source.arm(token);
        self.update_fd(key);
    }

    pub(super) fn uninstall_fd(&mut self, source: &ObjRef<SourceInner>, token: &ManagerToken) {
        let fd = source.ident() as RawFd;
        let Some(&key) = self.fds.get(&fd) else {
            return;
        };

        let Some(Registration::Fd(entry)) = self.slots.get_mut(key) else {
            return;
        };

        entry.list_mut(source.kind()).retain(|s| !s.ptr_eq(source));
        source.disarm(token);

        if !entry.is_empty() {
            self.update_fd(key);
            return;
        }

        if entry.added
            && let Err(e) = self.poller.delete(fd)
        {
            warn_once!(fd, error = %e, "failed to remove descriptor from epoll");
        }
        self.slots.remove(key);
        self.fds.remove(&fd);
    }

    /// The handler of `source` returned, watch its descriptor again.
    pub(super) fn rearm_fd(&mut self, source: &ObjRef<SourceInner>, token: &ManagerToken) {
        let Some(&key) = self.fds.get(&(source.ident() as RawFd)) else {
            return;
        };

        source.arm(token);
        self.update_fd(key);
    }

    /// Brings the epoll interest of a descriptor in line with its armed
    /// sources.
    fn update_fd(&mut self, key: usize) {
        let Some(Registration::Fd(entry)) = self.slots.get_mut(key) else {
            return;
        };

        let interest = entry.interest();
        // A oneshot registration without interest stays disabled.
        if interest == 0 || entry.fallback {
            return;
        }

        let events = interest | EPOLLONESHOT;
        let res = if entry.added {
            self.poller.modify(entry.fd, events, key)
        } else {
            self.poller.add(entry.fd, events, key)
        };

        match res {
            Ok(()) => entry.added = true,
            Err(e) if !entry.added && e.raw_os_error() == Some(libc::EPERM) => {
                tracing::debug!(
                    fd = entry.fd,
                    "descriptor not pollable by epoll, polling it instead"
                );
                entry.fallback = true;
            }
            Err(e) => {
                warn_once!(fd = entry.fd, error = %e, "failed to watch descriptor");
            }
        }
    }

    /// Latches the sources of a descriptor that became ready, then rearms
    /// the registration for those still waiting.
    pub(super) fn dispatch_fd(&mut self, key: usize, events: u32, token: &ManagerToken) {
        let Some(Registration::Fd(entry)) = self.slots.get_mut(key) else {
            return;
        };

        let failed = events & (EPOLLERR | EPOLLHUP) != 0;
        let readable = failed || events & EPOLLIN != 0;
        let writable = failed || events & EPOLLOUT != 0;

        if readable {
            let mut bytes = None;
            for source in entry.readers.iter().filter(|s| s.is_armed()) {
                source.disarm(token);
                let n = *bytes.get_or_insert_with(|| readable_bytes(entry.fd));
                SourceInner::latch(source, n);
            }
        }

        if writable {
            for source in entry.writers.iter().filter(|s| s.is_armed()) {
                source.disarm(token);
                SourceInner::latch(source, 1);
            }
        }

        self.update_fd(key);
    }

    /// Polls descriptors epoll refused without blocking and dispatches the
    /// ready ones. Returns true if some remain armed.
    pub(super) fn poll_fallback(&mut self, token: &ManagerToken) -> bool {
        let watched: SmallVec<[(usize, RawFd, u32); 8]> = self
            .slots
            .iter()
            .filter_map(|(key, reg)| match reg {
                Registration::Fd(entry) if entry.fallback => {
                    let interest = entry.interest();
                    (interest != 0).then_some((key, entry.fd, interest))
                }
                _ => None,
            })
            .collect();

        if watched.is_empty() {
            return false;
        }

        let mut pollfds: SmallVec<[PollFd<'_>; 8]> = watched
            .iter()
            .map(|&(_, fd, interest)| {
                let mut flags = PollFlags::empty();
                if interest & EPOLLIN != 0 {
                    flags |= PollFlags::POLLIN;
                }
                if interest & EPOLLOUT != 0 {
                    flags |= PollFlags::POLLOUT;
                }
                // Safety: the descriptor stays open while its sources are
                // installed.
                PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, flags)
            })
            .collect();

        if let Err(e) = poll(&mut pollfds, PollTimeout::ZERO) {
            warn_once!(error = %e, "failed to poll descriptors");
            return true;
        }

        let ready: SmallVec<[(usize, u32); 8]> = pollfds
            .iter()
            .zip(&watched)
            .filter_map(|(pollfd, &(key, _, _))| {
                let revents = pollfd.revents().unwrap_or(PollFlags::empty());
                let mut events = 0;
                if revents.contains(PollFlags::POLLIN) {
                    events |= EPOLLIN;
                }
                if revents.contains(PollFlags::POLLOUT) {
                    events |= EPOLLOUT;
                }
                if revents
                    .intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL)
                {
                    events |= EPOLLERR;
                }
                (events != 0).then_some((key, events))
            })
            .collect();
        drop(pollfds);

        for (key, events) in ready {
            self.dispatch_fd(key, events, token);
        }

        self.slots.iter().any(|(_, reg)| {
            matches!(reg, Registration::Fd(entry) if entry.fallback && entry.interest() != 0)
        })
    }

    pub(super) fn install_process(
        &mut self,
        source: &ObjRef<SourceInner>,
        pidfd: OwnedFd,
    ) -> io::Result<()> {
        let fd = pidfd.as_raw_fd();
        let key = self.register(
            fd,
            Registration::Process {
                pidfd,
                source: source.clone(),
            },
        )?;
        self.processes.insert(source.id(), key);
        Ok(())
    }

    /// Removes the registration of a process source. Returns it if it was
    /// still installed.
    pub(super) fn remove_process(&mut self, id: ObjectId) -> Option<ObjRef<SourceInner>> {
        let key = self.processes.remove(&id)?;
        match self.slots.try_remove(key)? {
            Registration::Process { pidfd, source } => {
                if let Err(e) = self.poller.delete(pidfd.as_raw_fd()) {
                    warn_once!(error = %e, "failed to remove pidfd from epoll");
                }
                Some(source)
            }
            other => unreachable!("process token points to {:?}", other),
        }
    }
}

/// Bytes readable from `fd`: what is left until end of file for regular
/// files, what is buffered otherwise. 1 if it cannot be told.
fn readable_bytes(fd: RawFd) -> u64 {
    let mut stat = MaybeUninit::<libc::stat>::uninit();

    if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } == 0 {
        // Safety: fstat succeeded.
        let stat = unsafe { stat.assume_init() };
        if stat.st_mode & libc::S_IFMT == libc::S_IFREG {
            let pos = unsafe { libc::lseek(fd, 0, libc::SEEK_CUR) };
            if pos >= 0 {
                return (stat.st_size as u64).saturating_sub(pos as u64);
            }
        }
    }

    let mut n: libc::c_int = 0;
    if unsafe { libc::ioctl(fd, libc::FIONREAD, &mut n as *mut libc::c_int) } == 0 {
        n.max(0) as u64
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    #[test]
    fn test_readable_bytes_of_pipe() -> anyhow::Result<()> {
        let (reader, mut writer) = std::io::pipe()?;
        assert_eq!(readable_bytes(reader.as_raw_fd()), 0);

        writer.write_all(b"hello")?;
        assert_eq!(readable_bytes(reader.as_raw_fd()), 5);
        Ok(())
    }

    #[test]
    fn test_readable_bytes_of_file() -> anyhow::Result<()> {
        let mut file = tempfile::tempfile()?;
        file.write_all(&[0u8; 100])?;

        file.seek(SeekFrom::Start(40))?;
        assert_eq!(readable_bytes(file.as_raw_fd()), 60);

        file.seek(SeekFrom::End(0))?;
        assert_eq!(readable_bytes(file.as_raw_fd()), 0);
        Ok(())
    }
}
