use super::poller::cvt;
use crate::time::{self, ClockKind};
use crate::timer::Tier;
use crate::utils::retry_with_backoff;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

#[derive(Debug, PartialEq, Eq)]
pub(super) enum TimerRead {
    Expired,
    /// Nothing to read: the timer was reprogrammed after it went off.
    Spurious,
    /// The wall clock was set.
    ClockChanged,
}

/// One kernel timer per (clock, tier).
#[derive(Debug)]
pub(super) struct TimerFds {
    fds: Vec<((ClockKind, Tier), OwnedFd)>,
}

impl TimerFds {
    pub(super) fn new() -> io::Result<Self> {
        let mut fds = Vec::with_capacity(6);

        for clock in [ClockKind::Monotonic, ClockKind::Wall] {
            let clock_id = clock.clock_id();
            for tier in Tier::ALL {
                let fd = retry_with_backoff("timerfd_create", || {
                    cvt(unsafe {
                        libc::timerfd_create(clock_id, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
                    })
                })?;
                // Safety: freshly created, owned by nobody else.
                fds.push(((clock, tier), unsafe { OwnedFd::from_raw_fd(fd) }));
            }
        }

        Ok(Self { fds })
    }

    pub(super) fn iter(&self) -> impl Iterator<Item = (ClockKind, Tier, RawFd)> + '_ {
        self.fds
            .iter()
            .map(|((clock, tier), fd)| (*clock, *tier, fd.as_raw_fd()))
    }

    fn fd(&self, clock: ClockKind, tier: Tier) -> RawFd {
        match self.fds.iter().find(|(key, _)| *key == (clock, tier)) {
            Some((_, fd)) => fd.as_raw_fd(),
            None => unreachable!("one timerfd per clock and tier"),
        }
    }

    /// Arms the timer at absolute time `at`, disarms it for `None`.
    pub(super) fn program(&self, clock: ClockKind, tier: Tier, at: Option<u64>) -> io::Result<()> {
        let mut flags = 0;
        let value = match at {
            // A zero value would disarm.
            Some(at) => {
                flags |= libc::TFD_TIMER_ABSTIME;
                if clock == ClockKind::Wall {
                    flags |= libc::TFD_TIMER_CANCEL_ON_SET;
                }
                time::to_timespec(at.max(1))
            }
            None => time::to_timespec(0),
        };

        let spec = libc::itimerspec {
            it_interval: time::to_timespec(0),
            it_value: value,
        };

        let fd = self.fd(clock, tier);
        cvt(unsafe { libc::timerfd_settime(fd, flags, &spec, std::ptr::null_mut()) }).map(drop)
    }

    pub(super) fn read(&self, clock: ClockKind, tier: Tier) -> io::Result<TimerRead> {
        let mut expirations: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd(clock, tier),
                &mut expirations as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };

        if ret >= 0 {
            return Ok(TimerRead::Expired);
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ECANCELED) => Ok(TimerRead::ClockChanged),
            Some(libc::EAGAIN) => Ok(TimerRead::Spurious),
            _ => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_and_read() -> anyhow::Result<()> {
        let fds = TimerFds::new()?;
        assert_eq!(fds.iter().count(), 6);

        let clock = ClockKind::Monotonic;
        assert_eq!(fds.read(clock, Tier::Normal)?, TimerRead::Spurious);

        // In the past: expires right away.
        fds.program(clock, Tier::Normal, Some(clock.now() - 1))?;
        std::thread::sleep(std::time::Duration::from_millis(1));
        assert_eq!(fds.read(clock, Tier::Normal)?, TimerRead::Expired);

        fds.program(clock, Tier::Normal, Some(clock.now() + 1_000_000_000))?;
        fds.program(clock, Tier::Normal, None)?;
        assert_eq!(fds.read(clock, Tier::Normal)?, TimerRead::Spurious);
        Ok(())
    }
}
