//! Points in time understood by timers and `Queue::after`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Clock a timer is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ClockKind {
    /// Does not jump, does not advance while the system is suspended.
    Monotonic,
    /// Wall-clock time. Follows clock changes.
    Wall,
}

impl ClockKind {
    pub(crate) fn clock_id(self) -> libc::clockid_t {
        match self {
            ClockKind::Monotonic => libc::CLOCK_MONOTONIC,
            ClockKind::Wall => libc::CLOCK_REALTIME,
        }
    }

    /// Current time of this clock, in nanoseconds.
    pub(crate) fn now(self) -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };

        // Cannot fail for the clock ids above.
        let ret = unsafe { libc::clock_gettime(self.clock_id(), &mut ts) };
        debug_assert_eq!(ret, 0, "clock_gettime failed");

        (ts.tv_sec as u64)
            .saturating_mul(NANOS_PER_SEC)
            .saturating_add(ts.tv_nsec as u64)
    }
}

pub(crate) fn to_timespec(ns: u64) -> libc::timespec {
    libc::timespec {
        tv_sec: (ns / NANOS_PER_SEC) as libc::time_t,
        tv_nsec: (ns % NANOS_PER_SEC) as libc::c_long,
    }
}

pub(crate) fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// When a timer first fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchTime {
    /// As soon as possible.
    Now,
    /// Never. Disarms a timer.
    Forever,
    /// Nanoseconds on the monotonic clock.
    Monotonic(u64),
    /// Nanoseconds since the Unix epoch. Timers set to a wall time follow
    /// changes of the system clock.
    Wall(u64),
}

impl DispatchTime {
    /// `d` from now, on the monotonic clock.
    pub fn after(d: Duration) -> DispatchTime {
        DispatchTime::Monotonic(ClockKind::Monotonic.now().saturating_add(nanos(d)))
    }

    /// `d` from now, on the wall clock.
    pub fn wall_after(d: Duration) -> DispatchTime {
        DispatchTime::Wall(ClockKind::Wall.now().saturating_add(nanos(d)))
    }

    /// Times before the epoch are clamped to it.
    pub fn from_system_time(t: SystemTime) -> DispatchTime {
        let since_epoch = t.duration_since(UNIX_EPOCH).unwrap_or_default();
        DispatchTime::Wall(nanos(since_epoch))
    }

    /// Clock and absolute nanoseconds. `None` for `Forever`.
    pub(crate) fn resolve(self) -> Option<(ClockKind, u64)> {
        match self {
            DispatchTime::Now => Some((ClockKind::Monotonic, ClockKind::Monotonic.now())),
            DispatchTime::Forever => None,
            DispatchTime::Monotonic(ns) => Some((ClockKind::Monotonic, ns)),
            DispatchTime::Wall(ns) => Some((ClockKind::Wall, ns)),
        }
    }
}

impl From<Duration> for DispatchTime {
    fn from(d: Duration) -> Self {
        DispatchTime::after(d)
    }
}
