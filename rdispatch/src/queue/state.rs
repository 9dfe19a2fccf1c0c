//! Queue state word.
//!
//! ```text
//!   63   62   61   60  59 .. 40  39 .. 32  31 .. 0
//!  +----+----+----+----+--------+---------+--------+
//!  | S  | I  | P  | B  | susp.  | unused  | running|
//!  +----+----+----+----+--------+---------+--------+
//! ```
//!
//! - `S` (SCHEDULED): a drainer owns the queue, either enqueued on the target
//!   or running. Doubles as the drain lock.
//! - `I` (INACTIVE): built inactive and not activated yet.
//! - `P` (STASHED): the drainer set aside an item it could not admit yet.
//! - `B` (STASH_BARRIER): the stashed item needs `running == 0`.
//! - suspend count, running count (width slots in use).

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub(crate) struct StateBits: u64 {
        const SCHEDULED = 1 << 63;
        const INACTIVE = 1 << 62;
        const STASHED = 1 << 61;
        const STASH_BARRIER = 1 << 60;
    }
}

pub(crate) const SUSPEND_SHIFT: u32 = 40;
pub(crate) const SUSPEND_ONE: u64 = 1 << SUSPEND_SHIFT;
pub(crate) const SUSPEND_MAX: u64 = (1 << 20) - 1;
pub(crate) const RUNNING_MASK: u64 = u32::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct State(pub(crate) u64);

impl State {
    pub(crate) fn bits(self) -> StateBits {
        StateBits::from_bits_truncate(self.0)
    }

    pub(crate) fn is_scheduled(self) -> bool {
        self.bits().contains(StateBits::SCHEDULED)
    }

    pub(crate) fn is_inactive(self) -> bool {
        self.bits().contains(StateBits::INACTIVE)
    }

    pub(crate) fn is_stashed(self) -> bool {
        self.bits().contains(StateBits::STASHED)
    }

    pub(crate) fn suspend_count(self) -> u64 {
        (self.0 >> SUSPEND_SHIFT) & SUSPEND_MAX
    }

    pub(crate) fn running(self) -> u64 {
        self.0 & RUNNING_MASK
    }

    /// Suspended or not activated yet.
    pub(crate) fn is_held(self) -> bool {
        self.is_inactive() || self.suspend_count() > 0
    }

    /// Could the item the drainer stashed be admitted now?
    pub(crate) fn stash_admissible(self, width: u32) -> bool {
        if self.bits().contains(StateBits::STASH_BARRIER) {
            self.running() == 0
        } else {
            self.running() < u64::from(width)
        }
    }
}
