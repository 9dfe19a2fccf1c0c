//! Timer bookkeeping for the manager thread.
//!
//! Timers are partitioned by clock and tier. Each partition is programmed
//! into one kernel timer; nearby timers of a tier share its wakeups.

use crate::object::ObjectId;
use crate::queue::Priority;
use crate::time::{self, ClockKind, DispatchTime};
use std::time::Duration;

mod heap;
pub(crate) use heap::TimerHeap;

/// Coalescing class of a timer, derived from the priority of the queue its
/// source delivers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Tier {
    Critical,
    Normal,
    Background,
}

impl Tier {
    pub(crate) const ALL: [Tier; 3] = [Tier::Critical, Tier::Normal, Tier::Background];

    pub(crate) fn for_priority(priority: Priority) -> Tier {
        match priority {
            Priority::High => Tier::Critical,
            Priority::Default | Priority::Low => Tier::Normal,
            Priority::Background => Tier::Background,
        }
    }

    /// How late past its target a timer of this tier may fire so that it
    /// shares a wakeup with its neighbours.
    pub(crate) fn window(self) -> u64 {
        match self {
            Tier::Critical => 0,
            Tier::Normal => 2_000_000,
            Tier::Background => 100_000_000,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Configuration requested through `Source::set_timer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerSpec {
    pub(crate) start: DispatchTime,
    pub(crate) interval: Option<Duration>,
    pub(crate) leeway: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TimerEntry {
    pub(crate) id: ObjectId,
    pub(crate) clock: ClockKind,
    pub(crate) tier: Tier,

    /// Next time the timer should fire.
    pub(crate) target: u64,

    /// Latest acceptable fire time, `target + leeway`.
    pub(crate) deadline: u64,

    /// Zero for one-shot timers.
    pub(crate) interval: u64,
    pub(crate) leeway: u64,
    pub(crate) last_fire: Option<u64>,

    /// Whole intervals skipped by the last fire.
    pub(crate) missed: u64,
}

impl TimerEntry {
    /// `None` when `spec` never fires.
    pub(crate) fn new(id: ObjectId, spec: &TimerSpec, tier: Tier, strict: bool) -> Option<Self> {
        let (clock, target) = spec.start.resolve()?;

        let interval = spec.interval.map_or(0, time::nanos);
        let mut leeway = if strict { 0 } else { time::nanos(spec.leeway) };
        if interval > 0 {
            leeway = leeway.min(interval / 2);
        }

        Some(Self {
            id,
            clock,
            tier,
            target,
            deadline: target.saturating_add(leeway),
            interval,
            leeway,
            last_fire: None,
            missed: 0,
        })
    }

    pub(crate) fn is_repeating(&self) -> bool {
        self.interval > 0
    }

    /// Fires at `now`, which is past the target. Advances a repeating timer
    /// over every interval that elapsed and returns the number of fires to
    /// deliver.
    pub(crate) fn fire(&mut self, now: u64) -> u64 {
        debug_assert!(now >= self.target);
        self.last_fire = Some(now);

        if !self.is_repeating() {
            self.missed = 0;
            return 1;
        }

        self.missed = (now - self.target) / self.interval;
        let fires = self.missed.saturating_add(1);

        self.target = self
            .target
            .saturating_add(fires.saturating_mul(self.interval));
        self.deadline = self.target.saturating_add(self.leeway);

        fires
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const MS: u64 = 1_000_000;

    fn repeating(start: u64, interval_ms: u64, leeway_ms: u64) -> TimerEntry {
        let spec = TimerSpec {
            start: DispatchTime::Monotonic(start),
            interval: Some(Duration::from_millis(interval_ms)),
            leeway: Duration::from_millis(leeway_ms),
        };
        TimerEntry::new(ObjectId::next(), &spec, Tier::Normal, false).unwrap()
    }

    #[rstest]
    #[case::on_time(0, 0)]
    #[case::within_first_interval(9, 0)]
    #[case::one_missed(10, 1)]
    #[case::many_missed(57, 5)]
    fn test_missed_intervals(#[case] late_ms: u64, #[case] k: u64) {
        let t = 1_000 * MS;
        let mut entry = repeating(t, 10, 0);

        let fires = entry.fire(t + late_ms * MS);

        assert_eq!(entry.missed, k);
        assert_eq!(fires, k + 1);
        assert_eq!(entry.target, t + (k + 1) * 10 * MS);
        assert_eq!(entry.last_fire, Some(t + late_ms * MS));
    }

    #[test]
    fn test_leeway_clamped_to_half_interval() {
        let entry = repeating(0, 10, 50);
        assert_eq!(entry.leeway, 5 * MS);
        assert_eq!(entry.deadline, 5 * MS);
    }

    #[test]
    fn test_strict_ignores_leeway() {
        let spec = TimerSpec {
            start: DispatchTime::Monotonic(7),
            interval: None,
            leeway: Duration::from_secs(1),
        };
        let entry = TimerEntry::new(ObjectId::next(), &spec, Tier::Background, true).unwrap();
        assert_eq!(entry.deadline, 7);
    }

    #[test]
    fn test_forever_has_no_entry() {
        let spec = TimerSpec {
            start: DispatchTime::Forever,
            interval: Some(Duration::from_secs(1)),
            leeway: Duration::ZERO,
        };
        assert!(TimerEntry::new(ObjectId::next(), &spec, Tier::Normal, false).is_none());
    }

    #[test]
    fn test_one_shot_fires_once() {
        let spec = TimerSpec {
            start: DispatchTime::Wall(100),
            interval: None,
            leeway: Duration::ZERO,
        };
        let mut entry = TimerEntry::new(ObjectId::next(), &spec, Tier::Critical, false).unwrap();
        assert_eq!(entry.clock, ClockKind::Wall);
        assert!(!entry.is_repeating());
        assert_eq!(entry.fire(10_000), 1);
    }

    #[test]
    fn test_tiers_from_priority() {
        assert_eq!(Tier::for_priority(Priority::High), Tier::Critical);
        assert_eq!(Tier::for_priority(Priority::Low), Tier::Normal);
        assert_eq!(Tier::for_priority(Priority::Background), Tier::Background);
        assert_eq!(Tier::Critical.window(), 0);
    }
}
