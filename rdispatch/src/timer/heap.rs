use super::{TimerEntry, Tier};
use crate::object::ObjectId;
use crate::time::ClockKind;
use smallvec::SmallVec;
use std::collections::{BTreeSet, HashMap};

const CLOCKS: [ClockKind; 2] = [ClockKind::Monotonic, ClockKind::Wall];

/// Timers of one (clock, tier) partition, ordered twice.
#[derive(Debug, Default)]
struct TimerList {
    /// Drives what fires next.
    by_target: BTreeSet<(u64, ObjectId)>,

    /// Drives the latest acceptable wakeup.
    by_deadline: BTreeSet<(u64, ObjectId)>,
}

impl TimerList {
    fn insert(&mut self, entry: &TimerEntry) {
        self.by_target.insert((entry.target, entry.id));
        self.by_deadline.insert((entry.deadline, entry.id));
    }

    fn remove(&mut self, entry: &TimerEntry) {
        self.by_target.remove(&(entry.target, entry.id));
        self.by_deadline.remove(&(entry.deadline, entry.id));
    }
}

/// A timer that fired, with the number of fires to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Fired {
    pub(crate) id: ObjectId,
    pub(crate) fires: u64,
}

/// Every timer known to one manager thread.
///
/// Armed entries live in exactly one partition. Exhausted one-shot timers
/// and timers disarmed on request move to the disarmed set until they are
/// rearmed or removed.
#[derive(Debug)]
pub(crate) struct TimerHeap {
    /// Indexed by `partition`.
    lists: [TimerList; 6],
    armed: HashMap<ObjectId, TimerEntry>,
    disarmed: HashMap<ObjectId, TimerEntry>,

    /// Partitions whose kernel timer must be reprogrammed.
    dirty: [bool; 6],
}

fn partition(clock: ClockKind, tier: Tier) -> usize {
    let clock = match clock {
        ClockKind::Monotonic => 0,
        ClockKind::Wall => 1,
    };
    clock * Tier::ALL.len() + tier.index()
}

impl TimerHeap {
    pub(crate) fn new() -> Self {
        Self {
            lists: Default::default(),
            armed: HashMap::new(),
            disarmed: HashMap::new(),
            dirty: [false; 6],
        }
    }

    /// Inserts or replaces the timer with `entry.id`.
    pub(crate) fn arm(&mut self, entry: TimerEntry) {
        self.remove(entry.id);

        let p = partition(entry.clock, entry.tier);
        self.lists[p].insert(&entry);
        self.dirty[p] = true;
        self.armed.insert(entry.id, entry);
    }

    /// Moves an armed timer to the disarmed set. Returns false if it was not
    /// armed.
    pub(crate) fn disarm(&mut self, id: ObjectId) -> bool {
        let Some(entry) = self.armed.remove(&id) else {
            return false;
        };

        let p = partition(entry.clock, entry.tier);
        self.lists[p].remove(&entry);
        self.dirty[p] = true;
        self.disarmed.insert(id, entry);
        true
    }

    /// Moves a timer disarmed on request back into its partition. One-shot
    /// timers that already fired stay disarmed.
    pub(crate) fn resume(&mut self, id: ObjectId) -> bool {
        match self.disarmed.get(&id) {
            Some(entry) if entry.is_repeating() || entry.last_fire.is_none() => {}
            _ => return false,
        }

        match self.disarmed.remove(&id) {
            Some(entry) => {
                self.arm(entry);
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove(&mut self, id: ObjectId) -> Option<TimerEntry> {
        if let Some(entry) = self.armed.remove(&id) {
            let p = partition(entry.clock, entry.tier);
            self.lists[p].remove(&entry);
            self.dirty[p] = true;
            return Some(entry);
        }
        self.disarmed.remove(&id)
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self, id: ObjectId) -> bool {
        self.armed.contains_key(&id)
    }

    #[cfg(test)]
    pub(crate) fn get(&self, id: ObjectId) -> Option<&TimerEntry> {
        self.armed.get(&id).or_else(|| self.disarmed.get(&id))
    }

    /// When the kernel timer of a partition should go off:
    /// `min(earliest deadline, earliest target + window)`.
    pub(crate) fn wake_time(&self, clock: ClockKind, tier: Tier) -> Option<u64> {
        let list = &self.lists[partition(clock, tier)];
        let (target, _) = list.by_target.first()?;
        let coalesced = target.saturating_add(tier.window());

        Some(match list.by_deadline.first() {
            Some((deadline, _)) => coalesced.min(*deadline),
            None => coalesced,
        })
    }

    /// Fires every timer of the partition whose target is at or before
    /// `now`, in target order. Repeating timers are reinserted at their next
    /// target, one-shot timers are disarmed.
    pub(crate) fn fire_due(
        &mut self,
        clock: ClockKind,
        tier: Tier,
        now: u64,
    ) -> SmallVec<[Fired; 8]> {
        let p = partition(clock, tier);
        let mut fired = SmallVec::new();

        while let Some(&(target, id)) = self.lists[p].by_target.first() {
            if target > now {
                break;
            }

            let Some(mut entry) = self.armed.remove(&id) else {
                unreachable!("timer list out of sync with armed entries");
            };
            self.lists[p].remove(&entry);

            let fires = entry.fire(now);
            fired.push(Fired { id, fires });

            if entry.is_repeating() {
                self.lists[p].insert(&entry);
                self.armed.insert(id, entry);
            } else {
                self.disarmed.insert(id, entry);
            }
        }

        // The kernel timer went off either way and must be set again.
        self.dirty[p] = true;
        fired
    }

    /// Forces every partition of `clock` to be reprogrammed. Used when the
    /// wall clock was changed.
    pub(crate) fn invalidate(&mut self, clock: ClockKind) {
        for tier in Tier::ALL {
            self.dirty[partition(clock, tier)] = true;
        }
    }

    /// Partitions to reprogram since the last call.
    pub(crate) fn take_dirty(&mut self) -> SmallVec<[(ClockKind, Tier); 6]> {
        let mut out = SmallVec::new();
        for clock in CLOCKS {
            for tier in Tier::ALL {
                let p = partition(clock, tier);
                if std::mem::take(&mut self.dirty[p]) {
                    out.push((clock, tier));
                }
            }
        }
        out
    }
}
