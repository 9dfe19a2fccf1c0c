use super::{QueueInner, QueueKind, State, StateBits};
use crate::context;
use crate::continuation::Continuation;
use crate::object::{InternalRef, ObjRef, XRef};
use crate::queue::state::{SUSPEND_MAX, SUSPEND_ONE};
use smallvec::SmallVec;
use std::ptr;
use std::sync::atomic::Ordering;

/// Items a drainer handles before re-enqueueing itself on its target, so one
/// busy queue cannot hold a thread forever.
pub(crate) const DRAIN_BUDGET: usize = 16;

impl QueueInner {
    pub(crate) fn enqueue<Q: InternalRef<QueueInner>>(this: &Q, cont: Box<Continuation>) {
        match &this.kind {
            QueueKind::Root(handle) => handle.pool.push(this.priority, cont),
            QueueKind::Custom => {
                this.items.push(cont);
                Self::wakeup(this);
            }
        }
    }

    /// Schedules a drainer on the target if the queue has admissible work
    /// and nobody owns it yet.
    pub(crate) fn wakeup<Q: InternalRef<QueueInner>>(this: &Q) {
        let mut cur = this.state.load(Ordering::SeqCst);

        loop {
            let state = State(cur);
            if state.is_scheduled() || state.is_held() {
                return;
            }

            let has_work = if state.is_stashed() {
                state.stash_admissible(this.width)
            } else {
                !this.items.is_empty()
            };
            if !has_work {
                return;
            }

            match this.state.compare_exchange_weak(
                cur,
                cur | StateBits::SCHEDULED.bits(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }

        tracing::trace!(label = %this.label, "queue scheduled");
        this.push_to_target(Continuation::drain(this.pin()));
    }

    pub(super) fn push_to_target(&self, cont: Box<Continuation>) {
        match self.target() {
            Some(target) => Self::enqueue(&target, cont),
            None => unreachable!("root queues are never drained"),
        }
    }

    /// Runs on the target while holding `SCHEDULED`.
    pub(crate) fn drain(this: ObjRef<QueueInner>) {
        debug_assert!(this.state().is_scheduled());
        let mut budget = DRAIN_BUDGET;

        loop {
            let state = this.state();
            if state.is_held() {
                break;
            }

            if budget == 0 {
                // Keep `SCHEDULED`, the drainer moves to the back of the
                // target.
                tracing::trace!(label = %this.label, "drain budget exhausted, yielding");
                this.push_to_target(Continuation::drain(this.clone()));
                return;
            }

            let item = if state.is_stashed() {
                this.take_stash()
            } else {
                // Safety: we hold the drain lock.
                unsafe { this.items.pop() }
            };
            let Some(item) = item else {
                break;
            };

            if this.width == 1 || item.is_barrier() {
                if this.state().running() > 0 {
                    this.stash(item, true);
                    break;
                }

                let _frame = context::enter_queue(&this, true);
                item.invoke();
            } else {
                // Only the drainer admits while `SCHEDULED` is set, others
                // can only lower `running`.
                if this.state().running() >= u64::from(this.width) {
                    this.stash(item, false);
                    break;
                }

                this.state.fetch_add(1, Ordering::AcqRel);
                this.push_to_target(Continuation::redirect(this.clone(), item));
            }

            budget -= 1;
        }

        Self::unlock_and_wakeup(&this);
    }

    fn unlock_and_wakeup(this: &ObjRef<QueueInner>) {
        this.state
            .fetch_and(!StateBits::SCHEDULED.bits(), Ordering::SeqCst);
        Self::wakeup(this);
    }

    fn stash(&self, item: Box<Continuation>, barrier: bool) {
        let prev = self.stash.swap(Box::into_raw(item), Ordering::AcqRel);
        debug_assert!(prev.is_null(), "stash already occupied");

        let mut bits = StateBits::STASHED;
        bits.set(StateBits::STASH_BARRIER, barrier);
        self.state.fetch_or(bits.bits(), Ordering::AcqRel);
    }

    fn take_stash(&self) -> Option<Box<Continuation>> {
        let item = self.stash.swap(ptr::null_mut(), Ordering::AcqRel);
        self.state.fetch_and(
            !(StateBits::STASHED | StateBits::STASH_BARRIER).bits(),
            Ordering::AcqRel,
        );

        // Safety: stored from `Box::into_raw` in `stash`.
        (!item.is_null()).then(|| unsafe { Box::from_raw(item) })
    }

    /// A redirected item, or a sync caller holding a width slot, finished.
    pub(crate) fn complete_redirect(this: &ObjRef<QueueInner>) {
        let prev = State(this.state.fetch_sub(1, Ordering::AcqRel));
        debug_assert!(prev.running() > 0, "running count underflow");
        Self::wakeup(this);
    }

    /// Takes the drain lock of an idle, empty queue.
    pub(crate) fn try_lock_exclusive(this: &ObjRef<QueueInner>) -> bool {
        if !this.items.is_empty() {
            return false;
        }

        if this
            .state
            .compare_exchange(
                0,
                StateBits::SCHEDULED.bits(),
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_err()
        {
            return false;
        }

        // Work may have been pushed before the lock was taken. It must run
        // first, so back off.
        if !this.items.is_empty() {
            Self::unlock_and_wakeup(this);
            return false;
        }

        true
    }

    pub(crate) fn unlock_exclusive(this: &ObjRef<QueueInner>) {
        Self::unlock_and_wakeup(this);
    }

    /// Takes up to `n` width slots on this queue and on every queue up to
    /// the root, without waiting. Holds as many on each of them, 0 when one
    /// of them is busy, held or full. Dropping it gives them back.
    pub(crate) fn try_reserve_width(this: &ObjRef<QueueInner>, n: u32) -> WidthReservation {
        let mut granted = n;
        let mut taken: SmallVec<[(ObjRef<QueueInner>, u32); 4]> = SmallVec::new();
        let mut cur = Some(this.clone());

        while let Some(q) = cur {
            if q.is_root() || granted == 0 {
                break;
            }
            granted = q.reserve_slots(granted);
            cur = q.target();
            taken.push((q, granted));
        }

        // Queues further up granted less, hand the difference back.
        for (q, got) in &taken {
            if *got > granted {
                Self::release_slots(q, *got - granted);
            }
        }

        let queues = if granted == 0 {
            SmallVec::new()
        } else {
            taken.into_iter().map(|(q, _)| q).collect()
        };

        WidthReservation {
            queues,
            slots: granted,
        }
    }

    // Same admission rule as `try_reserve_slot`: the drainer checks `running`
    // before bumping it, so never race one.
    fn reserve_slots(&self, n: u32) -> u32 {
        let mut cur = self.state.load(Ordering::Acquire);

        loop {
            let state = State(cur);
            if !state.bits().is_empty() || state.is_held() {
                return 0;
            }

            let free = u64::from(self.width).saturating_sub(state.running());
            let k = free.min(u64::from(n));
            if k == 0 {
                return 0;
            }

            match self.state.compare_exchange_weak(
                cur,
                cur + k,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return k as u32,
                Err(actual) => cur = actual,
            }
        }
    }

    fn release_slots(this: &ObjRef<QueueInner>, n: u32) {
        let prev = State(this.state.fetch_sub(u64::from(n), Ordering::AcqRel));
        debug_assert!(prev.running() >= u64::from(n), "running count underflow");
        Self::wakeup(this);
    }

    /// Narrowest width of this queue and the queues it targets.
    pub(crate) fn chain_width(this: &ObjRef<QueueInner>) -> u32 {
        let mut width = this.width;
        let mut cur = this.target();
        while let Some(q) = cur {
            if q.is_root() {
                break;
            }
            width = width.min(q.width);
            cur = q.target();
        }
        width
    }

    /// Pushes `cont` straight to the root queue at the end of the chain,
    /// bypassing every width check on the way.
    pub(crate) fn enqueue_on_root(this: &ObjRef<QueueInner>, cont: Box<Continuation>) {
        let mut cur = this.clone();
        while let Some(target) = cur.target() {
            cur = target;
        }
        Self::enqueue(&cur, cont);
    }

    /// Takes one width slot of a queue nobody is draining.
    pub(crate) fn try_reserve_slot(this: &ObjRef<QueueInner>) -> bool {
        let mut cur = this.state.load(Ordering::Acquire);

        loop {
            let state = State(cur);
            if !state.bits().is_empty()
                || state.is_held()
                || state.running() >= u64::from(this.width)
                || !this.items.is_empty()
            {
                return false;
            }

            match this.state.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    pub(super) fn suspend(this: &XRef<QueueInner>) {
        if this.is_root() {
            tracing::debug!(label = %this.label, "suspend on a root queue ignored");
            return;
        }

        let prev = State(this.state.fetch_add(SUSPEND_ONE, Ordering::AcqRel));
        if prev.suspend_count() == SUSPEND_MAX {
            crash!("too many suspends of queue {}", this.label);
        }

        tracing::trace!(label = %this.label, count = prev.suspend_count() + 1, "queue suspended");
    }

    #[track_caller]
    pub(super) fn resume(this: &XRef<QueueInner>) {
        if this.is_root() {
            tracing::debug!(label = %this.label, "resume on a root queue ignored");
            return;
        }

        let mut cur = this.state.load(Ordering::Acquire);

        loop {
            let state = State(cur);
            if state.suspend_count() == 0 {
                if state.is_inactive() {
                    Self::activate(this);
                    return;
                }
                crash!("over-resume of queue {}", this.label);
            }

            match this.state.compare_exchange_weak(
                cur,
                cur - SUSPEND_ONE,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::trace!(
                        label = %this.label,
                        count = state.suspend_count() - 1,
                        "queue resumed"
                    );
                    if state.suspend_count() == 1 {
                        Self::wakeup(this);
                    }
                    return;
                }
                Err(actual) => cur = actual,
            }
        }
    }

    pub(super) fn activate(this: &XRef<QueueInner>) {
        let prev = State(
            this.state
                .fetch_and(!StateBits::INACTIVE.bits(), Ordering::AcqRel),
        );

        if prev.is_inactive() {
            tracing::trace!(label = %this.label, "queue activated");
            Self::wakeup(this);
        }
    }

    #[track_caller]
    pub(super) fn set_target(this: &XRef<QueueInner>, target: &XRef<QueueInner>) {
        if this.is_root() {
            crash!("cannot change the target of root queue {}", this.label);
        }

        let target = target.as_internal();
        let me = this.as_internal();
        if Self::any_in_chain(&target, |q| q.ptr_eq(&me)) {
            crash!(
                "setting target of {} to {} would create a cycle",
                this.label,
                target.label
            );
        }

        tracing::trace!(label = %this.label, target = %target.label, "queue target changed");
        let prev = this.target.write().replace(target);
        drop(prev);
    }
}

/// Width slots taken on a chain of queues by
/// [`QueueInner::try_reserve_width`].
#[must_use]
pub(crate) struct WidthReservation {
    queues: SmallVec<[ObjRef<QueueInner>; 4]>,
    slots: u32,
}

impl WidthReservation {
    pub(crate) fn slots(&self) -> u32 {
        self.slots
    }
}

impl Drop for WidthReservation {
    fn drop(&mut self) {
        for q in &self.queues {
            QueueInner::release_slots(q, self.slots);
        }
    }
}
