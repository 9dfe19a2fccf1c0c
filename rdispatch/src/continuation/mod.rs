use crate::context;
use crate::object::ObjRef;
use crate::object::voucher::{self, Voucher};
use crate::queue::sync::SyncHandoff;
use crate::queue::{Priority, QueueInner};
use crate::runtime;
use crate::sync::Group;
use bitflags::bitflags;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::AtomicPtr;

mod cache;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub(crate) struct ContinuationFlags: u32 {
        /// Submitted without waiting for completion.
        const ASYNC = 1;

        /// Must run with exclusive access to its queue.
        const BARRIER = 1 << 1;

        /// Hands the queue over to a thread blocked in a sync call.
        const SYNC_WAITER = 1 << 2;

        /// Leaves the attached group once invoked.
        const GROUP_LEAVE = 1 << 3;

        /// A voucher was captured at submission and is adopted while running.
        const ADOPT_VOUCHER = 1 << 4;
    }
}

pub(crate) type Closure = Box<dyn FnOnce() + Send + 'static>;

pub(crate) enum Work {
    Closure(Closure),

    /// Drain the queue. Pushed on the target when the queue gets scheduled.
    Drain(ObjRef<QueueInner>),

    /// An item of a wide queue running on the target while holding one of
    /// the owner's width slots.
    Redirect {
        owner: ObjRef<QueueInner>,
        inner: Box<Continuation>,
    },

    SyncWaiter(Arc<SyncHandoff>),

    /// Already invoked, the box sits in the cache.
    Consumed,
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Work::Closure(_) => f.write_str("Closure"),
            Work::Drain(q) => f.debug_tuple("Drain").field(&q.label()).finish(),
            Work::Redirect { owner, inner } => f
                .debug_struct("Redirect")
                .field("owner", &owner.label())
                .field("inner", &inner.work)
                .finish(),
            Work::SyncWaiter(_) => f.write_str("SyncWaiter"),
            Work::Consumed => f.write_str("Consumed"),
        }
    }
}

/// A unit of work. Linked intrusively into queues.
#[derive(Debug)]
pub(crate) struct Continuation {
    pub(crate) next: AtomicPtr<Continuation>,
    flags: ContinuationFlags,
    work: Work,
    voucher: Option<Voucher>,
    priority: Priority,
    group: Option<Group>,
}

impl Continuation {
    fn alloc(flags: ContinuationFlags, work: Work, priority: Priority) -> Box<Self> {
        cache::alloc(Continuation {
            next: AtomicPtr::new(ptr::null_mut()),
            flags,
            work,
            voucher: None,
            priority,
            group: None,
        })
    }

    /// User work, capturing the voucher adopted by the submitting thread.
    pub(crate) fn closure(
        closure: Closure,
        mut flags: ContinuationFlags,
        priority: Priority,
    ) -> Box<Self> {
        let voucher = voucher::current();
        if voucher.is_some() {
            flags |= ContinuationFlags::ADOPT_VOUCHER;
        }

        let mut cont = Self::alloc(flags, Work::Closure(closure), priority);
        cont.voucher = voucher;
        cont
    }

    pub(crate) fn drain(queue: ObjRef<QueueInner>) -> Box<Self> {
        let priority = queue.priority();
        Self::alloc(ContinuationFlags::ASYNC, Work::Drain(queue), priority)
    }

    pub(crate) fn redirect(owner: ObjRef<QueueInner>, inner: Box<Continuation>) -> Box<Self> {
        let flags = ContinuationFlags::ASYNC;
        let priority = inner.priority;
        Self::alloc(flags, Work::Redirect { owner, inner }, priority)
    }

    pub(crate) fn sync_waiter(
        handoff: Arc<SyncHandoff>,
        barrier: bool,
        priority: Priority,
    ) -> Box<Self> {
        let mut flags = ContinuationFlags::SYNC_WAITER;
        flags.set(ContinuationFlags::BARRIER, barrier);
        Self::alloc(flags, Work::SyncWaiter(handoff), priority)
    }

    /// Attaches a group the caller already entered.
    pub(crate) fn with_group(mut self: Box<Self>, group: Group) -> Box<Self> {
        self.flags |= ContinuationFlags::GROUP_LEAVE;
        self.group = Some(group);
        self
    }

    pub(crate) fn is_barrier(&self) -> bool {
        self.flags.contains(ContinuationFlags::BARRIER)
    }

    #[cfg(test)]
    pub(crate) fn flags(&self) -> ContinuationFlags {
        self.flags
    }

    pub(crate) fn priority(&self) -> Priority {
        self.priority
    }

    /// Runs the work and recycles the record.
    pub(crate) fn invoke(mut self: Box<Self>) {
        let work = mem::replace(&mut self.work, Work::Consumed);
        let voucher = self.voucher.take();
        let group = self.group.take();
        let flags = self.flags;
        cache::recycle(self);

        let _adopted = flags
            .contains(ContinuationFlags::ADOPT_VOUCHER)
            .then(|| voucher::adopt(voucher));

        match work {
            Work::Closure(closure) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(closure)) {
                    runtime::unhandled_panic(payload);
                }
            }
            Work::Drain(queue) => QueueInner::drain(queue),
            Work::Redirect { owner, inner } => {
                {
                    let _frame = context::enter_queue(&owner, false);
                    inner.invoke();
                }
                QueueInner::complete_redirect(&owner);
            }
            Work::SyncWaiter(handoff) => handoff.hand_over(),
            Work::Consumed => unreachable!("continuation invoked twice"),
        }

        if let Some(group) = group {
            debug_assert!(flags.contains(ContinuationFlags::GROUP_LEAVE));
            group.leave();
        }
    }
}

impl Drop for Continuation {
    // Only reached for work discarded before running: the queue was disposed
    // while suspended, or the runtime shut down.
    fn drop(&mut self) {
        if let Work::SyncWaiter(handoff) = &self.work {
            handoff.abandon();
        }
        if let Some(group) = self.group.take() {
            group.leave();
        }
    }
}
