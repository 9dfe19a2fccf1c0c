use super::QueueInner;
use crate::context;
use crate::continuation::Continuation;
use crate::object::XRef;
use crate::sync::event::ThreadEvent;
use crate::utils::ScopeGuard;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Rendezvous between a thread blocked in a sync call and the thread that
/// reached the sync item while draining the queue. The drainer keeps the
/// queue (or the width slot) until the caller is done.
#[derive(Debug, Default)]
pub(crate) struct SyncHandoff {
    started: ThreadEvent,
    finished: ThreadEvent,
    abandoned: AtomicBool,
}

impl SyncHandoff {
    /// Drainer side.
    pub(crate) fn hand_over(&self) {
        self.started.signal();
        context::blocking(|| self.finished.wait());
    }

    /// The item was discarded without reaching a drainer.
    pub(crate) fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
        self.started.signal();
    }
}

#[track_caller]
pub(super) fn run_sync<F, R>(queue: &XRef<QueueInner>, barrier: bool, f: F) -> R
where
    F: FnOnce() -> R,
{
    let this = queue.as_internal();

    // Root queues have no drain lock and unbounded width.
    if this.is_root() {
        let _frame = context::enter_queue(&this, false);
        return f();
    }

    if QueueInner::any_in_chain(&this, context::holds_exclusively) {
        crash!(
            "sync on queue {} already owned by the current thread",
            this.label
        );
    }
    if barrier && context::is_on_queue(&this) {
        crash!(
            "barrier sync on queue {} from one of its own items",
            this.label
        );
    }

    let exclusive = barrier || this.width == 1;

    if this.target_is_root() {
        if exclusive && QueueInner::try_lock_exclusive(&this) {
            let _unlock = ScopeGuard::new(|| QueueInner::unlock_exclusive(&this));
            let _frame = context::enter_queue(&this, true);
            return f();
        }

        if !exclusive && QueueInner::try_reserve_slot(&this) {
            let _release = ScopeGuard::new(|| QueueInner::complete_redirect(&this));
            let _frame = context::enter_queue(&this, false);
            return f();
        }
    }

    let handoff = Arc::new(SyncHandoff::default());
    QueueInner::enqueue(
        &this,
        Continuation::sync_waiter(handoff.clone(), barrier, this.priority),
    );

    context::blocking(|| handoff.started.wait());
    if handoff.abandoned.load(Ordering::Acquire) {
        crash!("queue {} was torn down with a pending sync", this.label);
    }

    let _finished = ScopeGuard::new(|| handoff.finished.signal());
    let _frame = context::enter_queue(&this, exclusive);
    f()
}
