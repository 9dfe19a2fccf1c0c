//! Per-thread runtime state: the stack of queues the thread is currently
//! executing on, the pool it belongs to (if it is a worker) and the current
//! `apply` nesting level.

use crate::object::ObjRef;
use crate::queue::QueueInner;
use crate::runtime::pool::{BlockingGuard, Pool};
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::sync::Arc;

struct Frame {
    queue: ObjRef<QueueInner>,
    exclusive: bool,
}

struct Context {
    /// Innermost frame last.
    frames: RefCell<SmallVec<[Frame; 8]>>,

    /// Set on worker threads only.
    pool: RefCell<Option<Arc<Pool>>>,

    /// Product of the fan-out of every enclosing `apply`.
    apply_nesting: Cell<usize>,
}

thread_local! {
    static CONTEXT: Context = const {
        Context {
            frames: RefCell::new(SmallVec::new_const()),
            pool: RefCell::new(None),
            apply_nesting: Cell::new(1),
        }
    };
}

/// Pops the frame pushed by [`enter_queue`].
#[must_use]
pub(crate) struct FrameGuard {
    addr: usize,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        // Do not touch the thread-local while it is being torn down.
        let _ = CONTEXT.try_with(|ctx| {
            let frame = ctx.frames.borrow_mut().pop();
            debug_assert!(
                frame.is_some_and(|f| f.queue.addr() == self.addr),
                "unbalanced queue frames"
            );
        });
    }
}

/// Records that the current thread is executing work on behalf of `queue`.
/// `exclusive` is set when nothing else may run on it concurrently.
pub(crate) fn enter_queue(queue: &ObjRef<QueueInner>, exclusive: bool) -> FrameGuard {
    CONTEXT.with(|ctx| {
        ctx.frames.borrow_mut().push(Frame {
            queue: queue.clone(),
            exclusive,
        })
    });

    FrameGuard { addr: queue.addr() }
}

/// Is the current thread holding `queue` exclusively?
pub(crate) fn holds_exclusively(queue: &ObjRef<QueueInner>) -> bool {
    CONTEXT.with(|ctx| {
        ctx.frames
            .borrow()
            .iter()
            .any(|f| f.exclusive && f.queue.ptr_eq(queue))
    })
}

/// Is the current thread executing on `queue`, directly or through one of
/// the queues targeting it?
pub(crate) fn is_on_queue(queue: &ObjRef<QueueInner>) -> bool {
    CONTEXT.with(|ctx| {
        ctx.frames
            .borrow()
            .iter()
            .any(|f| QueueInner::any_in_chain(&f.queue, |q| q.ptr_eq(queue)))
    })
}

pub(crate) fn current_queue() -> Option<ObjRef<QueueInner>> {
    CONTEXT.with(|ctx| ctx.frames.borrow().last().map(|f| f.queue.clone()))
}

pub(crate) fn set_worker(pool: Arc<Pool>) {
    CONTEXT.with(|ctx| ctx.pool.replace(Some(pool)));
}

pub(crate) fn clear_worker() {
    let _ = CONTEXT.try_with(|ctx| ctx.pool.take());
}

pub(crate) fn with_worker_pool<R>(f: impl FnOnce(Option<&Arc<Pool>>) -> R) -> R {
    CONTEXT.with(|ctx| f(ctx.pool.borrow().as_ref()))
}

/// Runs a blocking wait. On worker threads the pool is told so it can keep
/// enough runnable threads around.
pub(crate) fn blocking<R>(f: impl FnOnce() -> R) -> R {
    let _guard: Option<BlockingGuard> = with_worker_pool(|pool| pool.map(Pool::enter_blocking));
    f()
}

pub(crate) fn apply_nesting() -> usize {
    CONTEXT.with(|ctx| ctx.apply_nesting.get())
}

/// Multiplies the nesting factor by `width` until the guard drops.
pub(crate) fn nest_apply(width: usize) -> ApplyNestingGuard {
    let prev = CONTEXT.with(|ctx| {
        let prev = ctx.apply_nesting.get();
        ctx.apply_nesting.set(prev.saturating_mul(width.max(1)));
        prev
    });

    ApplyNestingGuard { prev }
}

#[must_use]
pub(crate) struct ApplyNestingGuard {
    prev: usize,
}

impl Drop for ApplyNestingGuard {
    fn drop(&mut self) {
        let _ = CONTEXT.try_with(|ctx| ctx.apply_nesting.set(self.prev));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_nesting_restores() {
        assert_eq!(apply_nesting(), 1);
        {
            let _outer = nest_apply(4);
            assert_eq!(apply_nesting(), 4);
            {
                let _inner = nest_apply(2);
                assert_eq!(apply_nesting(), 8);
            }
            assert_eq!(apply_nesting(), 4);
        }
        assert_eq!(apply_nesting(), 1);
    }

    #[test]
    fn test_blocking_off_worker_is_plain_call() {
        assert!(with_worker_pool(|p| p.is_none()));
        assert_eq!(blocking(|| 7), 7);
    }
}
