use crate::context;
use crate::continuation::{Continuation, ContinuationFlags};
use crate::queue::{Queue, QueueInner, WIDTH_UNBOUNDED, WidthReservation};
use crate::sync::Semaphore;
use crate::utils::sys::active_cpu_count;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Shared by the caller and its helpers. Lives on the caller's stack, which
/// does not return before every helper signaled `done`.
struct ApplyState<'a> {
    body: &'a (dyn Fn(usize) + Sync),
    iterations: usize,
    next: AtomicUsize,
    /// Fan-out of this apply, times that of the enclosing ones.
    nesting: usize,
    workers: usize,
    panic: Mutex<Option<Box<dyn Any + Send>>>,
}

impl ApplyState<'_> {
    /// `fan_out` multiplies the nesting level of the running thread.
    fn run(&self, fan_out: usize) {
        let _nesting = context::nest_apply(fan_out);

        loop {
            let i = self.next.fetch_add(1, Ordering::Relaxed);
            if i >= self.iterations {
                return;
            }

            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| (self.body)(i))) {
                // Stop handing out indices, keep the first panic.
                self.next.store(self.iterations, Ordering::Relaxed);
                self.panic.lock().get_or_insert(payload);
                return;
            }
        }
    }
}

struct StatePtr(*const ());

// Safety: the state is Sync and outlives every helper holding the pointer.
unsafe impl Send for StatePtr {}

/// Calls `body` once for every index in `0..iterations`, in parallel on
/// `queue`, and returns once all calls returned. The calling thread runs
/// iterations too.
///
/// On a serial queue, or one targeting a serial queue, iterations run in
/// order on the calling thread. On a queue of limited width the calling
/// thread takes one of its slots and helpers take whatever else is free,
/// without waiting for more. A panic in `body` is raised again here once
/// every helper stopped.
///
/// ```no_run
/// use rdispatch::{Queue, apply};
/// use std::sync::atomic::{AtomicU64, Ordering};
///
/// let sum = AtomicU64::new(0);
/// apply(100, &Queue::concurrent("com.example.sum"), |i| {
///     sum.fetch_add(i as u64, Ordering::Relaxed);
/// });
/// assert_eq!(sum.into_inner(), 4950);
/// ```
pub fn apply<F>(iterations: usize, queue: &Queue, body: F)
where
    F: Fn(usize) + Sync,
{
    if iterations == 0 {
        return;
    }
    apply_on(iterations, queue, &body);
}

fn apply_on(iterations: usize, queue: &Queue, body: &(dyn Fn(usize) + Sync)) {
    let this = queue.inner().as_internal();
    let on_queue = context::is_on_queue(&this);
    let width = QueueInner::chain_width(&this);

    if width == 1 {
        if on_queue {
            // Already exclusive.
            (0..iterations).for_each(body);
        } else {
            queue.barrier_sync(|| (0..iterations).for_each(body));
        }
        return;
    }

    if width != WIDTH_UNBOUNDED && !on_queue {
        // Helpers only ever take free slots, the caller waits for its own.
        queue.exec_sync(|| apply_on(iterations, queue, body));
        return;
    }

    // Nested applies share the CPUs of the outer one.
    let threads = (active_cpu_count() / context::apply_nesting()).max(1);
    let wanted = iterations.min(threads) - 1;

    // Unbounded chains take helpers as regular items. Anything narrower
    // would make helpers of nested applies wait for slots held by their
    // parents, so they go to the root on reserved slots.
    let reservation = (width != WIDTH_UNBOUNDED)
        .then(|| QueueInner::try_reserve_width(&this, wanted as u32));
    let helpers = reservation
        .as_ref()
        .map_or(wanted, |r: &WidthReservation| r.slots() as usize);
    let workers = helpers + 1;

    let state = ApplyState {
        body,
        iterations,
        next: AtomicUsize::new(0),
        nesting: context::apply_nesting().saturating_mul(workers),
        workers,
        panic: Mutex::new(None),
    };

    let done = Semaphore::new(0);

    tracing::trace!(iterations, helpers, queue = queue.label(), "apply");

    for _ in 0..helpers {
        let ptr = StatePtr(&state as *const ApplyState<'_> as *const ());
        let done = done.clone();
        let owner = this.clone();
        let on_root = reservation.is_some();

        let helper = move || {
            let ptr = ptr;
            // Safety: the caller waits for `done` before the state goes away.
            let state = unsafe { &*(ptr.0 as *const ApplyState<'static>) };
            {
                // Root helpers run on behalf of the queue.
                let _frame = on_root.then(|| context::enter_queue(&owner, false));
                // Helpers start from the top of a worker.
                state.run(state.nesting);
            }
            done.signal();
        };

        if on_root {
            let cont =
                Continuation::closure(Box::new(helper), ContinuationFlags::ASYNC, queue.priority());
            QueueInner::enqueue_on_root(&this, cont);
        } else {
            queue.exec_async(helper);
        }
    }

    state.run(state.workers);

    for _ in 0..helpers {
        if let Err(e) = done.wait(None) {
            unreachable!("apply wait without timeout returned: {}", e);
        }
    }
    drop(reservation);

    if let Some(payload) = state.panic.lock().take() {
        panic::resume_unwind(payload);
    }
}
