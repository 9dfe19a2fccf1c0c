use crate::context;
use std::cell::Cell;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering, fence};
use std::thread::{self, Thread};

// The state word holds one of these in its low bits. While RUNNING, the
// remaining bits point at the most recently enqueued waiter.
const INCOMPLETE: usize = 0;
const RUNNING: usize = 1;
const DONE: usize = 2;
const STATE_MASK: usize = 3;

// Lives on the waiting thread's stack. Aligned so the low bits of its
// address are free for the state.
#[repr(align(4))]
struct Waiter {
    thread: Cell<Option<Thread>>,
    signaled: AtomicBool,
    next: Cell<*const Waiter>,
}

/// Runs a closure exactly once, no matter how many threads race on it.
///
/// Callers that lose the race block until the winner's closure returned, and
/// then observe all of its side effects. If the closure panics, the `Once`
/// goes back to its initial state and one of the blocked callers runs its
/// own closure.
pub struct Once {
    state: AtomicUsize,
}

impl Once {
    pub const fn new() -> Once {
        Once {
            state: AtomicUsize::new(INCOMPLETE),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }

    pub fn call<F: FnOnce()>(&self, f: F) {
        if self.is_completed() {
            return;
        }
        self.call_slow(f);
    }

    #[cold]
    fn call_slow<F: FnOnce()>(&self, f: F) {
        let mut f = Some(f);
        let mut state = self.state.load(Ordering::Acquire);

        loop {
            match state & STATE_MASK {
                DONE => return,
                INCOMPLETE => {
                    if let Err(actual) = self.state.compare_exchange(
                        state,
                        RUNNING,
                        Ordering::Acquire,
                        Ordering::Acquire,
                    ) {
                        state = actual;
                        continue;
                    }

                    let mut completer = Completer {
                        state: &self.state,
                        set_on_drop: INCOMPLETE,
                    };

                    if let Some(f) = f.take() {
                        f();
                    }

                    completer.set_on_drop = DONE;
                    return;
                }
                _ => {
                    self.wait(state);
                    state = self.state.load(Ordering::Acquire);
                }
            }
        }
    }

    fn wait(&self, mut current: usize) {
        let node = Waiter {
            thread: Cell::new(Some(thread::current())),
            signaled: AtomicBool::new(false),
            next: Cell::new(ptr::null()),
        };
        let me = &node as *const Waiter as usize;
        debug_assert_eq!(me & STATE_MASK, 0);

        loop {
            if current & STATE_MASK != RUNNING {
                return;
            }

            // Not shared until the exchange below succeeds.
            node.next.set((current & !STATE_MASK) as *const Waiter);

            match self.state.compare_exchange(
                current,
                me | RUNNING,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        context::blocking(|| {
            while !node.signaled.load(Ordering::Acquire) {
                thread::park();
            }
        });
    }
}

impl Default for Once {
    fn default() -> Self {
        Once::new()
    }
}

impl fmt::Debug for Once {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Once")
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Publishes the outcome and wakes waiters, including when the closure
/// unwinds.
struct Completer<'a> {
    state: &'a AtomicUsize,
    set_on_drop: usize,
}

impl Drop for Completer<'_> {
    fn drop(&mut self) {
        // Every write of the closure must be visible before DONE is.
        fence(Ordering::SeqCst);
        let queue = self.state.swap(self.set_on_drop, Ordering::AcqRel);
        debug_assert_eq!(queue & STATE_MASK, RUNNING);

        let mut waiter = (queue & !STATE_MASK) as *const Waiter;
        while !waiter.is_null() {
            // Safety: a waiter does not return before `signaled` is set, so
            // its node is alive until the store below. Read everything we
            // need first.
            unsafe {
                let next = (*waiter).next.get();
                let thread = (*waiter).thread.take();
                (*waiter).signaled.store(true, Ordering::Release);
                if let Some(thread) = thread {
                    thread.unpark();
                }
                waiter = next;
            }
        }
    }
}
