use crate::context;
use crate::continuation::Closure;
use crate::error::WaitTimeout;
use crate::object::{DispatchObject, XRef};
use crate::queue::Queue;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// Value of a group nobody is in.
const IDLE: i64 = i64::MAX;

pub(crate) struct GroupInner {
    value: AtomicI64,

    /// Posted on their queue the next time the group becomes idle. Also the
    /// lock waiters sleep on.
    notify: Mutex<Vec<(Queue, Closure)>>,
    cond: Condvar,
}

impl GroupInner {
    fn is_idle(&self) -> bool {
        self.value.load(Ordering::Acquire) == IDLE
    }

    fn enter(&self) {
        let prev = self.value.fetch_sub(1, Ordering::Relaxed);
        if prev == i64::MIN {
            crash!("too many nested group enters");
        }
    }

    fn leave(&self) {
        let prev = self.value.fetch_add(1, Ordering::Release);
        if prev == IDLE {
            self.value.fetch_sub(1, Ordering::Relaxed);
            crash!("unbalanced group leave");
        }
        if prev + 1 == IDLE {
            self.wake_idle();
        }
    }

    fn wake_idle(&self) {
        let posted = {
            let mut notify = self.notify.lock();
            // Someone entered again in between, the matching leave will
            // deliver.
            if !self.is_idle() {
                return;
            }

            self.cond.notify_all();
            std::mem::take(&mut *notify)
        };

        for (queue, closure) in posted {
            queue.exec_async(closure);
        }
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<(), WaitTimeout> {
        if self.is_idle() {
            return Ok(());
        }

        let deadline = timeout.map(|t| Instant::now() + t);

        context::blocking(|| {
            let mut notify = self.notify.lock();
            while !self.is_idle() {
                match deadline {
                    None => self.cond.wait(&mut notify),
                    Some(at) => {
                        if self.cond.wait_until(&mut notify, at).timed_out() && !self.is_idle() {
                            return Err(WaitTimeout(timeout.unwrap_or_default()));
                        }
                    }
                }
            }
            Ok(())
        })
    }
}

impl DispatchObject for GroupInner {
    const KIND: &'static str = "group";

    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.value.load(Ordering::Relaxed);
        write!(f, "count = {}", IDLE - value)
    }
}

impl Drop for GroupInner {
    fn drop(&mut self) {
        let value = *self.value.get_mut();
        if value != IDLE && !std::thread::panicking() {
            crash!(
                "group deallocated with {} unbalanced enter(s)",
                IDLE - value
            );
        }
    }
}

/// Tracks a set of work items and lets callers wait for, or be notified of,
/// their completion.
#[derive(Clone)]
pub struct Group {
    inner: XRef<GroupInner>,
}

impl Group {
    pub fn new() -> Group {
        Group {
            inner: XRef::new(GroupInner {
                value: AtomicI64::new(IDLE),
                notify: Mutex::new(Vec::new()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Marks the start of a unit of work, to be matched by [`leave`](Self::leave).
    pub fn enter(&self) {
        self.inner.enter();
    }

    /// # Panics
    ///
    /// Panics when not matched by a previous [`enter`](Self::enter).
    pub fn leave(&self) {
        self.inner.leave();
    }

    /// Submits `f` on `queue` once every entered unit of work has left.
    /// Submits right away if none is pending.
    pub fn notify<F>(&self, queue: &Queue, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut notify = self.inner.notify.lock();
            if !self.inner.is_idle() {
                notify.push((queue.clone(), Box::new(f)));
                return;
            }
        }

        queue.exec_async(f);
    }

    /// Waits until every entered unit of work has left.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), WaitTimeout> {
        self.inner.wait(timeout)
    }
}

impl Default for Group {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}
