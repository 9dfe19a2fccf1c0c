use crate::context;
use crate::error::WaitTimeout;
use crate::object::{DispatchObject, XRef};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

pub(crate) struct SemaphoreInner {
    /// Negative: number of threads blocked in `wait`.
    value: AtomicI64,
    orig: i64,

    /// Signals posted to blocked waiters and not consumed yet. Condvar wakeups
    /// without a matching post are spurious and go back to sleep.
    sent: Mutex<u64>,
    cond: Condvar,
}

impl SemaphoreInner {
    fn signal(&self) -> bool {
        let prev = self.value.fetch_add(1, Ordering::Release);
        if prev == i64::MAX {
            crash!("semaphore value overflow");
        }
        if prev >= 0 {
            return false;
        }

        let mut sent = self.sent.lock();
        *sent += 1;
        self.cond.notify_one();
        true
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<(), WaitTimeout> {
        let prev = self.value.fetch_sub(1, Ordering::Acquire);
        if prev > 0 {
            return Ok(());
        }
        if prev == i64::MIN {
            crash!("semaphore value underflow");
        }

        context::blocking(|| self.wait_slow(timeout))
    }

    fn wait_slow(&self, timeout: Option<Duration>) -> Result<(), WaitTimeout> {
        let mut deadline = timeout.map(|t| Instant::now() + t);
        let mut sent = self.sent.lock();

        loop {
            if *sent > 0 {
                *sent -= 1;
                return Ok(());
            }

            let Some(at) = deadline else {
                self.cond.wait(&mut sent);
                continue;
            };

            if !self.cond.wait_until(&mut sent, at).timed_out() {
                continue;
            }
            if *sent > 0 {
                continue;
            }

            // Give our decrement back, unless a signaler already counted us
            // as a waiter. Its post is then on the way and must be consumed.
            let mut cur = self.value.load(Ordering::Relaxed);
            while cur < 0 {
                match self.value.compare_exchange_weak(
                    cur,
                    cur + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Err(WaitTimeout(timeout.unwrap_or_default())),
                    Err(actual) => cur = actual,
                }
            }

            deadline = None;
        }
    }
}

impl DispatchObject for SemaphoreInner {
    const KIND: &'static str = "semaphore";

    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "value = {}, orig = {}",
            self.value.load(Ordering::Relaxed),
            self.orig
        )
    }
}

impl Drop for SemaphoreInner {
    fn drop(&mut self) {
        let value = *self.value.get_mut();
        if value < self.orig && !std::thread::panicking() {
            crash!(
                "semaphore object deallocated while in use: value {} < original {}",
                value,
                self.orig
            );
        }
    }
}

/// Counting semaphore.
///
/// `wait` decrements and blocks while the count is negative, `signal`
/// increments and wakes one blocked waiter. Uncontended operations do not
/// touch the kernel.
///
/// # Panics
///
/// Dropping the last handle while the count is below its initial value is a
/// fatal error: some thread still expects a signal.
#[derive(Clone)]
pub struct Semaphore {
    inner: XRef<SemaphoreInner>,
}

impl Semaphore {
    #[track_caller]
    pub fn new(value: i64) -> Semaphore {
        assert!(value >= 0, "semaphore initial value must not be negative");

        Semaphore {
            inner: XRef::new(SemaphoreInner {
                value: AtomicI64::new(value),
                orig: value,
                sent: Mutex::new(0),
                cond: Condvar::new(),
            }),
        }
    }

    /// Returns true if a blocked waiter was woken.
    pub fn signal(&self) -> bool {
        self.inner.signal()
    }

    /// Waits for a signal, forever when `timeout` is `None`.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), WaitTimeout> {
        self.inner.wait(timeout)
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}
