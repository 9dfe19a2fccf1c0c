use crate::continuation::Continuation;
use crate::queue::Priority;
use crate::runtime::RuntimeConfig;
use crate::runtime::worker::Worker;
use crate::utils::retry_with_backoff;
use anyhow::{Result, anyhow};
use crossbeam_deque::Injector;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::io;
use std::iter;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Parked {
    thread: Thread,
    should_unpark: Arc<AtomicBool>,
}

/// Threads draining the root queues of one runtime.
///
/// Each priority has its own injector. Workers take from the highest
/// non-empty one, except every `fairness_interval` ticks where they start
/// from the lowest. When workers block while work is pending, overcommit
/// workers are started so that `worker_threads` of them stay runnable.
#[derive(Debug)]
pub(crate) struct Pool {
    pub(crate) cfg: RuntimeConfig,

    /// Indexed by `Priority::index`.
    injectors: [Injector<Box<Continuation>>; 4],

    shutdown: AtomicBool,

    /// LIFO collection of parked threads. We unpark thread in LIFO order as the
    /// latest parked thread is the one where CPU cache will be the hotest.
    parked_threads: RwLock<VecDeque<Parked>>,

    /// Live worker threads, overcommit included. Incremented before a thread
    /// is spawned so concurrent spawners cannot exceed `max_threads`.
    total: AtomicUsize,

    /// Workers inside a blocking wait.
    blocked: AtomicUsize,

    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    pub(crate) fn new(cfg: &RuntimeConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg: cfg.clone(),
            injectors: std::array::from_fn(|_| Injector::new()),
            shutdown: AtomicBool::new(false),
            parked_threads: RwLock::new(VecDeque::with_capacity(cfg.max_threads)),
            total: AtomicUsize::new(0),
            blocked: AtomicUsize::new(0),
            handles: Mutex::new(Vec::with_capacity(cfg.worker_threads)),
        })
    }

    /// Starts the `worker_threads` permanent workers.
    pub(crate) fn spawn_workers(self: &Arc<Self>) -> Result<()> {
        for _ in 0..self.cfg.worker_threads {
            self.total.fetch_add(1, Ordering::AcqRel);
            if let Err(e) = self.spawn_worker(false) {
                self.total.fetch_sub(1, Ordering::AcqRel);
                return Err(anyhow!("failed to spawn worker thread: {}", e));
            }
        }

        tracing::debug!(workers = self.cfg.worker_threads, "thread pool started");
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>, overcommit: bool) -> io::Result<()> {
        let handle = retry_with_backoff("spawn worker thread", || {
            let mut builder = thread::Builder::new().name(self.cfg.thread_name.0());

            if let Some(stack_size) = self.cfg.thread_stack_size {
                builder = builder.stack_size(stack_size);
            }

            let pool = Arc::clone(self);
            builder.spawn(move || Worker::new(pool, overcommit).run())
        })?;

        let mut handles = self.handles.lock();
        // Overcommit workers come and go, forget the ones that are gone.
        handles.retain(|h| !h.is_finished());
        handles.push(handle);

        Ok(())
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn push(self: &Arc<Self>, priority: Priority, task: Box<Continuation>) {
        if self.is_shutdown() {
            tracing::debug!(?priority, "runtime shut down, dropping work item");
            drop(task);
            return;
        }

        self.injectors[priority.index()].push(task);

        if !self.unpark_one_thread() {
            self.maybe_spawn_overcommit();
        }
    }

    fn has_pending(&self) -> bool {
        self.injectors.iter().any(|i| !i.is_empty())
    }

    /// Takes the next item, highest priority first unless `lowest_first`.
    pub(crate) fn find_task(&self, lowest_first: bool) -> Option<Box<Continuation>> {
        let steal = |p: &Priority| {
            let injector = &self.injectors[p.index()];
            iter::repeat_with(|| injector.steal())
                .find(|s| !s.is_retry())
                .and_then(|s| s.success())
        };

        if lowest_first {
            Priority::ALL.iter().find_map(steal)
        } else {
            Priority::ALL.iter().rev().find_map(steal)
        }
    }

    /// Accounts for a worker about to block. Wakes or starts another worker
    /// if work would otherwise wait.
    pub(crate) fn enter_blocking(self: &Arc<Self>) -> BlockingGuard {
        self.blocked.fetch_add(1, Ordering::AcqRel);

        if self.has_pending() && !self.unpark_one_thread() {
            self.maybe_spawn_overcommit();
        }

        BlockingGuard {
            pool: Arc::clone(self),
        }
    }

    fn maybe_spawn_overcommit(self: &Arc<Self>) {
        if self.is_shutdown() {
            return;
        }

        let blocked = self.blocked.load(Ordering::Acquire);
        let reserved = self
            .total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                let runnable = total.saturating_sub(blocked);
                (total < self.cfg.max_threads && runnable < self.cfg.worker_threads)
                    .then_some(total + 1)
            });

        let Ok(prev) = reserved else {
            return;
        };

        tracing::debug!(threads = prev + 1, blocked, "starting overcommit worker");

        if let Err(e) = self.spawn_worker(true) {
            self.total.fetch_sub(1, Ordering::AcqRel);
            warn_once!(error = %e, "failed to start overcommit worker");
        }
    }

    pub(super) fn worker_exited(&self) {
        self.total.fetch_sub(1, Ordering::AcqRel);
    }

    /// Parks the current worker until new work is pushed or the runtime
    /// shuts down. With a `timeout`, returns false if it elapsed without the
    /// thread being unparked.
    pub(super) fn park_current_thread(
        &self,
        should_unpark: &Arc<AtomicBool>,
        timeout: Option<Duration>,
    ) -> bool {
        {
            let mut parked_threads = self.parked_threads.write();

            // We need to check these signals *while holding the lock* to avoid race
            // conditions. These are used right before we call unpark.
            if self.has_pending() || self.is_shutdown() {
                return true;
            }

            should_unpark.store(false, Ordering::Release);
            parked_threads.push_back(Parked {
                thread: thread::current(),
                should_unpark: Arc::clone(should_unpark),
            });
        }

        let deadline = timeout.map(|t| Instant::now() + t);

        // Loop to account for spurious wakeups.
        while !should_unpark.load(Ordering::Acquire) {
            let Some(deadline) = deadline else {
                thread::park();
                continue;
            };

            let now = Instant::now();
            if now < deadline {
                thread::park_timeout(deadline - now);
                continue;
            }

            let mut parked_threads = self.parked_threads.write();
            // Lost the race against an unparker, which already popped us.
            if should_unpark.load(Ordering::Acquire) {
                return true;
            }
            parked_threads.retain(|p| !Arc::ptr_eq(&p.should_unpark, should_unpark));
            return false;
        }

        true
    }

    pub(crate) fn unpark_one_thread(&self) -> bool {
        if let Some(parked) = self.parked_threads.write().pop_back() {
            parked.should_unpark.store(true, Ordering::Release);
            parked.thread.unpark();
            true
        } else {
            false
        }
    }

    pub(crate) fn unpark_all_threads(&self) -> usize {
        let mut num_unparked = 0;
        let mut parked_threads = self.parked_threads.write();

        while let Some(parked) = parked_threads.pop_back() {
            num_unparked += 1;
            parked.should_unpark.store(true, Ordering::Release);
            parked.thread.unpark();
        }

        num_unparked
    }

    /// Stops every worker, then drops the work that never ran.
    pub(crate) fn shutdown(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.unpark_all_threads();
        let res = self.join_all();

        let mut dropped = 0;
        for injector in &self.injectors {
            while let Some(task) = iter::repeat_with(|| injector.steal())
                .find(|s| !s.is_retry())
                .and_then(|s| s.success())
            {
                drop(task);
                dropped += 1;
            }
        }

        tracing::debug!(dropped, "thread pool shut down");
        res
    }

    fn join_all(&self) -> Result<()> {
        let current = thread::current().id();
        let handles = std::mem::take(&mut *self.handles.lock());

        // A worker shutting down its own runtime cannot join itself. It exits
        // on its next tick.
        let errors = handles
            .into_iter()
            .filter(|h| h.thread().id() != current)
            .filter_map(|h| h.join().err())
            .count();

        if errors == 0 {
            Ok(())
        } else {
            Err(anyhow!("{} thread(s) panicked", errors))
        }
    }
}

/// Held by a worker while it blocks.
#[must_use]
pub(crate) struct BlockingGuard {
    pool: Arc<Pool>,
}

impl Drop for BlockingGuard {
    fn drop(&mut self) {
        self.pool.blocked.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::ContinuationFlags;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::AtomicUsize;

    assert_impl_all!(Pool: Send, Sync);

    fn tagged(priority: Priority, seen: &Arc<Mutex<Vec<Priority>>>) -> Box<Continuation> {
        let seen = Arc::clone(seen);
        Continuation::closure(
            Box::new(move || seen.lock().push(priority)),
            ContinuationFlags::ASYNC,
            priority,
        )
    }

    // No workers are spawned, items are injected directly.
    fn idle_pool() -> Arc<Pool> {
        Pool::new(&RuntimeConfig::default())
    }

    #[test]
    fn test_find_task_highest_priority_first() {
        let pool = idle_pool();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for p in Priority::ALL {
            pool.injectors[p.index()].push(tagged(p, &seen));
        }

        while let Some(task) = pool.find_task(false) {
            task.invoke();
        }

        let mut expected = Priority::ALL.to_vec();
        expected.reverse();
        assert_eq!(*seen.lock(), expected);
    }

    #[test]
    fn test_find_task_lowest_first() {
        let pool = idle_pool();
        let seen = Arc::new(Mutex::new(Vec::new()));

        pool.injectors[Priority::High.index()].push(tagged(Priority::High, &seen));
        pool.injectors[Priority::Background.index()].push(tagged(Priority::Background, &seen));

        pool.find_task(true).unwrap().invoke();
        assert_eq!(*seen.lock(), vec![Priority::Background]);
    }

    #[test]
    fn test_park_returns_right_away_with_pending_work() {
        let pool = idle_pool();
        let seen = Arc::new(Mutex::new(Vec::new()));
        pool.injectors[0].push(tagged(Priority::Background, &seen));

        let flag = Arc::new(AtomicBool::new(false));
        assert!(pool.park_current_thread(&flag, None));
        assert!(pool.parked_threads.read().is_empty());
    }

    #[test]
    fn test_park_timeout_withdraws() {
        let pool = idle_pool();
        let flag = Arc::new(AtomicBool::new(false));

        assert!(!pool.park_current_thread(&flag, Some(Duration::from_millis(5))));
        assert!(pool.parked_threads.read().is_empty());
        assert!(!pool.unpark_one_thread());
    }

    #[test]
    fn test_unpark_wakes_parked_thread() {
        let pool = idle_pool();
        let woken = Arc::new(AtomicUsize::new(0));

        let parker = {
            let pool = Arc::clone(&pool);
            let woken = Arc::clone(&woken);
            thread::spawn(move || {
                let flag = Arc::new(AtomicBool::new(false));
                assert!(pool.park_current_thread(&flag, None));
                woken.fetch_add(1, Ordering::SeqCst);
            })
        };

        while pool.parked_threads.read().is_empty() {
            thread::yield_now();
        }

        assert_eq!(pool.unpark_all_threads(), 1);
        parker.join().unwrap();
        assert_eq!(woken.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_push_after_shutdown_drops_work() -> Result<()> {
        let pool = idle_pool();
        pool.shutdown()?;

        let seen = Arc::new(Mutex::new(Vec::new()));
        pool.push(Priority::Default, tagged(Priority::Default, &seen));

        assert!(pool.find_task(false).is_none());
        assert!(seen.lock().is_empty());
        Ok(())
    }
}
