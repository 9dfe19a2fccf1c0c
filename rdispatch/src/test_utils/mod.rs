use crate::queue::{Priority, Queue, Width};
use crate::runtime::{Builder, Runtime};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound for anything a test waits on.
pub(crate) const TIMEOUT: Duration = Duration::from_secs(5);

#[must_use]
pub(crate) fn test_runtime(workers: usize) -> Runtime {
    match Builder::new()
        .worker_threads(workers)
        .thread_name("rdispatch-test")
        .try_build()
    {
        Ok(rt) => rt,
        Err(e) => panic!("failed to build test runtime: {:#}", e),
    }
}

/// Queue of `width` on the default root queue of `rt`.
pub(crate) fn queue_on(rt: &Runtime, label: &str, width: Width) -> Queue {
    Queue::builder(label)
        .width(width)
        .target(&rt.root_queue(Priority::Default))
        .build()
}

/// Polls `cond` until it holds or [`TIMEOUT`] elapsed.
pub(crate) fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Collects values from whichever thread produced them.
#[derive(Debug)]
pub(crate) struct Recorder<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
        }
    }
}

impl<T: Clone> Recorder<T> {
    pub(crate) fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn record(&self, item: T) {
        self.items.lock().push(item);
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub(crate) fn snapshot(&self) -> Vec<T> {
        self.items.lock().clone()
    }
}
