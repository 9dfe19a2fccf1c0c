use crate::queue::{Priority, Queue, Width};
use crate::runtime::{Builder, Runtime, UnhandledPanic};
use crate::sync::{Group, Semaphore};
use crate::test_utils::{Recorder, TIMEOUT, queue_on, test_runtime, wait_for};
use static_assertions::assert_impl_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

assert_impl_all!(Runtime: Send, Sync);
assert_impl_all!(Builder: Send);

#[test]
fn test_root_queues() {
    let rt = test_runtime(2);

    for priority in Priority::ALL {
        let root = rt.root_queue(priority);
        assert_eq!(root.priority(), priority);
        assert_eq!(root.width(), Width::Concurrent);
    }

    assert_eq!(rt.root_queue(Priority::High).label(), "rdispatch.root.high");
}

#[test]
fn test_work_runs_on_private_runtime() -> anyhow::Result<()> {
    let rt = test_runtime(2);
    let root = rt.root_queue(Priority::Default);
    let group = Group::new();
    let count = Arc::new(AtomicUsize::new(0));

    for _ in 0..100 {
        let count = count.clone();
        root.group_async(&group, move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
    }

    group.wait(Some(TIMEOUT))?;
    assert_eq!(count.load(Ordering::SeqCst), 100);
    Ok(())
}

#[test]
fn test_blocked_worker_gets_overcommitted() -> anyhow::Result<()> {
    let rt = Builder::new().worker_threads(1).max_threads(4).try_build()?;
    let queue = queue_on(&rt, "overcommit", Width::Concurrent);
    let sema = Semaphore::new(0);
    let group = Group::new();

    // Occupies the only permanent worker until the second item runs.
    let s = sema.clone();
    queue.group_async(&group, move || {
        s.wait(Some(TIMEOUT)).expect("second item never ran");
    });

    let s = sema.clone();
    queue.group_async(&group, move || {
        s.signal();
    });

    group.wait(Some(TIMEOUT))?;
    Ok(())
}

#[test]
fn test_work_after_shutdown_is_dropped() {
    let rt = test_runtime(1);
    let queue = queue_on(&rt, "shutdown", Width::Serial);
    let seen = Recorder::new();

    let s = seen.clone();
    queue.exec_sync(move || s.record("before"));

    rt.shutdown();

    let s = seen.clone();
    queue.exec_async(move || s.record("after"));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(seen.snapshot(), vec!["before"]);
}

#[test]
fn test_panicking_item_is_ignored() {
    let rt = Builder::new()
        .worker_threads(1)
        .on_unhandled_panic(UnhandledPanic::Ignore)
        .try_build()
        .unwrap();
    let queue = queue_on(&rt, "panics", Width::Serial);
    let seen = Recorder::new();

    queue.exec_async(|| panic!("boom"));

    let s = seen.clone();
    queue.exec_async(move || s.record(()));
    assert!(wait_for(|| seen.len() == 1));
}

#[test]
fn test_global_runtime_runs_default_queues() {
    let queue = Queue::serial("global");
    assert_eq!(queue.exec_sync(|| 21 * 2), 42);

    // Started once.
    assert!(std::ptr::eq(Runtime::global(), Runtime::global()));
}

#[test]
fn test_runtime_drop_joins_workers() {
    let rt = test_runtime(3);
    let queue = queue_on(&rt, "drop", Width::Concurrent);
    let count = Arc::new(AtomicUsize::new(0));

    for _ in 0..10 {
        let count = count.clone();
        queue.exec_sync(move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
    }

    drop(rt);
    assert_eq!(count.load(Ordering::SeqCst), 10);
}
