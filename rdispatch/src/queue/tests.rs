use super::*;
use crate::sync::Semaphore;
use crate::test_utils::{Recorder, TIMEOUT, queue_on, test_runtime, wait_for};
use static_assertions::assert_impl_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::time::Duration;

assert_impl_all!(Queue: Send, Sync, Clone);
assert_impl_all!(QueueBuilder: Send);

#[test]
fn test_serial_queue_is_fifo() -> anyhow::Result<()> {
    let rt = test_runtime(4);
    let queue = queue_on(&rt, "fifo", Width::Serial);
    let order = Recorder::new();
    let group = Group::new();

    for i in 0..500 {
        let order = order.clone();
        queue.group_async(&group, move || order.record(i));
    }

    group.wait(Some(TIMEOUT))?;
    assert_eq!(order.snapshot(), (0..500).collect::<Vec<_>>());
    Ok(())
}

#[rstest::rstest]
#[case::serial(Width::Serial, 1)]
#[case::bounded(Width::Bounded(3), 3)]
fn test_width_bounds_concurrency(#[case] width: Width, #[case] limit: usize) -> anyhow::Result<()> {
    let rt = test_runtime(8);
    let queue = queue_on(&rt, "width", width);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let group = Group::new();

    for _ in 0..64 {
        let (running, peak) = (running.clone(), peak.clone());
        queue.group_async(&group, move || {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_micros(300));
            running.fetch_sub(1, Ordering::SeqCst);
        });
    }

    group.wait(Some(TIMEOUT))?;
    assert!(peak.load(Ordering::SeqCst) <= limit);
    assert!(peak.load(Ordering::SeqCst) >= 1);
    Ok(())
}

#[test]
fn test_concurrent_counter() -> anyhow::Result<()> {
    let rt = test_runtime(4);
    let queue = queue_on(&rt, "counter", Width::Bounded(4));
    let count = Arc::new(AtomicUsize::new(0));
    let group = Group::new();

    for _ in 0..100 {
        let count = count.clone();
        queue.group_async(&group, move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
    }

    group.wait(Some(TIMEOUT))?;
    assert_eq!(count.load(Ordering::SeqCst), 100);
    Ok(())
}

#[test]
fn test_barrier_runs_alone() -> anyhow::Result<()> {
    let rt = test_runtime(4);
    let queue = queue_on(&rt, "barrier", Width::Concurrent);
    let running = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicBool::new(false));
    let before = Arc::new(AtomicUsize::new(0));
    let group = Group::new();

    for _ in 0..16 {
        let (running, before) = (running.clone(), before.clone());
        queue.group_async(&group, move || {
            running.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1));
            before.fetch_add(1, Ordering::SeqCst);
            running.fetch_sub(1, Ordering::SeqCst);
        });
    }

    group.enter();
    let (r, o, b, g) = (running.clone(), overlapped.clone(), before.clone(), group.clone());
    queue.barrier_async(move || {
        // Everything submitted earlier has finished.
        if r.load(Ordering::SeqCst) != 0 || b.load(Ordering::SeqCst) != 16 {
            o.store(true, Ordering::SeqCst);
        }
        std::thread::sleep(Duration::from_millis(2));
        if r.load(Ordering::SeqCst) != 0 {
            o.store(true, Ordering::SeqCst);
        }
        g.leave();
    });

    for _ in 0..16 {
        let running = running.clone();
        queue.group_async(&group, move || {
            running.fetch_add(1, Ordering::SeqCst);
            running.fetch_sub(1, Ordering::SeqCst);
        });
    }

    group.wait(Some(TIMEOUT))?;
    assert!(!overlapped.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn test_barrier_sync_returns_value() {
    let rt = test_runtime(2);
    let queue = queue_on(&rt, "barrier-sync", Width::Concurrent);
    let label = queue.barrier_sync(current_queue_label);
    assert_eq!(label.as_deref(), Some("barrier-sync"));
    assert!(!queue.is_current());
}

#[test]
fn test_suspend_holds_items() {
    let rt = test_runtime(2);
    let queue = queue_on(&rt, "suspend", Width::Serial);
    let seen = Recorder::new();

    queue.suspend();
    queue.suspend();
    let s = seen.clone();
    queue.exec_async(move || s.record(1));

    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(seen.len(), 0);

    queue.resume();
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(seen.len(), 0);

    queue.resume();
    assert!(wait_for(|| seen.len() == 1));
}

#[test]
fn test_inactive_queue_starts_on_activate() {
    let rt = test_runtime(2);
    let queue = Queue::builder("inactive")
        .target(&rt.root_queue(Priority::Default))
        .inactive()
        .build();
    let seen = Recorder::new();

    let s = seen.clone();
    queue.exec_async(move || s.record(()));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(seen.len(), 0);

    queue.activate();
    assert!(wait_for(|| seen.len() == 1));
}

#[test]
#[should_panic(expected = "over-resume")]
fn test_over_resume_is_fatal() {
    let rt = test_runtime(1);
    queue_on(&rt, "over-resume", Width::Serial).resume();
}

#[test]
#[should_panic(expected = "already owned by the current thread")]
fn test_sync_onto_own_serial_queue_is_fatal() {
    let rt = test_runtime(1);
    let queue = queue_on(&rt, "recursive", Width::Serial);
    let inner = queue.clone();
    queue.exec_sync(move || inner.exec_sync(|| ()));
}

#[rstest::rstest]
#[case::suspended(false)]
#[case::inactive(true)]
#[should_panic(expected = "with pending work")]
fn test_release_of_held_queue_with_work_is_fatal(#[case] inactive: bool) {
    let rt = test_runtime(1);
    let mut builder = Queue::builder("abandoned").target(&rt.root_queue(Priority::Default));
    if inactive {
        builder = builder.inactive();
    }
    let queue = builder.build();
    if !inactive {
        queue.suspend();
    }

    queue.exec_async(|| ());
    drop(queue);
}

#[test]
fn test_release_of_held_empty_queue_is_fine() {
    let rt = test_runtime(1);
    let queue = queue_on(&rt, "held-empty", Width::Serial);
    queue.suspend();
    drop(queue);
}

#[test]
fn test_target_chain_and_labels() {
    let rt = test_runtime(2);
    let outer = queue_on(&rt, "outer", Width::Serial);
    let inner = Queue::builder("inner").target(&outer).build();

    let (inner_current, outer_current, label) = inner.exec_sync(|| {
        (inner.is_current(), outer.is_current(), current_queue_label())
    });
    assert!(inner_current);
    assert!(outer_current);
    assert_eq!(label.as_deref(), Some("inner"));
}

#[test]
fn test_current_queue_handle() {
    let rt = test_runtime(2);
    let queue = queue_on(&rt, "current", Width::Serial);
    assert!(Queue::current().is_none());

    let current = queue.exec_sync(Queue::current).expect("running on a queue");
    assert_eq!(current.label(), "current");

    // Only internal references are left while the item runs.
    let seen = Recorder::new();
    let s = seen.clone();
    let gate = Semaphore::new(0);
    let g = gate.clone();
    let orphan = queue_on(&rt, "orphan", Width::Serial);
    orphan.exec_async(move || {
        g.wait(Some(TIMEOUT)).expect("never released");
        s.record(Queue::current().is_none());
    });
    drop((orphan, current, queue));
    gate.signal();

    assert!(wait_for(|| seen.len() == 1));
    assert_eq!(seen.snapshot(), vec![true]);
}

#[test]
#[should_panic(expected = "would create a cycle")]
fn test_target_cycle_is_fatal() {
    let rt = test_runtime(1);
    let a = queue_on(&rt, "a", Width::Serial);
    let b = Queue::builder("b").target(&a).build();
    a.set_target(&b);
}

#[test]
fn test_items_blocked_on_each_other_make_progress() -> anyhow::Result<()> {
    let rt = test_runtime(1);
    let queue = queue_on(&rt, "handoff", Width::Concurrent);
    let sema = Semaphore::new(0);
    let group = Group::new();

    for _ in 0..4 {
        let sema = sema.clone();
        queue.group_async(&group, move || {
            sema.wait(Some(TIMEOUT)).expect("never signaled");
        });
    }
    for _ in 0..4 {
        let sema = sema.clone();
        queue.group_async(&group, move || {
            sema.signal();
        });
    }

    group.wait(Some(TIMEOUT))?;
    Ok(())
}

#[test]
fn test_after_on_queue_with_group_notify() {
    let rt = test_runtime(2);
    let queue = queue_on(&rt, "notify", Width::Serial);
    let group = Group::new();
    let seen = Recorder::new();

    let s = seen.clone();
    queue.group_async(&group, move || s.record("work"));
    let s = seen.clone();
    group.notify(&queue, move || s.record("notified"));

    assert!(wait_for(|| seen.len() == 2));
    assert_eq!(seen.snapshot(), vec!["work", "notified"]);
}

#[test]
fn test_width_reservation_spans_the_chain() {
    let rt = test_runtime(2);
    let parent = queue_on(&rt, "reserve-parent", Width::Bounded(2));
    let child = Queue::builder("reserve-child")
        .width(Width::Bounded(3))
        .target(&parent)
        .build();
    let child_ref = child.inner().as_internal();

    let first = QueueInner::try_reserve_width(&child_ref, 5);
    assert_eq!(first.slots(), 2);
    assert_eq!(QueueInner::try_reserve_width(&child_ref, 1).slots(), 0);

    // Items of the full parent wait for the reservation to go away.
    let seen = Recorder::new();
    let s = seen.clone();
    parent.exec_async(move || s.record(()));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(seen.len(), 0);

    drop(first);
    assert!(wait_for(|| seen.len() == 1));
    assert!(wait_for(|| QueueInner::try_reserve_width(&child_ref, 5).slots() == 2));
}

#[test]
fn test_width_reservation_on_held_queue() {
    let rt = test_runtime(1);
    let queue = queue_on(&rt, "reserve-suspended", Width::Bounded(4));
    queue.suspend();
    assert_eq!(
        QueueInner::try_reserve_width(&queue.inner().as_internal(), 3).slots(),
        0
    );
    queue.resume();
    assert_eq!(
        QueueInner::try_reserve_width(&queue.inner().as_internal(), 3).slots(),
        3
    );
}
