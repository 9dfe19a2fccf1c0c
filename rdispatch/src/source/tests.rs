use super::*;
use crate::queue::Width;
use crate::test_utils::{Recorder, queue_on, test_runtime, wait_for};
use nix::sys::signal::{Signal, raise};
use static_assertions::assert_impl_all;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::time::Instant;

assert_impl_all!(Source: Send, Sync, Clone);

#[test]
fn test_invalid_sources_are_rejected() {
    let rt = test_runtime(1);
    let queue = queue_on(&rt, "reject", Width::Serial);

    assert!(matches!(
        Source::new(SourceType::Signal, 0, 0, &queue),
        Err(SourceError::InvalidHandle { .. })
    ));
    assert!(matches!(
        Source::new(SourceType::DataAdd, 0, 1, &queue),
        Err(SourceError::InvalidMask { .. })
    ));

    let timer = Source::new(SourceType::Timer, 0, 0, &queue).unwrap();
    assert!(matches!(
        timer.merge_data(1),
        Err(SourceError::Unsupported { .. })
    ));

    let custom = Source::new(SourceType::DataOr, 0, 0, &queue).unwrap();
    assert!(matches!(
        custom.set_timer(DispatchTime::Now, None, Duration::ZERO),
        Err(SourceError::Unsupported { .. })
    ));
}

#[rstest::rstest]
#[case::add(SourceType::DataAdd, &[1, 2, 3], 6)]
#[case::or(SourceType::DataOr, &[1, 2, 4, 1], 7)]
#[case::replace(SourceType::DataReplace, &[5, 9], 9)]
fn test_custom_data_coalesces(
    #[case] kind: SourceType,
    #[case] merges: &[u64],
    #[case] expected: u64,
) {
    let rt = test_runtime(2);
    let queue = queue_on(&rt, "coalesce", Width::Serial);
    let seen = Recorder::new();

    let source = Source::new(kind, 0, 0, &queue).unwrap();
    let s = seen.clone();
    source.set_event_handler(move |data| s.record(data));

    // Deliveries are held back until every merge happened.
    queue.suspend();
    source.activate();
    for &value in merges {
        source.merge_data(value).unwrap();
    }
    // Ignored.
    source.merge_data(0).unwrap();
    queue.resume();

    assert!(wait_for(|| seen.len() == 1));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(seen.snapshot(), vec![expected]);
    source.cancel();
}

#[test]
fn test_registration_runs_before_events() {
    let rt = test_runtime(2);
    let queue = queue_on(&rt, "order", Width::Serial);
    let order = Recorder::new();

    let source = Source::new(SourceType::DataAdd, 0, 0, &queue).unwrap();
    let o = order.clone();
    source.set_registration_handler(move || o.record("registered"));
    let o = order.clone();
    source.set_event_handler(move |_| o.record("event"));
    let o = order.clone();
    source.set_cancel_handler(move || o.record("canceled"));

    source.merge_data(1).unwrap();
    source.activate();
    assert!(wait_for(|| order.len() == 2));

    source.cancel();
    source.cancel();
    assert!(source.is_canceled());
    assert!(wait_for(|| order.len() == 3));

    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(order.snapshot(), vec!["registered", "event", "canceled"]);
}

#[test]
fn test_cancel_before_activate() {
    let rt = test_runtime(1);
    let queue = queue_on(&rt, "early-cancel", Width::Serial);
    let seen = Recorder::new();

    let source = Source::new(SourceType::DataAdd, 0, 0, &queue).unwrap();
    let s = seen.clone();
    source.set_event_handler(move |_| s.record("event"));
    let s = seen.clone();
    source.set_cancel_handler(move || s.record("canceled"));

    source.cancel();
    source.merge_data(3).unwrap();
    std::thread::sleep(Duration::from_millis(10));
    // The private queue is still inactive.
    assert_eq!(seen.len(), 0);

    source.activate();
    assert!(wait_for(|| seen.len() == 1));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(seen.snapshot(), vec!["canceled"]);
}

#[test]
fn test_suspend_then_resume_before_activate_delivers() {
    let rt = test_runtime(2);
    let queue = queue_on(&rt, "suspend-inactive", Width::Serial);
    let seen = Recorder::new();

    let source = Source::new(SourceType::DataAdd, 0, 0, &queue).unwrap();
    let s = seen.clone();
    source.set_event_handler(move |data| s.record(data));

    source.suspend();
    source.resume();
    source.merge_data(3).unwrap();

    assert!(wait_for(|| seen.len() == 1));
    assert_eq!(seen.snapshot(), vec![3]);
    assert!(!source.inner.is_suspended());
    source.cancel();
}

#[rstest::rstest]
#[case::once_inactive(1, false)]
#[case::nested_inactive(3, false)]
#[case::once_active(1, true)]
#[case::nested_active(3, true)]
fn test_resume_undoes_one_suspend(#[case] depth: usize, #[case] activate_first: bool) {
    let rt = test_runtime(2);
    let queue = queue_on(&rt, "suspend-depth", Width::Serial);
    let seen = Recorder::new();

    let source = Source::new(SourceType::DataAdd, 0, 0, &queue).unwrap();
    let s = seen.clone();
    source.set_event_handler(move |data| s.record(data));

    if activate_first {
        source.activate();
    }
    for _ in 0..depth {
        source.suspend();
    }
    source.merge_data(4).unwrap();

    for _ in 1..depth {
        source.resume();
    }
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(seen.len(), 0);
    assert!(source.inner.is_suspended());

    // The last one lets the delivery through, activating if needed.
    source.resume();
    assert!(wait_for(|| seen.len() == 1));
    assert_eq!(seen.snapshot(), vec![4]);
    source.cancel();
}

#[test]
#[should_panic(expected = "over-resume")]
fn test_over_resume_of_active_source_is_fatal() {
    let rt = test_runtime(1);
    let queue = queue_on(&rt, "source-over-resume", Width::Serial);
    let source = Source::new(SourceType::DataOr, 0, 0, &queue).unwrap();
    source.activate();
    source.resume();
}

#[test]
fn test_last_handle_dropped_cancels() {
    let rt = test_runtime(1);
    let queue = queue_on(&rt, "drop", Width::Serial);
    let seen = Recorder::new();

    let source = Source::new(SourceType::DataOr, 0, 0, &queue).unwrap();
    let s = seen.clone();
    source.set_cancel_handler(move || s.record(()));
    source.activate();
    drop(source);

    assert!(wait_for(|| seen.len() == 1));
}

#[test]
fn test_read_source_on_pipe() -> anyhow::Result<()> {
    let rt = test_runtime(2);
    let queue = queue_on(&rt, "pipe-read", Width::Serial);
    let (mut reader, mut writer) = std::io::pipe()?;
    let seen = Recorder::new();
    let canceled = Recorder::new();

    let source = Source::new(SourceType::Read, reader.as_raw_fd() as u64, 0, &queue)?;
    let this = source.clone();
    let s = seen.clone();
    source.set_event_handler(move |available| {
        let mut buf = vec![0u8; available as usize];
        let n = reader.read(&mut buf).unwrap_or(0);
        s.record(available);
        if n == 0 {
            this.cancel();
        }
    });
    let c = canceled.clone();
    source.set_cancel_handler(move || c.record(()));
    source.activate();

    writer.write_all(b"hello")?;
    assert!(wait_for(|| seen.snapshot().contains(&5)));

    // End of file reads as 0.
    drop(writer);
    assert!(wait_for(|| canceled.len() == 1));
    assert_eq!(seen.snapshot().last(), Some(&0));
    Ok(())
}

#[test]
fn test_write_source_on_pipe() -> anyhow::Result<()> {
    let rt = test_runtime(2);
    let queue = queue_on(&rt, "pipe-write", Width::Serial);
    let (_reader, writer) = std::io::pipe()?;
    let seen = Recorder::new();

    let source = Source::new(SourceType::Write, writer.as_raw_fd() as u64, 0, &queue)?;
    let this = source.clone();
    let s = seen.clone();
    source.set_event_handler(move |data| {
        s.record(data);
        this.cancel();
    });
    source.activate();

    assert!(wait_for(|| seen.len() == 1));
    assert_eq!(seen.snapshot(), vec![1]);
    Ok(())
}

#[test]
fn test_read_source_on_regular_file() -> anyhow::Result<()> {
    let rt = test_runtime(2);
    let queue = queue_on(&rt, "file-read", Width::Serial);
    let mut file = tempfile::tempfile()?;
    file.write_all(&[7u8; 100])?;
    file.seek(SeekFrom::Start(0))?;
    let seen = Recorder::new();

    let source = Source::new(SourceType::Read, file.as_raw_fd() as u64, 0, &queue)?;
    let this = source.clone();
    let s = seen.clone();
    source.set_event_handler(move |available| {
        s.record(available);
        this.cancel();
    });
    source.activate();

    assert!(wait_for(|| seen.len() == 1));
    assert_eq!(seen.snapshot(), vec![100]);
    drop(file);
    Ok(())
}

#[test]
fn test_signal_source_counts_deliveries() -> anyhow::Result<()> {
    let rt = test_runtime(2);
    let queue = queue_on(&rt, "signals", Width::Serial);
    let installed = Recorder::new();
    let seen = Recorder::new();

    let source = Source::new(SourceType::Signal, libc::SIGUSR2 as u64, 0, &queue)?;
    let i = installed.clone();
    source.set_registration_handler(move || i.record(()));
    let s = seen.clone();
    source.set_event_handler(move |count| s.record(count));
    source.activate();

    // The handler is in place once registered, SIGUSR2 no longer terminates.
    assert!(wait_for(|| installed.len() == 1));
    raise(Signal::SIGUSR2)?;
    raise(Signal::SIGUSR2)?;

    assert!(wait_for(|| seen.snapshot().iter().sum::<u64>() == 2));
    source.cancel();
    Ok(())
}

#[test]
fn test_process_source_reports_exit() -> anyhow::Result<()> {
    let rt = test_runtime(2);
    let queue = queue_on(&rt, "process", Width::Serial);
    let mut child = std::process::Command::new("true").spawn()?;
    let seen = Recorder::new();

    let source = Source::new(
        SourceType::Process,
        child.id() as u64,
        ProcessEvents::EXIT.bits(),
        &queue,
    )?;
    let s = seen.clone();
    source.set_event_handler(move |events| s.record(events));
    source.activate();

    assert!(wait_for(|| seen.len() == 1));
    assert_eq!(seen.snapshot(), vec![ProcessEvents::EXIT.bits()]);

    child.wait()?;
    source.cancel();
    Ok(())
}

#[test]
fn test_repeating_timer() {
    let rt = test_runtime(2);
    let queue = queue_on(&rt, "timer", Width::Serial);
    let seen = Recorder::new();

    let source = Source::new(SourceType::Timer, 0, TimerFlags::STRICT.bits(), &queue).unwrap();
    let s = seen.clone();
    source.set_event_handler(move |fires| s.record(fires));
    source
        .set_timer(
            DispatchTime::after(Duration::from_millis(5)),
            Some(Duration::from_millis(5)),
            Duration::ZERO,
        )
        .unwrap();
    source.activate();

    assert!(wait_for(|| seen.snapshot().iter().sum::<u64>() >= 3));
    source.cancel();
}

#[test]
fn test_one_shot_timer_fires_once() {
    let rt = test_runtime(2);
    let queue = queue_on(&rt, "one-shot", Width::Serial);
    let seen = Recorder::new();

    let source = Source::new(SourceType::Timer, 0, 0, &queue).unwrap();
    let s = seen.clone();
    source.set_event_handler(move |fires| s.record(fires));
    source
        .set_timer(
            DispatchTime::after(Duration::from_millis(10)),
            None,
            Duration::from_millis(1),
        )
        .unwrap();
    source.activate();

    assert!(wait_for(|| seen.len() == 1));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(seen.snapshot(), vec![1]);
    source.cancel();
}

#[test]
fn test_suspended_timer_fires_after_resume() {
    let rt = test_runtime(2);
    let queue = queue_on(&rt, "suspended-timer", Width::Serial);
    let seen = Recorder::new();

    let source = Source::new(SourceType::Timer, 0, 0, &queue).unwrap();
    let s = seen.clone();
    source.set_event_handler(move |fires| s.record(fires));
    source
        .set_timer(DispatchTime::after(Duration::from_millis(5)), None, Duration::ZERO)
        .unwrap();

    source.suspend();
    source.activate();
    std::thread::sleep(Duration::from_millis(40));
    assert_eq!(seen.len(), 0);

    source.resume();
    assert!(wait_for(|| seen.len() == 1));
    source.cancel();
}

#[test]
fn test_timer_set_to_forever_never_fires() {
    let rt = test_runtime(1);
    let queue = queue_on(&rt, "forever", Width::Serial);
    let seen = Recorder::new();

    let source = Source::new(SourceType::Timer, 0, 0, &queue).unwrap();
    let s = seen.clone();
    source.set_event_handler(move |fires| s.record(fires));
    source
        .set_timer(DispatchTime::after(Duration::from_millis(5)), None, Duration::ZERO)
        .unwrap();
    source.activate();
    source
        .set_timer(DispatchTime::Forever, None, Duration::ZERO)
        .unwrap();

    std::thread::sleep(Duration::from_millis(40));
    // Racing the first configuration may have let it fire.
    assert!(seen.len() <= 1);
    source.cancel();
}

#[test]
fn test_queue_after() {
    let rt = test_runtime(2);
    let queue = queue_on(&rt, "after", Width::Serial);
    let seen = Recorder::new();

    let start = Instant::now();
    let s = seen.clone();
    queue.after(DispatchTime::after(Duration::from_millis(20)), move || {
        s.record(start.elapsed())
    });

    assert!(wait_for(|| seen.len() == 1));
    assert!(seen.snapshot()[0] >= Duration::from_millis(20));

    let s = seen.clone();
    queue.after(DispatchTime::Now, move || s.record(Duration::ZERO));
    assert!(wait_for(|| seen.len() == 2));
}
