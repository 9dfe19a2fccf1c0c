//! Sources: kernel events, signals, process exits, timers and custom data
//! delivered to a handler on a queue.
//!
//! A source owns a private serial queue targeting the queue it was created
//! with. Events are merged into a pending-data word, and one delivery at a
//! time runs the event handler on the private queue. Kernel registrations
//! are only touched by the manager thread.

use crate::continuation::Closure;
use crate::error::SourceError;
use crate::manager::{Command, ManagerToken};
use crate::object::{DispatchObject, ObjRef, XRef};
use crate::queue::Queue;
use crate::runtime;
use crate::time::DispatchTime;
use crate::timer::{Tier, TimerSpec};
use crate::utils::ScopeGuard;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

mod kind;
pub(crate) use kind::Merge;
pub use kind::{ProcessEvents, SourceType, TimerFlags};

mod state;
pub(crate) use state::SourceState;

/// Upper bound of the leeway picked for `Queue::after`.
const AFTER_MAX_LEEWAY: Duration = Duration::from_millis(100);

type EventHandler = Box<dyn FnMut(u64) + Send + 'static>;

#[derive(Default)]
struct Handlers {
    event: Option<EventHandler>,
    registration: Option<Closure>,
    cancel: Option<Closure>,
}

pub(crate) struct SourceInner {
    kind: SourceType,
    ident: u64,
    mask: u64,

    /// Not delivered yet. Replace-merged sources store the complement so a
    /// latched 0 (end of file) stays distinguishable from nothing.
    pending: AtomicU64,

    /// Data of the last delivery.
    data: AtomicU64,

    state: AtomicU32,
    handlers: Mutex<Handlers>,
    timer: Mutex<Option<TimerSpec>>,

    /// Private serial queue handlers run on.
    queue: Queue,
    runtime: runtime::Handle,
}

impl SourceInner {
    fn state(&self) -> SourceState {
        SourceState::from_bits_retain(self.state.load(Ordering::SeqCst))
    }

    fn set(&self, bits: SourceState) -> SourceState {
        SourceState::from_bits_retain(self.state.fetch_or(bits.bits(), Ordering::SeqCst))
    }

    fn clear(&self, bits: SourceState) -> SourceState {
        SourceState::from_bits_retain(self.state.fetch_and(!bits.bits(), Ordering::SeqCst))
    }

    pub(crate) fn kind(&self) -> SourceType {
        self.kind
    }

    pub(crate) fn ident(&self) -> u64 {
        self.ident
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.state().contains(SourceState::CANCELED)
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.state().contains(SourceState::ARMED)
    }

    pub(crate) fn is_installed(&self) -> bool {
        self.state().contains(SourceState::INSTALLED)
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.queue.inner().is_suspended()
    }

    pub(crate) fn is_strict(&self) -> bool {
        self.kind == SourceType::Timer
            && TimerFlags::from_bits_retain(self.mask).contains(TimerFlags::STRICT)
    }

    pub(crate) fn timer_tier(&self) -> Tier {
        Tier::for_priority(self.queue.priority())
    }

    pub(crate) fn timer_spec(&self) -> Option<TimerSpec> {
        *self.timer.lock()
    }

    /// Merges `data` and schedules a delivery if none is queued.
    pub(crate) fn latch(this: &ObjRef<Self>, data: u64) {
        match this.kind.merge() {
            Merge::Add => {
                this.pending.fetch_add(data, Ordering::SeqCst);
            }
            Merge::Or => {
                this.pending.fetch_or(data, Ordering::SeqCst);
            }
            Merge::Replace => {
                this.pending.swap(!data, Ordering::SeqCst);
            }
        }

        let state = this.state();
        if state.contains(SourceState::INSTALLED) && !state.contains(SourceState::CANCELED) {
            Self::schedule_delivery(this);
        }
    }

    fn schedule_delivery(this: &ObjRef<Self>) {
        if this.set(SourceState::DELIVERY_PENDING).contains(SourceState::DELIVERY_PENDING) {
            return;
        }

        let source = this.clone();
        this.queue.exec_async(move || SourceInner::deliver(&source));
    }

    /// Runs on the private queue.
    fn deliver(this: &ObjRef<Self>) {
        // Cleared before taking the data: a racing latch schedules another
        // delivery, which finds nothing if we took its data already.
        this.clear(SourceState::DELIVERY_PENDING);

        let raw = this.pending.swap(0, Ordering::SeqCst);
        if raw == 0 || this.is_canceled() {
            return;
        }

        let data = match this.kind.merge() {
            Merge::Replace => !raw,
            Merge::Add | Merge::Or => raw,
        };
        this.data.store(data, Ordering::Release);

        let _rearm = ScopeGuard::new(|| {
            if this.kind.rearms() && !this.is_canceled() {
                this.runtime.manager.send(Command::Rearm(this.clone()));
            }
        });

        let Some(mut handler) = this.handlers.lock().event.take() else {
            return;
        };

        tracing::trace!(
            source = %this.id(),
            kind = this.kind.name(),
            data,
            "delivering source event"
        );
        let res = panic::catch_unwind(AssertUnwindSafe(|| handler(data)));

        {
            let mut handlers = this.handlers.lock();
            // Replaced from within the handler, or dropped by cancellation.
            if handlers.event.is_none() && !this.is_canceled() {
                handlers.event = Some(handler);
            }
        }

        if let Err(payload) = res {
            panic::resume_unwind(payload);
        }
    }

    /// The manager registered the source. Queues the registration handler,
    /// then anything latched before.
    pub(crate) fn installed(this: &ObjRef<Self>, _token: &ManagerToken) {
        this.set(SourceState::INSTALLED);
        tracing::trace!(source = %this.id(), kind = this.kind.name(), "source installed");

        let source = this.clone();
        this.queue.exec_async(move || {
            let handler = source.handlers.lock().registration.take();
            if let Some(handler) = handler
                && !source.is_canceled()
            {
                handler();
            }
        });

        if this.pending.load(Ordering::SeqCst) != 0 {
            Self::schedule_delivery(this);
        }
    }

    pub(crate) fn arm(&self, _token: &ManagerToken) {
        self.set(SourceState::ARMED);
    }

    pub(crate) fn disarm(&self, _token: &ManagerToken) {
        self.clear(SourceState::ARMED);
    }

    /// The manager tore the registration down, or there never was one.
    pub(crate) fn uninstalled(this: &ObjRef<Self>, _token: &ManagerToken) {
        this.set(SourceState::UNINSTALLED);
        this.clear(SourceState::ARMED);
        Self::finish_cancel(this);
    }

    /// Queues the cancel handler. The other handlers are dropped first.
    fn finish_cancel(this: &ObjRef<Self>) {
        let source = this.clone();
        this.queue.exec_async(move || {
            let Handlers {
                event,
                registration,
                cancel,
            } = std::mem::take(&mut *source.handlers.lock());

            // May hold the last external handle of this source.
            drop((event, registration));

            tracing::trace!(source = %source.id(), kind = source.kind.name(), "source canceled");
            if let Some(cancel) = cancel {
                cancel();
            }
        });
    }

    fn activate(this: &ObjRef<Self>) {
        let prev = this.set(SourceState::ACTIVATED);
        if prev.contains(SourceState::ACTIVATED) {
            return;
        }

        if !prev.contains(SourceState::CANCELED) {
            this.runtime.manager.send(Command::Install(this.clone()));
        }
        this.queue.activate();
    }

    fn cancel(this: &ObjRef<Self>) {
        let prev = this.set(SourceState::CANCELED);
        if prev.contains(SourceState::CANCELED) {
            return;
        }

        if prev.contains(SourceState::ACTIVATED) {
            this.runtime.manager.send(Command::Cancel(this.clone()));
        } else {
            // Never handed to the manager. Runs once the source is activated
            // or released.
            Self::finish_cancel(this);
        }
    }
}

impl DispatchObject for SourceInner {
    const KIND: &'static str = "source";

    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "kind = {}, handle = {}, mask = {:#x}, state = {:?}, data = {}",
            self.kind.name(),
            self.ident,
            self.mask,
            self.state(),
            self.data.load(Ordering::Relaxed),
        )
    }

    fn last_external_release(this: &ObjRef<Self>) {
        if this.is_suspended() {
            tracing::warn!(
                source = %this.id(),
                "suspended source released, its cancel handler will never run"
            );
        }

        Self::cancel(this);
        // Let a never activated source run its cancel handler.
        this.queue.activate();
    }
}

/// Delivers events of one kind to handlers running on a queue.
///
/// Sources are created inactive: configure the handlers, then call
/// [`activate`](Self::activate). Dropping the last handle of a source that
/// was not canceled cancels it.
///
/// ```no_run
/// use rdispatch::{Queue, Source, SourceType};
///
/// let queue = Queue::serial("com.example.events");
/// let source = Source::new(SourceType::DataAdd, 0, 0, &queue).unwrap();
/// source.set_event_handler(|n| println!("{n} events"));
/// source.activate();
///
/// source.merge_data(1).unwrap();
/// source.merge_data(2).unwrap();
/// ```
#[derive(Clone)]
pub struct Source {
    inner: XRef<SourceInner>,
}

impl Source {
    /// Creates an inactive source watching `handle` (a descriptor, signal
    /// number or pid, 0 otherwise) whose handlers run on `queue`.
    pub fn new(
        kind: SourceType,
        handle: u64,
        mask: u64,
        queue: &Queue,
    ) -> Result<Source, SourceError> {
        kind.validate(handle, mask)?;
        Ok(Self::new_unchecked(kind, handle, mask, queue))
    }

    fn new_unchecked(kind: SourceType, handle: u64, mask: u64, queue: &Queue) -> Source {
        let private = Queue::builder(format!("rdispatch.source.{}", kind.name()))
            .target(queue)
            .inactive()
            .build();

        let runtime = queue.inner().runtime();

        let inner = SourceInner {
            kind,
            ident: handle,
            mask,
            pending: AtomicU64::new(0),
            data: AtomicU64::new(0),
            state: AtomicU32::new(0),
            handlers: Mutex::new(Handlers::default()),
            timer: Mutex::new(None),
            queue: private,
            runtime,
        };

        Source {
            inner: XRef::new(inner),
        }
    }

    pub fn kind(&self) -> SourceType {
        self.inner.kind
    }

    pub fn handle(&self) -> u64 {
        self.inner.ident
    }

    pub fn mask(&self) -> u64 {
        self.inner.mask
    }

    /// Data of the last delivery. Meant to be called from handlers.
    pub fn data(&self) -> u64 {
        self.inner.data.load(Ordering::Acquire)
    }

    /// Handler called with the data merged since its last run.
    pub fn set_event_handler<F>(&self, f: F)
    where
        F: FnMut(u64) + Send + 'static,
    {
        self.inner.handlers.lock().event = Some(Box::new(f));
    }

    /// Handler run once, after the source is canceled and its kernel
    /// registration torn down. Resources the source watches may be closed
    /// from here.
    pub fn set_cancel_handler<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.handlers.lock().cancel = Some(Box::new(f));
    }

    /// Handler run once the source is installed, before any event.
    pub fn set_registration_handler<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.handlers.lock().registration = Some(Box::new(f));
    }

    /// Installs the source and starts delivering. No-op if already active.
    pub fn activate(&self) {
        SourceInner::activate(&self.inner.as_internal());
    }

    /// Holds deliveries back until a matching [`resume`](Self::resume).
    /// Events keep being merged meanwhile. Timers stop firing.
    pub fn suspend(&self) {
        self.inner.queue.suspend();
        if self.inner.kind == SourceType::Timer {
            self.inner
                .runtime
                .manager
                .send(Command::DisarmTimer(self.inner.as_internal()));
        }
    }

    /// Undoes one [`suspend`](Self::suspend). An inactive source is
    /// activated once no suspension is left.
    #[track_caller]
    pub fn resume(&self) {
        if !self.inner.state().contains(SourceState::ACTIVATED) {
            // Installation reads the count, the manager needs no notice.
            if self.inner.is_suspended() {
                self.inner.queue.resume();
            }
            if !self.inner.is_suspended() {
                self.activate();
            }
            return;
        }

        self.inner.queue.resume();
        if self.inner.kind == SourceType::Timer && !self.inner.is_suspended() {
            self.inner
                .runtime
                .manager
                .send(Command::ResumeTimer(self.inner.as_internal()));
        }
    }

    /// Stops deliveries and schedules the cancel handler. Idempotent.
    /// A delivery already running completes.
    pub fn cancel(&self) {
        SourceInner::cancel(&self.inner.as_internal());
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.is_canceled()
    }

    /// Merges `value` into a custom source. Zero is ignored.
    pub fn merge_data(&self, value: u64) -> Result<(), SourceError> {
        if !self.inner.kind.is_custom() {
            return Err(SourceError::Unsupported {
                kind: self.inner.kind,
                op: "merge_data",
            });
        }

        if value != 0 {
            SourceInner::latch(&self.inner.as_internal(), value);
        }
        Ok(())
    }

    /// Configures a timer source: first fire at `start`, then every
    /// `interval` if set. The timer may fire up to `leeway` late so its
    /// wakeup can be shared with other timers. `DispatchTime::Forever`
    /// disarms it.
    pub fn set_timer(
        &self,
        start: DispatchTime,
        interval: Option<Duration>,
        leeway: Duration,
    ) -> Result<(), SourceError> {
        if self.inner.kind != SourceType::Timer {
            return Err(SourceError::Unsupported {
                kind: self.inner.kind,
                op: "set_timer",
            });
        }

        *self.inner.timer.lock() = Some(TimerSpec {
            start,
            interval: interval.filter(|i| !i.is_zero()),
            leeway,
        });

        // The install reads the spec stored above.
        if self.inner.state().contains(SourceState::ACTIVATED) {
            self.inner
                .runtime
                .manager
                .send(Command::ConfigureTimer(self.inner.as_internal()));
        }
        Ok(())
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

/// Submits `f` on `queue` at `when`, through a one-shot timer source that
/// cancels itself.
pub(crate) fn schedule_after(queue: &Queue, when: DispatchTime, f: Closure) {
    let remaining = match when.resolve() {
        None => {
            tracing::debug!(queue = queue.label(), "work scheduled for never, dropping it");
            return;
        }
        Some((clock, at)) => Duration::from_nanos(at.saturating_sub(clock.now())),
    };

    if remaining.is_zero() {
        queue.exec_async(f);
        return;
    }

    let source = Source::new_unchecked(SourceType::Timer, 0, 0, queue);
    let leeway = (remaining / 10).min(AFTER_MAX_LEEWAY);
    if let Err(e) = source.set_timer(when, None, leeway) {
        unreachable!("timer source rejected set_timer: {}", e);
    }

    let this = source.clone();
    let mut f = Some(f);
    source.set_event_handler(move |_| {
        let _cancel = ScopeGuard::new(|| this.cancel());
        if let Some(f) = f.take() {
            f();
        }
    });

    source.activate();
}

#[cfg(test)]
mod tests;
