use crate::continuation::{Continuation, ContinuationFlags};
use crate::context;
use crate::object::{DispatchObject, ObjRef, XRef};
use crate::runtime::{self, Runtime};
use crate::sync::Group;
use crate::time::DispatchTime;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

mod drain;
pub(crate) use drain::WidthReservation;

mod mpsc;
use mpsc::MpscList;

mod state;
use state::{State, StateBits};

pub(crate) mod sync;

/// Width of queues that never limit concurrency. Leaves room in the running
/// count for the increments of racing admissions.
pub(crate) const WIDTH_UNBOUNDED: u32 = i32::MAX as u32;

/// Scheduling priority. Each maps to one root queue of the runtime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Background,
    Low,
    #[default]
    Default,
    High,
}

impl Priority {
    /// Lowest first.
    pub const ALL: [Priority; 4] = [
        Priority::Background,
        Priority::Low,
        Priority::Default,
        Priority::High,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    fn label(self) -> &'static str {
        match self {
            Priority::Background => "rdispatch.root.background",
            Priority::Low => "rdispatch.root.low",
            Priority::Default => "rdispatch.root.default",
            Priority::High => "rdispatch.root.high",
        }
    }
}

/// How many items of a queue may run at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    /// One at a time, in submission order.
    Serial,
    /// As many as the root queue's threads allow.
    Concurrent,
    /// At most `n`.
    Bounded(usize),
}

impl Width {
    #[track_caller]
    fn as_u32(self) -> u32 {
        match self {
            Width::Serial => 1,
            Width::Concurrent => WIDTH_UNBOUNDED,
            Width::Bounded(n) => {
                assert!(n > 0, "queue width must be greater than 0");
                n.min(WIDTH_UNBOUNDED as usize) as u32
            }
        }
    }

    fn from_u32(width: u32) -> Self {
        match width {
            1 => Width::Serial,
            WIDTH_UNBOUNDED => Width::Concurrent,
            n => Width::Bounded(n as usize),
        }
    }
}

#[derive(Debug)]
enum QueueKind {
    /// Backed by the runtime's thread pool.
    Root(runtime::Handle),
    Custom,
}

pub(crate) struct QueueInner {
    label: String,
    width: u32,
    priority: Priority,
    kind: QueueKind,
    state: AtomicU64,
    items: MpscList,

    /// Item popped by the drainer but not admitted yet. Guarded by the drain
    /// lock, advertised through `STASHED` in the state word.
    stash: AtomicPtr<Continuation>,

    /// Strong reference up the tree. `None` for root queues only.
    target: RwLock<Option<ObjRef<QueueInner>>>,
}

impl QueueInner {
    fn new_custom(
        label: String,
        width: u32,
        priority: Priority,
        target: ObjRef<QueueInner>,
        inactive: bool,
    ) -> Self {
        let bits = if inactive { StateBits::INACTIVE } else { StateBits::empty() };

        Self {
            label,
            width,
            priority,
            kind: QueueKind::Custom,
            state: AtomicU64::new(bits.bits()),
            items: MpscList::new(),
            stash: AtomicPtr::new(std::ptr::null_mut()),
            target: RwLock::new(Some(target)),
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn priority(&self) -> Priority {
        self.priority
    }

    fn state(&self) -> State {
        State(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.state().suspend_count() > 0
    }

    pub(crate) fn is_root(&self) -> bool {
        matches!(self.kind, QueueKind::Root(_))
    }

    fn target(&self) -> Option<ObjRef<QueueInner>> {
        self.target.read().clone()
    }

    /// The runtime at the end of the target chain.
    pub(crate) fn runtime(&self) -> runtime::Handle {
        match &self.kind {
            QueueKind::Root(handle) => handle.clone(),
            QueueKind::Custom => match self.target() {
                Some(target) => target.runtime(),
                None => unreachable!("custom queue without target"),
            },
        }
    }

    fn target_is_root(&self) -> bool {
        self.target.read().as_ref().is_some_and(|t| t.is_root())
    }

    /// Calls `f` on this queue and every queue up the target chain.
    pub(crate) fn any_in_chain(
        this: &ObjRef<QueueInner>,
        f: impl Fn(&ObjRef<QueueInner>) -> bool,
    ) -> bool {
        let mut cur = Some(this.clone());
        while let Some(q) = cur {
            if f(&q) {
                return true;
            }
            cur = q.target();
        }
        false
    }
}

impl DispatchObject for QueueInner {
    const KIND: &'static str = "queue";

    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        write!(
            f,
            "label = {}, width = {:?}, priority = {:?}, suspended = {}, running = {}, root = {}",
            self.label,
            Width::from_u32(self.width),
            self.priority,
            state.suspend_count(),
            state.running(),
            self.is_root(),
        )
    }

    fn last_external_release(this: &ObjRef<Self>) {
        let state = this.state();
        if state.is_held() && !this.items.is_empty() && !std::thread::panicking() {
            crash!(
                "queue {} released while {} with pending work",
                this.label,
                if state.is_inactive() { "inactive" } else { "suspended" }
            );
        }
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        let stashed = *self.stash.get_mut();
        if !stashed.is_null() {
            // Safety: set by the drainer from `Box::into_raw`, nobody else
            // can reach it anymore.
            drop(unsafe { Box::from_raw(stashed) });
        }
    }
}

/// A FIFO of work items drained by the runtime's threads.
///
/// Queues form a tree: each forwards its work to its target queue, ending
/// at one of the runtime's root queues. A serial queue runs one item at a
/// time in submission order; a concurrent queue runs up to its width.
/// Cloning a `Queue` yields another handle to the same queue.
///
/// # Panics
///
/// Dropping the last handle of a queue that is suspended or inactive while
/// items are still waiting on it panics: they could never run.
#[derive(Clone)]
pub struct Queue {
    inner: XRef<QueueInner>,
}

impl Queue {
    /// Creates a queue targeting the default-priority root queue of the
    /// global runtime.
    pub fn new(label: impl Into<String>, width: Width) -> Queue {
        Queue::builder(label).width(width).build()
    }

    pub fn serial(label: impl Into<String>) -> Queue {
        Queue::new(label, Width::Serial)
    }

    pub fn concurrent(label: impl Into<String>) -> Queue {
        Queue::new(label, Width::Concurrent)
    }

    pub fn builder(label: impl Into<String>) -> QueueBuilder {
        QueueBuilder::new(label.into())
    }

    pub(crate) fn new_root(handle: runtime::Handle, priority: Priority) -> Queue {
        let inner = QueueInner {
            label: priority.label().to_string(),
            width: WIDTH_UNBOUNDED,
            priority,
            kind: QueueKind::Root(handle),
            state: AtomicU64::new(0),
            items: MpscList::new(),
            stash: AtomicPtr::new(std::ptr::null_mut()),
            target: RwLock::new(None),
        };

        Queue {
            inner: XRef::new(inner),
        }
    }

    pub(crate) fn inner(&self) -> &XRef<QueueInner> {
        &self.inner
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn width(&self) -> Width {
        Width::from_u32(self.inner.width)
    }

    pub fn priority(&self) -> Priority {
        self.inner.priority
    }

    /// Submits `f` without waiting for it.
    pub fn exec_async<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Continuation::closure(
            Box::new(f),
            ContinuationFlags::ASYNC,
            self.inner.priority,
        ));
    }

    /// Submits `f` to run alone: after everything submitted before it has
    /// finished and before anything submitted after it starts. Same as
    /// [`exec_async`](Self::exec_async) on root queues.
    pub fn barrier_async<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Continuation::closure(
            Box::new(f),
            ContinuationFlags::ASYNC | ContinuationFlags::BARRIER,
            self.inner.priority,
        ));
    }

    /// Submits `f` as part of `group`, which is left once `f` returns.
    pub fn group_async<F>(&self, group: &Group, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        group.enter();
        let cont = Continuation::closure(Box::new(f), ContinuationFlags::ASYNC, self.inner.priority)
            .with_group(group.clone());
        self.submit(cont);
    }

    /// Runs `f` on this queue and waits for it, returning its output.
    ///
    /// # Panics
    ///
    /// Panics if the current thread already holds this queue, or one of its
    /// targets, exclusively: waiting would deadlock.
    #[track_caller]
    pub fn exec_sync<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        sync::run_sync(&self.inner, false, f)
    }

    /// [`exec_sync`](Self::exec_sync) with barrier semantics.
    #[track_caller]
    pub fn barrier_sync<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        sync::run_sync(&self.inner, true, f)
    }

    /// Submits `f` once `when` is reached.
    pub fn after<F>(&self, when: DispatchTime, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        crate::source::schedule_after(self, when, Box::new(f));
    }

    /// Stops the queue from starting new items until a matching
    /// [`resume`](Self::resume). Submitting keeps working. No-op on root
    /// queues.
    pub fn suspend(&self) {
        QueueInner::suspend(&self.inner);
    }

    /// # Panics
    ///
    /// Panics when not matched by a previous [`suspend`](Self::suspend),
    /// unless the queue is inactive, in which case it is activated.
    #[track_caller]
    pub fn resume(&self) {
        QueueInner::resume(&self.inner);
    }

    /// Starts a queue built with [`QueueBuilder::inactive`]. No-op otherwise.
    pub fn activate(&self) {
        QueueInner::activate(&self.inner);
    }

    /// # Panics
    ///
    /// Panics on root queues and if `target` already targets this queue.
    #[track_caller]
    pub fn set_target(&self, target: &Queue) {
        QueueInner::set_target(&self.inner, &target.inner);
    }

    /// The queue whose work the current thread is running. `None` off any
    /// queue, or once every handle to that queue was dropped.
    pub fn current() -> Option<Queue> {
        let inner = context::current_queue()?.try_external()?;
        Some(Queue { inner })
    }

    /// Is the current thread running work of this queue, directly or through
    /// a queue targeting it?
    pub fn is_current(&self) -> bool {
        context::is_on_queue(&self.inner.as_internal())
    }

    fn submit(&self, cont: Box<Continuation>) {
        QueueInner::enqueue(&self.inner, cont);
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

/// Label of the queue whose work the current thread is running.
pub fn current_queue_label() -> Option<String> {
    context::current_queue().map(|q| q.label().to_string())
}

pub struct QueueBuilder {
    label: String,
    width: Width,
    priority: Option<Priority>,
    target: Option<Queue>,
    inactive: bool,
}

impl QueueBuilder {
    fn new(label: String) -> Self {
        Self {
            label,
            width: Width::Serial,
            priority: None,
            target: None,
            inactive: false,
        }
    }

    #[track_caller]
    pub fn width(mut self, width: Width) -> Self {
        // Validate eagerly to point at the caller.
        width.as_u32();
        self.width = width;
        self
    }

    /// Picks the root queue to target when no explicit target is set.
    /// Defaults to the target's priority, or [`Priority::Default`].
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn target(mut self, target: &Queue) -> Self {
        self.target = Some(target.clone());
        self
    }

    /// The queue will not drain until [`Queue::activate`].
    pub fn inactive(mut self) -> Self {
        self.inactive = true;
        self
    }

    pub fn build(self) -> Queue {
        let (target, priority) = match self.target {
            Some(target) => {
                let priority = self.priority.unwrap_or(target.priority());
                (target, priority)
            }
            None => {
                let priority = self.priority.unwrap_or_default();
                (Runtime::global().root_queue(priority), priority)
            }
        };

        let inner = QueueInner::new_custom(
            self.label,
            self.width.as_u32(),
            priority,
            target.inner.as_internal(),
            self.inactive,
        );

        tracing::trace!(label = %inner.label, width = ?self.width, ?priority, "queue created");

        Queue {
            inner: XRef::new(inner),
        }
    }
}

#[cfg(test)]
mod tests;
