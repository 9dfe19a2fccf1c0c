use crate::runtime::Runtime;
use anyhow::{Result, anyhow};
use std::convert::TryFrom;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Upper bound on threads per runtime, overcommit included.
const MAX_THREADS: usize = 64;

/// How long an overcommit worker stays parked before exiting.
const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Every N ticks a worker serves the lowest non-empty priority first.
const FAIRNESS_INTERVAL: u32 = 31;

/// Descriptors the manager thread holds: epoll, wakeup eventfd, one timerfd
/// per (clock, tier) and the signal pipe.
pub(crate) const MANAGER_FDS: usize = 10;

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let worker_count = Arc::new(AtomicUsize::new(0));

    ThreadNameFn(Arc::new(move || {
        let id = worker_count.fetch_add(1, Ordering::Relaxed);
        format!("rdispatch-{}", id)
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// What to do when a submitted closure panics. The panic never unwinds into
/// the runtime's own frames either way.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnhandledPanic {
    /// Log the panic and keep running other work.
    #[default]
    Ignore,

    /// Log the panic and abort the process.
    Abort,
}

#[derive(Debug)]
pub struct Builder {
    /// Threads kept runnable. Defaults to one per CPU.
    worker_threads: Option<usize>,

    /// Hard cap on threads, including the overcommit workers started while
    /// others are blocked. Defaults to `MAX_THREADS`, or `worker_threads` if
    /// that is larger.
    max_threads: Option<usize>,

    /// Name fn used for threads spawned by the runtime.
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by the runtime.
    thread_stack_size: Option<usize>,

    /// How long an overcommit worker may stay idle before exiting.
    idle_timeout: Duration,

    /// How many ticks before a worker serves the lowest priority first.
    fairness_interval: u32,

    on_unhandled_panic: UnhandledPanic,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Builder {
        Self {
            worker_threads: None,
            max_threads: None,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            idle_timeout: IDLE_TIMEOUT,
            fairness_interval: FAIRNESS_INTERVAL,
            on_unhandled_panic: UnhandledPanic::default(),
        }
    }

    /// The number of worker threads kept runnable. When some of them block
    /// (in a semaphore, a group wait, a sync call) while work is pending,
    /// extra workers are started, up to [`max_threads`](Self::max_threads).
    ///
    /// Defaults to 1 worker per CPU core.
    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker_threads must be greater than 0");
        self.worker_threads = Some(val);
        self
    }

    #[track_caller]
    pub fn max_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "max_threads must be greater than 0");
        self.max_threads = Some(val);
        self
    }

    /// Sets name of threads spawned by the `Runtime`'s thread pool.
    ///
    /// The default name is "rdispatch-{id}", where id is monotonically
    /// increasing.
    ///
    /// Thread names are truncated beyond 15 bytes according to pthread
    /// limitations.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    /// Sets a function used to generate the name of threads spawned by the `Runtime`'s thread pool.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    ///
    /// The actual stack size may be greater than this value if the platform
    /// specifies minimal stack size.
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    pub fn idle_timeout(mut self, val: Duration) -> Self {
        self.idle_timeout = val;
        self
    }

    /// Sets the number of ticks after which a worker looks at the root
    /// queues lowest priority first.
    ///
    /// A tick is one item run, or one wakeup from parking. Workers normally
    /// serve the highest non-empty priority; a smaller value keeps low
    /// priorities moving under sustained high priority load.
    #[track_caller]
    pub fn fairness_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "fairness_interval must be greater than 0");
        self.fairness_interval = val;
        self
    }

    pub fn on_unhandled_panic(mut self, val: UnhandledPanic) -> Self {
        self.on_unhandled_panic = val;
        self
    }

    /// Creates the configured `Runtime`: its root queues, thread pool and
    /// manager thread.
    pub fn try_build(self) -> Result<Runtime> {
        let cfg = RuntimeConfig::try_from(self)?;
        Runtime::start(cfg)
    }
}

// Export runtime builder as a RuntimeConfig object to be consumed by the pool
// and the manager.
#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) worker_threads: usize,
    pub(crate) max_threads: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) idle_timeout: Duration,
    pub(crate) fairness_interval: u32,
    pub(crate) on_unhandled_panic: UnhandledPanic,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            worker_threads: 1,
            max_threads: MAX_THREADS,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            idle_timeout: IDLE_TIMEOUT,
            fairness_interval: FAIRNESS_INTERVAL,
            on_unhandled_panic: UnhandledPanic::default(),
        }
    }
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        if self.max_threads < self.worker_threads {
            return Err(anyhow!(
                "max_threads ({}) must be at least worker_threads ({})",
                self.max_threads,
                self.worker_threads
            ));
        }

        check_fd_ulimit(MANAGER_FDS)?;

        Ok(())
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let worker_threads = match builder.worker_threads {
            Some(n) => n,
            None => std::thread::available_parallelism()?.get(),
        };

        let cfg = RuntimeConfig {
            worker_threads,
            max_threads: builder
                .max_threads
                .unwrap_or(MAX_THREADS.max(worker_threads)),
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            idle_timeout: builder.idle_timeout,
            fairness_interval: builder.fairness_interval,
            on_unhandled_panic: builder.on_unhandled_panic,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}

/// Checks if the desired number of file descriptors is within the system's soft limit.
fn check_fd_ulimit(desired_fds: usize) -> io::Result<()> {
    let mut rlimit = std::mem::MaybeUninit::<libc::rlimit>::uninit();
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, rlimit.as_mut_ptr()) };

    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    let rlimit = unsafe { rlimit.assume_init() };
    let current_limit = rlimit.rlim_cur as usize;

    if desired_fds > current_limit {
        let error_message = format!(
            "Required file descriptors ({}) exceed the current ulimit ({}) for open files.",
            desired_fds, current_limit
        );
        Err(io::Error::other(error_message))
    } else {
        Ok(())
    }
}
