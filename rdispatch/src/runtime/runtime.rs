use crate::manager::Manager;
use crate::queue::{Priority, Queue};
use crate::runtime::RuntimeConfig;
use crate::runtime::pool::Pool;
use anyhow::Result;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// State shared by the root queues of a runtime and everything targeting
/// them.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) cfg: RuntimeConfig,
    pub(crate) pool: Arc<Pool>,
    pub(crate) manager: Manager,
}

pub(crate) type Handle = Arc<Shared>;

/// A thread pool with its root queues, plus the manager thread that
/// delivers source events.
///
/// Most programs use the process-wide [`Runtime::global`], which queues
/// built without an explicit target run on. A private runtime is built with
/// [`Builder`](crate::Builder) and reached through its
/// [`root_queue`](Runtime::root_queue)s.
pub struct Runtime {
    handle: Handle,

    /// Indexed by `Priority::index`.
    roots: [Queue; 4],
}

impl Runtime {
    pub(crate) fn start(cfg: RuntimeConfig) -> Result<Runtime> {
        let pool = Pool::new(&cfg);
        let manager = Manager::start(&cfg)?;

        let handle = Arc::new(Shared { cfg, pool, manager });

        if let Err(e) = handle.pool.spawn_workers() {
            Self::stop(&handle);
            return Err(e);
        }

        let roots = Priority::ALL.map(|p| Queue::new_root(Arc::clone(&handle), p));

        tracing::debug!(
            workers = handle.cfg.worker_threads,
            max_threads = handle.cfg.max_threads,
            "runtime started"
        );

        Ok(Runtime { handle, roots })
    }

    /// The process-wide runtime, started on first use with the default
    /// [`Builder`](crate::Builder) settings. Never shut down.
    ///
    /// # Panics
    ///
    /// Panics if the runtime cannot be started.
    pub fn global() -> &'static Runtime {
        static GLOBAL: OnceLock<Runtime> = OnceLock::new();

        GLOBAL.get_or_init(|| match crate::Builder::new().try_build() {
            Ok(rt) => rt,
            Err(e) => crash!("failed to start the global runtime: {:#}", e),
        })
    }

    /// The root queue for `priority`. Work submitted here runs concurrently
    /// on the pool, without ordering guarantees.
    pub fn root_queue(&self, priority: Priority) -> Queue {
        self.roots[priority.index()].clone()
    }

    /// Stops the manager thread and the workers, and drops work that did not
    /// run. Queues and sources of this runtime stay valid, but nothing
    /// submitted to them runs anymore.
    pub fn shutdown(self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&self) {
        Self::stop(&self.handle);
    }

    fn stop(handle: &Handle) {
        if let Err(e) = handle.manager.shutdown() {
            tracing::error!(error = %e, "error during manager shutdown");
        }
        if let Err(e) = handle.pool.shutdown() {
            tracing::error!(error = %e, "error during runtime shutdown");
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("worker_threads", &self.handle.cfg.worker_threads)
            .field("max_threads", &self.handle.cfg.max_threads)
            .finish()
    }
}
