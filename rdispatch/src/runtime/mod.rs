use crate::context;
use std::any::Any;

mod builder;
pub use builder::{Builder, UnhandledPanic};
pub(crate) use builder::RuntimeConfig;

pub(crate) mod pool;

#[allow(clippy::module_inception)]
mod runtime;
pub use runtime::Runtime;
pub(crate) use runtime::{Handle, Shared};

mod ticker;

mod worker;

/// Handles a panic escaping a submitted closure, according to the policy of
/// the runtime the current thread belongs to.
pub(crate) fn unhandled_panic(payload: Box<dyn Any + Send>) {
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>");

    let policy = context::with_worker_pool(|pool| {
        pool.map(|p| p.cfg.on_unhandled_panic).unwrap_or_default()
    });

    tracing::error!(panic = message, queue = ?crate::current_queue_label(), "work item panicked");

    if policy == UnhandledPanic::Abort {
        std::process::abort();
    }
}

#[cfg(test)]
mod tests;
