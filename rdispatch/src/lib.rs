//! Queue-based concurrency runtime.
//!
//! Work is submitted to [`Queue`]s as closures. Queues form a tree through
//! their target queue, ending at the root queues of a [`Runtime`], which are
//! drained by a thread pool. Kernel readiness, signals, process exits and
//! timers are delivered through [`Source`]s, which are installed and armed by
//! a single manager thread per runtime.
//!
//! ```no_run
//! use rdispatch::{Queue, Width, Group};
//!
//! let queue = Queue::new("com.example.work", Width::Bounded(4));
//! let group = Group::new();
//!
//! for i in 0..16 {
//!     queue.group_async(&group, move || println!("item {i}"));
//! }
//!
//! group.wait(None).unwrap();
//! ```

#[macro_use]
mod utils;

mod apply;
pub use apply::apply;

mod context;

mod continuation;

pub mod error;
pub use error::{SourceError, WaitTimeout};

mod manager;

mod object;
pub use object::voucher::{self, Voucher};

pub mod queue;
pub use queue::{Priority, Queue, QueueBuilder, Width, current_queue_label};

pub mod runtime;
pub use runtime::{Builder, Runtime, UnhandledPanic};

pub mod source;
pub use source::{ProcessEvents, Source, SourceType, TimerFlags};

pub mod sync;
pub use sync::{Group, Once, Semaphore};

pub mod time;
pub use time::DispatchTime;

mod timer;

#[cfg(test)]
mod test_utils;
