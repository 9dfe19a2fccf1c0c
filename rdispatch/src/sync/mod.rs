//! Blocking coordination primitives.

pub(crate) mod event;

mod group;
pub use group::Group;

mod once;
pub use once::Once;

mod semaphore;
pub use semaphore::Semaphore;
