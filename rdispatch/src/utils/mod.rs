#[macro_use]
mod macros;

pub(crate) mod backoff;
pub(crate) use backoff::retry_with_backoff;

pub(crate) mod scope_guard;
pub(crate) use scope_guard::ScopeGuard;

pub(crate) mod sys;

