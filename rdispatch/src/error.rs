use crate::source::SourceType;
use std::time::Duration;

/// Returned by blocking waits that gave up before being signaled.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("timed out after {0:?}")]
pub struct WaitTimeout(pub Duration);

/// Rejected source construction or configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("invalid handle {handle} for {kind:?} source")]
    InvalidHandle { kind: SourceType, handle: u64 },

    #[error("invalid mask {mask:#x} for {kind:?} source")]
    InvalidMask { kind: SourceType, mask: u64 },

    #[error("{op} is not supported by {kind:?} sources")]
    Unsupported { kind: SourceType, op: &'static str },
}
