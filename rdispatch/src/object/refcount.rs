use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering, fence};

// Both counts live in one word so a snapshot is always consistent:
//
//   63            32 31             0
//  +----------------+----------------+
//  |    internal    |    external    |
//  +----------------+----------------+
//
// Every live external reference is backed by a single internal reference,
// which is released when the external count drops to zero. An object is thus
// freed only once it is externally unreachable *and* no runtime structure
// (pending continuation, kernel registration, child queue) pins it.
const EXTERNAL_ONE: u64 = 1;
const INTERNAL_ONE: u64 = 1 << 32;
const COUNT_MASK: u64 = u32::MAX as u64;

#[inline(always)]
fn external(word: u64) -> u64 {
    word & COUNT_MASK
}

#[inline(always)]
fn internal(word: u64) -> u64 {
    word >> 32
}

/// Outcome of dropping a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    /// Other references remain.
    Retained,
    /// That was the last reference of its kind.
    Last,
}

pub(crate) struct RefCount {
    word: AtomicU64,
}

impl RefCount {
    /// One external reference and the internal reference backing it.
    pub(crate) fn new() -> Self {
        Self {
            word: AtomicU64::new(INTERNAL_ONE | EXTERNAL_ONE),
        }
    }

    pub(crate) fn retain_internal(&self) {
        let prev = self.word.fetch_add(INTERNAL_ONE, Ordering::Relaxed);

        if internal(prev) == 0 {
            crash!("resurrection of a disposed object");
        }
        if internal(prev) == COUNT_MASK {
            crash!("internal reference count overflow");
        }
    }

    pub(crate) fn release_internal(&self) -> Release {
        let prev = self.word.fetch_sub(INTERNAL_ONE, Ordering::Release);

        match internal(prev) {
            0 => crash!("over-release of an object"),
            1 => {
                // Pairs with the `Release` decrements of every other owner so
                // their writes happen-before dispose.
                fence(Ordering::Acquire);
                Release::Last
            }
            _ => Release::Retained,
        }
    }

    pub(crate) fn retain_external(&self) {
        let prev = self.word.fetch_add(EXTERNAL_ONE, Ordering::Relaxed);

        if external(prev) == 0 {
            crash!("resurrection of an externally released object");
        }
        if external(prev) == COUNT_MASK {
            crash!("external reference count overflow");
        }
    }

    /// Retains externally unless the external count already dropped to zero.
    pub(crate) fn try_retain_external(&self) -> bool {
        let mut cur = self.word.load(Ordering::Relaxed);

        loop {
            if external(cur) == 0 {
                return false;
            }
            if external(cur) == COUNT_MASK {
                crash!("external reference count overflow");
            }

            match self.word.compare_exchange_weak(
                cur,
                cur + EXTERNAL_ONE,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    pub(crate) fn release_external(&self) -> Release {
        let prev = self.word.fetch_sub(EXTERNAL_ONE, Ordering::Release);

        match external(prev) {
            0 => crash!("over-release of an object (external)"),
            1 => {
                fence(Ordering::Acquire);
                Release::Last
            }
            _ => Release::Retained,
        }
    }

    #[cfg(test)]
    pub(crate) fn external_count(&self) -> u64 {
        external(self.word.load(Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn internal_count(&self) -> u64 {
        internal(self.word.load(Ordering::Relaxed))
    }
}

impl fmt::Debug for RefCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = self.word.load(Ordering::Relaxed);
        f.debug_struct("RefCount")
            .field("external", &external(word))
            .field("internal", &internal(word))
            .finish()
    }
}
