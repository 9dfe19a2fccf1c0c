use super::{Continuation, Work};
use std::cell::RefCell;

/// Records kept per thread. Work submitted and run on the same threads
/// allocates nothing in steady state.
const CACHE_LIMIT: usize = 32;

thread_local! {
    static CACHE: RefCell<Vec<Box<Continuation>>> = const { RefCell::new(Vec::new()) };
}

pub(super) fn alloc(cont: Continuation) -> Box<Continuation> {
    match CACHE.try_with(|cache| cache.borrow_mut().pop()) {
        Ok(Some(mut slot)) => {
            *slot = cont;
            slot
        }
        _ => Box::new(cont),
    }
}

pub(super) fn recycle(slot: Box<Continuation>) {
    debug_assert!(matches!(slot.work, Work::Consumed));

    // If the thread-local is gone the closure, and the box with it, is
    // dropped.
    let _ = CACHE.try_with(move |cache| {
        let mut cache = cache.borrow_mut();
        if cache.len() < CACHE_LIMIT {
            cache.push(slot);
        }
    });
}

#[cfg(test)]
fn cached() -> usize {
    CACHE.with(|cache| cache.borrow().len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::ContinuationFlags;
    use crate::queue::Priority;

    fn noop() -> Box<Continuation> {
        Continuation::closure(Box::new(|| {}), ContinuationFlags::ASYNC, Priority::Default)
    }

    #[test]
    fn test_recycled_box_is_reused() {
        // Runs on its own thread to start from an empty cache.
        std::thread::spawn(|| {
            let cont = noop();
            let addr = &*cont as *const Continuation as usize;
            cont.invoke();
            assert_eq!(cached(), 1);

            let again = noop();
            assert_eq!(&*again as *const Continuation as usize, addr);
            assert_eq!(cached(), 0);
            again.invoke();
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_cache_is_bounded() {
        std::thread::spawn(|| {
            let conts = (0..CACHE_LIMIT + 8).map(|_| noop()).collect::<Vec<_>>();
            conts.into_iter().for_each(Continuation::invoke);
            assert_eq!(cached(), CACHE_LIMIT);
        })
        .join()
        .unwrap();
    }
}
