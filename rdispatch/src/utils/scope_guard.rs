/// Runs a closure when dropped, including while unwinding.
///
/// Used wherever a counterpart must be released no matter how the protected
/// code exits, such as handing a queue back after a `sync` closure.
pub(crate) struct ScopeGuard<F: FnOnce()> {
    // `Option` so the closure can be moved out on drop.
    closure: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
        }
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::panic::{self, AssertUnwindSafe};

    #[test]
    fn test_runs_on_scope_exit() {
        let ran = Cell::new(false);
        {
            let _guard = ScopeGuard::new(|| ran.set(true));
            assert!(!ran.get());
        }
        assert!(ran.get());
    }

    #[test]
    fn test_runs_while_unwinding() {
        let ran = Cell::new(false);
        let res = panic::catch_unwind(AssertUnwindSafe(|| {
            let _guard = ScopeGuard::new(|| ran.set(true));
            panic!("boom");
        }));

        assert!(res.is_err());
        assert!(ran.get());
    }
}
