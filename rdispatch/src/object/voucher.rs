//! Ambient context propagated from the submitting thread to the thread that
//! runs the work.
//!
//! A voucher is an opaque value. Work submitted while a voucher is adopted
//! captures it, and the voucher is adopted again for the duration of that
//! work, wherever it runs. The runtime never inspects it.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
pub struct Voucher(Arc<dyn Any + Send + Sync>);

impl Voucher {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }

    pub fn ptr_eq(&self, other: &Voucher) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Voucher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Voucher")
            .field(&Arc::as_ptr(&self.0).cast::<()>())
            .finish()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Voucher>> = const { RefCell::new(None) };
}

/// The voucher adopted by the current thread, if any.
pub fn current() -> Option<Voucher> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Adopts `voucher` on the current thread until the returned guard is
/// dropped, which restores the previous one.
#[must_use = "the voucher is un-adopted when the guard is dropped"]
pub fn adopt(voucher: Option<Voucher>) -> AdoptGuard {
    let prev = CURRENT.with(|c| c.replace(voucher));
    AdoptGuard { prev }
}

pub struct AdoptGuard {
    prev: Option<Voucher>,
}

impl Drop for AdoptGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|c| *c.borrow_mut() = prev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adopt_restores_previous() {
        assert!(current().is_none());

        let outer = Voucher::new("outer");
        {
            let _g = adopt(Some(outer.clone()));
            assert!(current().unwrap().ptr_eq(&outer));

            {
                let _g = adopt(Some(Voucher::new(42u32)));
                assert_eq!(current().unwrap().downcast_ref::<u32>(), Some(&42));
            }

            assert_eq!(current().unwrap().downcast_ref::<&str>(), Some(&"outer"));
        }

        assert!(current().is_none());
    }
}
