use crate::continuation::Continuation;
use crate::utils::sys::relax;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Intrusive FIFO of continuations. Any thread may push, a single consumer
/// (the thread holding the queue's drain lock) pops.
///
/// A push publishes the node by swapping the tail first and linking the
/// previous tail second. Between those two stores the node is reachable from
/// `tail` only, so the consumer spins until the link becomes visible.
#[derive(Debug)]
pub(crate) struct MpscList {
    head: AtomicPtr<Continuation>,
    tail: AtomicPtr<Continuation>,
}

impl MpscList {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Appends `cont`. Returns true when the list was empty.
    pub(crate) fn push(&self, cont: Box<Continuation>) -> bool {
        cont.next.store(ptr::null_mut(), Ordering::Relaxed);
        let node = Box::into_raw(cont);

        let prev = self.tail.swap(node, Ordering::SeqCst);
        if prev.is_null() {
            self.head.store(node, Ordering::Release);
            true
        } else {
            // Safety: `prev` stays alive until the consumer observes a
            // non-null `next` on it, which is the store below.
            unsafe { (*prev).next.store(node, Ordering::Release) };
            false
        }
    }

    /// # Safety
    ///
    /// Must only be called by the single consumer.
    pub(crate) unsafe fn pop(&self) -> Option<Box<Continuation>> {
        let mut head = self.head.load(Ordering::Acquire);

        if head.is_null() {
            if self.tail.load(Ordering::SeqCst).is_null() {
                return None;
            }

            // A producer swapped the tail of an empty list but has not
            // stored `head` yet.
            loop {
                relax();
                head = self.head.load(Ordering::Acquire);
                if !head.is_null() {
                    break;
                }
            }
        }

        // Safety: `head` is owned by the list until unlinked here.
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        if !next.is_null() {
            self.head.store(next, Ordering::Relaxed);
            // Safety: unlinked, we own it now.
            return Some(unsafe { Box::from_raw(head) });
        }

        // `head` looks like the last node. Clear the list unless a producer
        // raced us, in which case wait for its link.
        self.head.store(ptr::null_mut(), Ordering::Relaxed);
        if self
            .tail
            .compare_exchange(head, ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let next = loop {
                // Safety: producers only write `next` of the old tail.
                let next = unsafe { (*head).next.load(Ordering::Acquire) };
                if !next.is_null() {
                    break next;
                }
                relax();
            };
            self.head.store(next, Ordering::Relaxed);
        }

        // Safety: unlinked, we own it now.
        Some(unsafe { Box::from_raw(head) })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tail.load(Ordering::SeqCst).is_null()
    }
}

impl Drop for MpscList {
    fn drop(&mut self) {
        // Safety: `&mut self`, no producer or consumer left.
        while let Some(cont) = unsafe { self.pop() } {
            drop(cont);
        }
    }
}
