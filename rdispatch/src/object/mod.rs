use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;

mod id;
pub(crate) use id::ObjectId;

mod refcount;
pub(crate) use refcount::{RefCount, Release};

pub mod voucher;

/// Behavior table shared by every reference-counted runtime object. Dispose
/// is the `Drop` impl of the implementor.
pub(crate) trait DispatchObject: Send + Sync + Sized + 'static {
    const KIND: &'static str;

    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;

    /// Called once, when the last external handle goes away. The object is
    /// still pinned by the internal reference passed in, so it may start an
    /// asynchronous teardown (cancel a source, flush a queue) that holds its
    /// own internal references.
    fn last_external_release(_this: &ObjRef<Self>) {}
}

/// Anything that can mint a new internal reference to `T`.
pub(crate) trait InternalRef<T: DispatchObject>: Deref<Target = T> {
    fn pin(&self) -> ObjRef<T>;
}

impl<T: DispatchObject> InternalRef<T> for XRef<T> {
    fn pin(&self) -> ObjRef<T> {
        self.as_internal()
    }
}

impl<T: DispatchObject> InternalRef<T> for ObjRef<T> {
    fn pin(&self) -> ObjRef<T> {
        self.clone()
    }
}

pub(crate) struct ObjectBox<T> {
    refs: RefCount,
    id: ObjectId,
    value: T,
}

/// External handle: what users hold. Cloning and dropping act on the external
/// count.
pub(crate) struct XRef<T: DispatchObject> {
    ptr: NonNull<ObjectBox<T>>,
    _p: PhantomData<ObjectBox<T>>,
}

/// Internal handle: what the runtime holds while an object has pending work,
/// kernel registrations or children.
pub(crate) struct ObjRef<T: DispatchObject> {
    ptr: NonNull<ObjectBox<T>>,
    _p: PhantomData<ObjectBox<T>>,
}

// Safety: the pointee is only reached through `&T` and `T: Send + Sync`. The
// counts themselves are atomic.
unsafe impl<T: DispatchObject> Send for XRef<T> {}
unsafe impl<T: DispatchObject> Sync for XRef<T> {}
unsafe impl<T: DispatchObject> Send for ObjRef<T> {}
unsafe impl<T: DispatchObject> Sync for ObjRef<T> {}

fn alloc<T>(refs: RefCount, value: T) -> NonNull<ObjectBox<T>> {
    let boxed = Box::new(ObjectBox {
        refs,
        id: ObjectId::next(),
        value,
    });

    NonNull::from(Box::leak(boxed))
}

impl<T: DispatchObject> XRef<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            ptr: alloc(RefCount::new(), value),
            _p: PhantomData,
        }
    }

    fn inner(&self) -> &ObjectBox<T> {
        // Safety: we hold an external reference, which pins an internal one.
        unsafe { self.ptr.as_ref() }
    }

    pub(crate) fn id(&self) -> ObjectId {
        self.inner().id
    }

    /// Takes a new internal reference.
    pub(crate) fn as_internal(&self) -> ObjRef<T> {
        self.inner().refs.retain_internal();
        ObjRef {
            ptr: self.ptr,
            _p: PhantomData,
        }
    }

    #[cfg(test)]
    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }

    #[cfg(test)]
    pub(crate) fn external_count(&self) -> u64 {
        self.inner().refs.external_count()
    }
}

impl<T: DispatchObject> Clone for XRef<T> {
    fn clone(&self) -> Self {
        self.inner().refs.retain_external();
        Self {
            ptr: self.ptr,
            _p: PhantomData,
        }
    }
}

impl<T: DispatchObject> Drop for XRef<T> {
    fn drop(&mut self) {
        if self.inner().refs.release_external() == Release::Last {
            // Adopt the internal reference collectively held by external
            // handles. Dropping it may dispose the object.
            let collective = ObjRef {
                ptr: self.ptr,
                _p: PhantomData,
            };

            tracing::trace!(kind = T::KIND, id = %collective.id(), "last external release");
            T::last_external_release(&collective);
        }
    }
}

impl<T: DispatchObject> Deref for XRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner().value
    }
}

impl<T: DispatchObject> fmt::Debug for XRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}] {{ ", T::KIND, self.id())?;
        self.inner().value.describe(f)?;
        write!(f, " }}")
    }
}

impl<T: DispatchObject> ObjRef<T> {
    fn inner(&self) -> &ObjectBox<T> {
        // Safety: we hold an internal reference.
        unsafe { self.ptr.as_ref() }
    }

    pub(crate) fn id(&self) -> ObjectId {
        self.inner().id
    }

    /// Hands out a new external handle, unless every external handle is
    /// already gone.
    pub(crate) fn try_external(&self) -> Option<XRef<T>> {
        self.inner().refs.try_retain_external().then(|| XRef {
            ptr: self.ptr,
            _p: PhantomData,
        })
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }

    /// Stable address used as identity in thread-local bookkeeping.
    pub(crate) fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

impl<T: DispatchObject> Clone for ObjRef<T> {
    fn clone(&self) -> Self {
        self.inner().refs.retain_internal();
        Self {
            ptr: self.ptr,
            _p: PhantomData,
        }
    }
}

impl<T: DispatchObject> Drop for ObjRef<T> {
    fn drop(&mut self) {
        if self.inner().refs.release_internal() == Release::Last {
            tracing::trace!(kind = T::KIND, id = %self.id(), "dispose");

            // Safety: that was the last reference of any kind, the box was
            // leaked in `alloc`.
            drop(unsafe { Box::from_raw(self.ptr.as_ptr()) });
        }
    }
}

impl<T: DispatchObject> Deref for ObjRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner().value
    }
}

impl<T: DispatchObject> fmt::Debug for ObjRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}] {{ ", T::KIND, self.id())?;
        self.inner().value.describe(f)?;
        write!(f, " }}")
    }
}
