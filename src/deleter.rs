//! Deleters: the capability to destroy one managed object.
//!
//! A deleter is captured when a handle is built from a pointer and travels
//! with the control block, so every handle aliasing the block agrees on how
//! the object dies. Any `FnOnce(NonNull<T>)` closure is a deleter.
//!
//! ```
//! use core::ptr::NonNull;
//! use sharedptr::SharedPtr;
//!
//! let raw = Box::into_raw(Box::new(String::from("pooled")));
//! let give_back = |p: NonNull<String>| {
//!     // hand the allocation back to wherever it came from
//!     drop(unsafe { Box::from_raw(p.as_ptr()) });
//! };
//! let p = unsafe { SharedPtr::from_raw_with(raw, give_back) };
//! assert_eq!(&*p, "pooled");
//! ```
use alloc::boxed::Box;
use core::ptr::{self, NonNull};

/// Destroys one object of type `T`.
pub trait Deleter<T: ?Sized> {
    /// Destroy the object at `ptr`.
    ///
    /// # Safety
    /// `ptr` must be the pointer this deleter was registered with, and the
    /// object must not be used afterwards.
    unsafe fn delete(self, ptr: NonNull<T>);
}

/// Ordinary single-object destruction: the pointer came from
/// [`Box::into_raw`], and is freed the same way. This works for unsized
/// objects too, e.g. a `Box<[T]>` array.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DefaultDelete;

impl<T: ?Sized> Deleter<T> for DefaultDelete {
    unsafe fn delete(self, ptr: NonNull<T>) {
        drop(Box::from_raw(ptr.as_ptr()));
    }
}

/// Does nothing. For objects owned by someone else that must simply outlive
/// every handle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoopDelete;

impl<T: ?Sized> Deleter<T> for NoopDelete {
    unsafe fn delete(self, _ptr: NonNull<T>) {}
}

/// Runs the object's destructor in place without freeing its memory, e.g.
/// for objects living in an arena that is released wholesale.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DropInPlace;

impl<T: ?Sized> Deleter<T> for DropInPlace {
    unsafe fn delete(self, ptr: NonNull<T>) {
        ptr::drop_in_place(ptr.as_ptr());
    }
}

impl<T: ?Sized, F: FnOnce(NonNull<T>)> Deleter<T> for F {
    unsafe fn delete(self, ptr: NonNull<T>) {
        self(ptr)
    }
}
