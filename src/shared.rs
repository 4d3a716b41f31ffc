//! `GenShared<T, C>` implements `SharedPtr` and `LocalPtr` generically across
//! the count type (atomic vs. nonatomic).
//!
//! See crate docs for the detailed API.
//!
//! ## See also
//!
//! `sharedptr::sync::SharedPtr<T>` in this crate is the atomic version for
//! sharing data across threads.
//!
//! `sharedptr::local::LocalPtr<T>` in this crate is the nonatomic version for
//! single-threaded use.
use alloc::{
    alloc::{handle_alloc_error, Layout},
    boxed::Box,
};
use core::{
    borrow, cmp, fmt, hash,
    marker::PhantomData,
    mem,
    ops::Deref,
    ptr::NonNull,
};

use log::warn;

use crate::{
    control::{Allocation, ControlBlock, Counter, Manages},
    deleter::{DefaultDelete, Deleter},
    error::Error,
};

// The (block, object) pair of a non-empty handle. Keeping both in one
// `Option` means a handle is either fully linked or fully empty.
struct Raw<T: ?Sized, C> {
    block: NonNull<ControlBlock<C>>,
    ptr: NonNull<T>,
}

impl<T: ?Sized, C> Clone for Raw<T, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized, C> Copy for Raw<T, C> {}

impl<T: ?Sized, C: Counter> Raw<T, C> {
    fn block(&self) -> &ControlBlock<C> {
        // Safety: the block is kept alive by the shared or weak reference
        // the enclosing handle owns.
        unsafe { self.block.as_ref() }
    }
}

/// Generic implementation behind [`SharedPtr`][crate::SharedPtr] and
/// [`LocalPtr`][crate::LocalPtr].
///
/// A handle is either empty or owns one shared reference on a control block.
/// Empty handles own no block at all, so [`use_count`][GenShared::use_count]
/// is 0 for them.
pub struct GenShared<T: ?Sized, C: Counter> {
    raw: Option<Raw<T, C>>,
    phantom: PhantomData<T>,
}

/// Generic implementation behind `sync::WeakPtr` and `local::LocalWeakPtr`,
/// distinguished by `Counter`.
pub struct GenWeak<T: ?Sized, C: Counter> {
    raw: Option<Raw<T, C>>,
    phantom: PhantomData<T>,
}

impl<T, C: Counter> GenShared<T, C> {
    /// Constructs a new handle owning `value`, allocating the object and its
    /// control block together.
    pub fn new(value: T) -> Self {
        match Self::new_inline(value) {
            Ok(p) => p,
            Err(layout) => handle_alloc_error(layout),
        }
    }

    /// Like [`new`][GenShared::new], but reports allocation failure instead
    /// of aborting. `value` is dropped on failure.
    pub fn try_new(value: T) -> Result<Self, Error> {
        Self::new_inline(value).map_err(|layout| {
            let e = Error::combined(layout);
            warn!("{}", e);
            e
        })
    }

    fn new_inline(value: T) -> Result<Self, Layout> {
        let Allocation { block, ptr } = ControlBlock::<C>::inline::<T>(1)?;
        // Safety: `ptr` is the uninitialized value slot of the new block.
        unsafe { ptr.as_ptr().write(value) };
        Ok(Self::from_parts(block, ptr))
    }

    /// Constructs a new handle while giving you a weak pointer to the
    /// allocation, to allow you to construct a `T` which holds a weak pointer
    /// to itself.
    ///
    /// See `std::sync::Arc::new_cyclic` for more details.
    pub fn new_cyclic<F>(data_fn: F) -> Self
    where
        F: FnOnce(&GenWeak<T, C>) -> T,
    {
        // Construct the block in the "uninitialized" state with a single weak
        // reference. We don't set shared=1 yet so that if `f` panics, we don't
        // try to drop the uninitialized value.
        let Allocation { block, ptr } = match ControlBlock::<C>::inline::<T>(0) {
            Ok(a) => a,
            Err(layout) => handle_alloc_error(layout),
        };
        let weak = GenWeak {
            raw: Some(Raw { block, ptr }),
            phantom: PhantomData,
        };

        let value = data_fn(&weak);
        // Safety: we just allocated with the value slot uninitialized
        unsafe { ptr.as_ptr().write(value) };

        // Now that the value is initialized, the weak reference we hold
        // becomes the one owned collectively by the owners.
        // Safety: `weak` keeps the block alive.
        unsafe { block.as_ref() }.activate();
        mem::forget(weak);
        Self::from_parts(block, ptr)
    }
}

impl<T: ?Sized, C: Counter> GenShared<T, C> {
    /// An empty handle. It owns nothing and has no control block.
    pub const fn null() -> Self {
        GenShared {
            raw: None,
            phantom: PhantomData,
        }
    }

    fn from_parts(block: NonNull<ControlBlock<C>>, ptr: NonNull<T>) -> Self {
        GenShared {
            raw: Some(Raw { block, ptr }),
            phantom: PhantomData,
        }
    }

    /// Return a handle for a boxed value. This reuses the original box
    /// allocation rather than copying it, and only allocates the control
    /// block.
    pub fn from_box(value: Box<T>) -> Self {
        let ptr = NonNull::from(Box::leak(value));
        // Safety: the pointer came straight out of a box.
        unsafe { Self::adopt(ptr, DefaultDelete) }
    }

    /// Fallible version of [`from_box`][GenShared::from_box]. The box is
    /// dropped on failure.
    pub fn try_from_box(value: Box<T>) -> Result<Self, Error> {
        // Safety: the pointer came straight out of a box.
        unsafe { Self::try_from_raw_with(Box::into_raw(value), DefaultDelete) }
    }

    /// Takes ownership of a pointer produced by [`Box::into_raw`]. A null
    /// pointer gives an empty handle.
    ///
    /// # Safety
    /// `ptr` must be null or come from `Box::into_raw`, and nothing else may
    /// free it.
    pub unsafe fn from_raw(ptr: *mut T) -> Self {
        Self::from_raw_with(ptr, DefaultDelete)
    }

    /// Takes ownership of `ptr`, to be destroyed by `deleter` when the last
    /// owner is released. A null pointer gives an empty handle, and the
    /// deleter is dropped without being called.
    ///
    /// # Safety
    /// `ptr` must be null or valid for reads and writes until `deleter` runs
    /// (a unique handle hands out `&mut T` through `get_mut`), and calling
    /// `deleter` on it once must be sound.
    pub unsafe fn from_raw_with<D>(ptr: *mut T, deleter: D) -> Self
    where
        D: Deleter<T> + Send + 'static,
    {
        match NonNull::new(ptr) {
            Some(ptr) => Self::adopt(ptr, deleter),
            None => Self::null(),
        }
    }

    /// Fallible version of [`from_raw_with`][GenShared::from_raw_with]. If the
    /// control block cannot be allocated, `deleter` is called on `ptr` so the
    /// object does not leak.
    ///
    /// # Safety
    /// Same as `from_raw_with`.
    pub unsafe fn try_from_raw_with<D>(ptr: *mut T, deleter: D) -> Result<Self, Error>
    where
        D: Deleter<T> + Send + 'static,
    {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(Self::null());
        };
        match ControlBlock::<C>::out_of_line(ptr, deleter) {
            Ok(block) => Ok(Self::from_parts(block, ptr)),
            Err((layout, deleter)) => {
                let e = Error::control_block(layout);
                warn!("{}", e);
                deleter.delete(ptr);
                Err(e)
            }
        }
    }

    unsafe fn adopt<D>(ptr: NonNull<T>, deleter: D) -> Self
    where
        D: Deleter<T> + Send + 'static,
    {
        match ControlBlock::<C>::out_of_line(ptr, deleter) {
            Ok(block) => Self::from_parts(block, ptr),
            Err((layout, _)) => handle_alloc_error(layout),
        }
    }

    /// Returns a reference to the managed object, or `None` for an empty
    /// handle.
    pub fn get(this: &Self) -> Option<&T> {
        // Safety: the object lives as long as we hold a shared reference.
        this.raw.map(|raw| unsafe { raw.ptr.as_ref() })
    }

    /// Returns the managed pointer, or `None` for an empty handle.
    pub fn as_ptr(this: &Self) -> Option<NonNull<T>> {
        this.raw.map(|raw| raw.ptr)
    }

    /// True if the handle is empty.
    pub fn is_null(this: &Self) -> bool {
        this.raw.is_none()
    }

    /// Number of owning handles sharing this handle's control block, or 0 if
    /// the handle is empty. This is a snapshot: with `SharedPtr`, other
    /// threads may change it at any moment.
    pub fn use_count(this: &Self) -> usize {
        this.raw.map_or(0, |raw| raw.block().shared_count())
    }

    /// Number of weak observers of this handle's control block.
    pub fn weak_count(this: &Self) -> usize {
        this.raw.map_or(0, |raw| raw.block().weak_count())
    }

    /// The control block, if the handle is not empty.
    pub fn control_block(this: &Self) -> Option<&ControlBlock<C>> {
        this.raw.as_ref().map(Raw::block)
    }

    /// Returns true if two handles point to the same object. Two empty
    /// handles compare equal. Note that this is not the same as sharing a
    /// control block, see [`owner_eq`][GenShared::owner_eq].
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Self::as_ptr(this) == Self::as_ptr(other)
    }

    /// Returns true if two handles share the same control block, i.e. the
    /// same reference counts. They may point to different subobjects due to
    /// `project()`.
    pub fn owner_eq(this: &Self, other: &Self) -> bool {
        this.raw.map(|raw| raw.block) == other.raw.map(|raw| raw.block)
    }

    /// Moves the ownership out of `this`, leaving it empty. No count changes.
    pub fn take(this: &mut Self) -> Self {
        mem::replace(this, Self::null())
    }

    /// Releases the current ownership and leaves the handle empty.
    pub fn reset(this: &mut Self) {
        drop(Self::take(this));
    }

    /// Releases the current ownership, then adopts `value` as
    /// [`from_box`][GenShared::from_box] would.
    pub fn reset_to(this: &mut Self, value: Box<T>) {
        Self::reset(this);
        *this = Self::from_box(value);
    }

    /// Releases the current ownership, then adopts `ptr` with the default
    /// deleter.
    ///
    /// # Safety
    /// Same as [`from_raw`][GenShared::from_raw].
    pub unsafe fn reset_raw(this: &mut Self, ptr: *mut T) {
        Self::reset_raw_with(this, ptr, DefaultDelete)
    }

    /// Releases the current ownership, then adopts `ptr` with `deleter`.
    ///
    /// # Safety
    /// Same as [`from_raw_with`][GenShared::from_raw_with].
    pub unsafe fn reset_raw_with<D>(this: &mut Self, ptr: *mut T, deleter: D)
    where
        D: Deleter<T> + Send + 'static,
    {
        Self::reset(this);
        *this = Self::from_raw_with(ptr, deleter);
    }

    /// Exchanges the contents of two handles. No count changes.
    pub fn swap(this: &mut Self, other: &mut Self) {
        mem::swap(this, other);
    }

    /// Return a [`GenWeak`] observer of this object. Downgrading an empty
    /// handle gives an empty observer.
    pub fn downgrade(this: &Self) -> GenWeak<T, C> {
        if let Some(raw) = this.raw {
            raw.block().increment_weak();
        }
        GenWeak {
            raw: this.raw,
            phantom: PhantomData,
        }
    }

    /// Return a handle to any `U` reachable from `T`, e.g. a field, an element
    /// of a slice, or a `&dyn` view of the object. The new handle shares this
    /// handle's control block, so it keeps the whole object alive.
    ///
    /// Projecting an empty handle gives an empty handle.
    ///
    /// The result can travel wherever a `GenShared<U, C>` can, taking the
    /// original object with it, so `C` must be able to manage a `T` on its
    /// own. A [`SharedPtr`][crate::SharedPtr] to something that isn't
    /// `Send + Sync` can't be projected:
    ///
    /// ```compile_fail
    /// use sharedptr::SharedPtr;
    /// use std::rc::Rc;
    ///
    /// let p = SharedPtr::new((Rc::new(1), 7u32));
    /// let q: SharedPtr<u32> = SharedPtr::project(p, |x| &x.1);
    /// std::thread::spawn(move || drop(q));
    /// ```
    pub fn project<U: ?Sized, F: FnOnce(&T) -> &U>(this: Self, f: F) -> GenShared<U, C>
    where
        T: 'static,
        C: Manages<T>,
    {
        let Some(raw) = this.raw else {
            return GenShared::null();
        };
        // Safety: the object is alive while `this` is.
        let ptr = NonNull::from(f(unsafe { raw.ptr.as_ref() }));
        // Forget `this` so it doesn't adjust the refcount, since we moved it
        // into the result.
        mem::forget(this);
        GenShared::from_parts(raw.block, ptr)
    }

    /// Returns a mutable reference to the object if this is the only handle
    /// (owning or weak) to it, and it points at the object the control block
    /// manages rather than something projected elsewhere.
    pub fn get_mut(this: &mut Self) -> Option<&mut T> {
        let raw = this.raw?;
        let block = raw.block();
        if block.is_unique() && raw.ptr.cast::<()>() == block.object() {
            // Safety: no other handle can observe the object.
            Some(unsafe { &mut *raw.ptr.as_ptr() })
        } else {
            None
        }
    }
}

impl<T: ?Sized, C: Counter> GenWeak<T, C> {
    /// An observer of nothing; `upgrade` always fails.
    pub const fn new() -> Self {
        GenWeak {
            raw: None,
            phantom: PhantomData,
        }
    }

    /// Attempts to obtain a new owning handle. Fails once the last owner has
    /// been released.
    pub fn upgrade(&self) -> Option<GenShared<T, C>> {
        let raw = self.raw?;
        if raw.block().increment_shared_if_live() {
            Some(GenShared {
                raw: Some(raw),
                phantom: PhantomData,
            })
        } else {
            None
        }
    }

    // Get the current shared count of the observed block
    pub fn strong_count(&self) -> usize {
        self.raw.map_or(0, |raw| raw.block().shared_count())
    }

    // Get the current weak count. Like std, this reports 0 once no owners
    // remain.
    pub fn weak_count(&self) -> usize {
        match self.raw {
            Some(raw) if raw.block().shared_count() > 0 => raw.block().weak_count(),
            _ => 0,
        }
    }

    // Returns true if all owners have been dropped, so `upgrade` will return
    // None.
    pub fn is_dangling(&self) -> bool {
        self.strong_count() == 0
    }
}

impl<T: ?Sized, C: Counter> Clone for GenShared<T, C> {
    fn clone(&self) -> Self {
        if let Some(raw) = self.raw {
            raw.block().increment_shared();
        }
        GenShared {
            raw: self.raw,
            phantom: PhantomData,
        }
    }

    /// Copy assignment. Assigning a handle to itself (or to another handle
    /// with the same block and pointer) leaves the counts untouched.
    fn clone_from(&mut self, source: &Self) {
        if Self::owner_eq(self, source) && Self::ptr_eq(self, source) {
            return;
        }
        *self = source.clone();
    }
}

impl<T: ?Sized, C: Counter> Clone for GenWeak<T, C> {
    fn clone(&self) -> Self {
        if let Some(raw) = self.raw {
            raw.block().increment_weak();
        }
        GenWeak {
            raw: self.raw,
            phantom: PhantomData,
        }
    }
}

impl<T: ?Sized, C: Counter> Default for GenShared<T, C> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: ?Sized, C: Counter> Default for GenWeak<T, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized, C: Counter> Deref for GenShared<T, C> {
    type Target = T;

    /// # Panics
    /// Panics if the handle is empty.
    #[track_caller]
    fn deref(&self) -> &T {
        match Self::get(self) {
            Some(v) => v,
            None => empty_deref(),
        }
    }
}

#[cold]
#[track_caller]
fn empty_deref() -> ! {
    panic!("dereferenced an empty shared pointer")
}

impl<T: ?Sized, C: Counter> Drop for GenShared<T, C> {
    fn drop(&mut self) {
        if let Some(raw) = self.raw {
            // Safety: we own one shared reference and are giving it up.
            unsafe { ControlBlock::release_shared(raw.block) };
        }
    }
}

impl<T: ?Sized, C: Counter> Drop for GenWeak<T, C> {
    fn drop(&mut self) {
        if let Some(raw) = self.raw {
            // Safety: we own one weak reference and are giving it up.
            unsafe { ControlBlock::release_weak(raw.block) };
        }
    }
}

impl<T: ?Sized, C: Counter> AsRef<T> for GenShared<T, C> {
    fn as_ref(&self) -> &T {
        self
    }
}

impl<T: ?Sized, C: Counter> borrow::Borrow<T> for GenShared<T, C> {
    fn borrow(&self) -> &T {
        self
    }
}

impl<T, C: Counter> From<T> for GenShared<T, C> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T: ?Sized, C: Counter> From<Box<T>> for GenShared<T, C> {
    fn from(value: Box<T>) -> Self {
        Self::from_box(value)
    }
}

impl<T, C: Counter> FromIterator<T> for GenShared<[T], C> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::from_box(iter.into_iter().collect())
    }
}

impl<T: ?Sized + PartialEq, C: Counter> PartialEq for GenShared<T, C> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        Self::get(self) == Self::get(other)
    }
}

impl<T: ?Sized + Eq, C: Counter> Eq for GenShared<T, C> {}

impl<T: ?Sized + PartialOrd, C: Counter> PartialOrd for GenShared<T, C> {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Self::get(self).partial_cmp(&Self::get(other))
    }
}

impl<T: ?Sized + Ord, C: Counter> Ord for GenShared<T, C> {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        Self::get(self).cmp(&Self::get(other))
    }
}

impl<T: ?Sized + hash::Hash, C: Counter> hash::Hash for GenShared<T, C> {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        Self::get(self).hash(state)
    }
}

impl<T: ?Sized + fmt::Display, C: Counter> fmt::Display for GenShared<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Self::get(self) {
            Some(v) => fmt::Display::fmt(v, f),
            None => f.write_str("(null)"),
        }
    }
}

impl<T: ?Sized + fmt::Debug, C: Counter> fmt::Debug for GenShared<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Self::get(self) {
            Some(v) => fmt::Debug::fmt(v, f),
            None => f.write_str("(null)"),
        }
    }
}

impl<T: ?Sized, C: Counter> fmt::Pointer for GenShared<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Self::as_ptr(self) {
            Some(p) => fmt::Pointer::fmt(&p, f),
            None => fmt::Pointer::fmt(&core::ptr::null::<()>(), f),
        }
    }
}

impl<T: ?Sized, C: Counter> fmt::Debug for GenWeak<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(Weak)")
    }
}
