//! The control block shared by every handle aliasing one managed object.
//!
//! A block holds the shared and weak counts plus two type-erased routines:
//! one destroys the managed object (the deleter), the other frees the block's
//! own allocation. The block header always sits at offset 0 of a `#[repr(C)]`
//! allocation, so the routines can cast the header pointer back to the
//! concrete layout they were instantiated for.
//!
//! Two layouts exist:
//!
//! * `InlineBlock<T, C>` stores the value right after the header. This is the
//!   combined ("make-shared") allocation used by [`GenShared::new`].
//! * `OutOfLineBlock<T, D, C>` stores a pointer to an object allocated
//!   elsewhere together with the deleter `D` that knows how to destroy it.
//!
//! [`GenShared::new`]: crate::GenShared::new
use alloc::alloc::{alloc, dealloc, Layout};
use core::{
    fmt,
    mem::{ManuallyDrop, MaybeUninit},
    ptr::{self, NonNull},
};

use log::trace;

use crate::deleter::Deleter;

/// Trait to distinguish [`SharedPtr<T>`][crate::SharedPtr] from
/// [`LocalPtr<T>`][crate::LocalPtr]. The only implementers are
/// [`Atomic`][crate::Atomic] and [`Nonatomic`][crate::Nonatomic].
///
/// It is `pub` so you can write code that's generic over the counter flavour,
/// but there's no reason to implement it for any other types.
///
/// # Safety
/// Trait is sealed.
pub unsafe trait Counter: private::Sealed {
    #[doc(hidden)]
    fn new(v: usize) -> Self;
    #[doc(hidden)]
    fn get(&self) -> usize;
    #[doc(hidden)]
    fn inc_relaxed(&self) -> usize;
    #[doc(hidden)]
    fn inc_if_nonzero(&self) -> bool;
    #[doc(hidden)]
    fn set_release(&self, value: usize);
    /// Decrement unless already zero. Returns the previous value.
    #[doc(hidden)]
    fn dec(&self) -> usize;
    #[doc(hidden)]
    fn acquire_fence(&self);
}

/// Objects a counter flavour may keep alive behind a handle of some other
/// type.
///
/// [`GenShared::project`] hands out a `GenShared<U, C>` whose control block
/// still destroys the original `T`, so whatever lets the new handle cross
/// threads must already hold for `T`. For [`Atomic`][crate::Atomic] that means
/// `T: Send + Sync`; [`Nonatomic`][crate::Nonatomic] handles never leave their
/// thread, so any `T` qualifies.
///
/// [`GenShared::project`]: crate::GenShared::project
pub trait Manages<T: ?Sized>: Counter + private::SealedFor<T> {}

/// Counts above this abort the process rather than risk wrapping around.
pub(crate) const MAX_COUNT: usize = isize::MAX as usize;

/// Aborts: a count passed [`MAX_COUNT`], which only leaked handles can do.
#[cold]
#[inline(never)]
pub(crate) fn count_overflow() -> ! {
    // panicking while already unwinding aborts, even without `std`
    struct Abort;
    impl Drop for Abort {
        fn drop(&mut self) {
            panic!("reference count overflow");
        }
    }
    let _abort = Abort;
    panic!("reference count overflow");
}

/// Counts, managed object address and destructors for one managed object.
///
/// Handles only ever give out shared references to a block; the counters are
/// mutated through interior mutability.
pub struct ControlBlock<C> {
    shared: C,
    // Number of weak observers, plus one implicit reference held collectively
    // by the owners while `shared > 0`.
    weak: C,
    object: NonNull<()>,
    drop_value: unsafe fn(NonNull<ControlBlock<C>>),
    drop_block: unsafe fn(NonNull<ControlBlock<C>>),
}

#[repr(C)]
struct InlineBlock<T, C> {
    header: ControlBlock<C>,
    value: MaybeUninit<T>,
}

#[repr(C)]
struct OutOfLineBlock<T: ?Sized, D, C> {
    header: ControlBlock<C>,
    ptr: NonNull<T>,
    deleter: ManuallyDrop<D>,
}

/// A freshly allocated block together with the object pointer it manages.
pub(crate) struct Allocation<T: ?Sized, C> {
    pub(crate) block: NonNull<ControlBlock<C>>,
    pub(crate) ptr: NonNull<T>,
}

impl<C: Counter> ControlBlock<C> {
    pub(crate) fn new(
        initial_shared: usize,
        object: NonNull<()>,
        drop_value: unsafe fn(NonNull<ControlBlock<C>>),
        drop_block: unsafe fn(NonNull<ControlBlock<C>>),
    ) -> Self {
        ControlBlock {
            shared: C::new(initial_shared),
            weak: C::new(1),
            object,
            drop_value,
            drop_block,
        }
    }

    /// Allocates a combined block with room for a `T` right after the header.
    ///
    /// The value slot is left uninitialized; the caller must write it before
    /// the shared count can reach zero.
    pub(crate) fn inline<T>(initial_shared: usize) -> Result<Allocation<T, C>, Layout> {
        let b = allocate::<InlineBlock<T, C>>()?;
        // Safety: `b` is valid for writes and properly aligned.
        let v = unsafe { ptr::addr_of_mut!((*b.as_ptr()).value) as *mut T };
        // Safety: derived from a non-null allocation.
        let v = unsafe { NonNull::new_unchecked(v) };
        let header = ControlBlock::new(
            initial_shared,
            v.cast(),
            drop_inline_value::<T, C>,
            drop_inline_block::<T, C>,
        );
        // Safety: as above; the header field is written exactly once.
        unsafe { ptr::addr_of_mut!((*b.as_ptr()).header).write(header) };
        trace!("allocated inline control block {:p}", b);
        Ok(Allocation {
            block: b.cast(),
            ptr: v,
        })
    }

    /// Allocates a block managing `ptr`, destroyed by `deleter`.
    ///
    /// On failure the deleter is handed back unused so the caller can decide
    /// what to do with `ptr`.
    ///
    /// # Safety
    /// `deleter` must be safe to call on `ptr` once the shared count reaches
    /// zero, and `ptr` must stay valid until then.
    pub(crate) unsafe fn out_of_line<T: ?Sized, D>(
        ptr: NonNull<T>,
        deleter: D,
    ) -> Result<NonNull<Self>, (Layout, D)>
    where
        D: Deleter<T>,
    {
        let b = match allocate::<OutOfLineBlock<T, D, C>>() {
            Ok(b) => b,
            Err(layout) => return Err((layout, deleter)),
        };
        b.as_ptr().write(OutOfLineBlock {
            header: ControlBlock::new(
                1,
                ptr.cast(),
                drop_out_of_line_value::<T, D, C>,
                drop_out_of_line_block::<T, D, C>,
            ),
            ptr,
            deleter: ManuallyDrop::new(deleter),
        });
        trace!("allocated control block {:p} for {:p}", b, ptr);
        Ok(b.cast())
    }

    /// Adds an owner. Returns the previous shared count.
    pub(crate) fn increment_shared(&self) -> usize {
        self.shared.inc_relaxed()
    }

    /// Removes an owner. A zero count is left alone. Returns the previous
    /// shared count, so `1` means this call released the last owner.
    pub(crate) fn decrement_shared(&self) -> usize {
        self.shared.dec()
    }

    /// Adds an owner only if at least one owner is still alive.
    pub(crate) fn increment_shared_if_live(&self) -> bool {
        self.shared.inc_if_nonzero()
    }

    /// Publishes the first owner of a block created with a zero shared count.
    pub(crate) fn activate(&self) {
        debug_assert_eq!(self.shared.get(), 0, "block already has owners");
        self.shared.set_release(1);
    }

    pub(crate) fn increment_weak(&self) -> usize {
        self.weak.inc_relaxed()
    }

    pub(crate) fn decrement_weak(&self) -> usize {
        self.weak.dec()
    }

    /// Current number of owning handles. This is a snapshot: other threads
    /// may change it before the caller looks at the result.
    pub fn shared_count(&self) -> usize {
        self.shared.get()
    }

    /// Current number of weak observers, also a snapshot.
    pub fn weak_count(&self) -> usize {
        let weak = self.weak.get();
        if self.shared.get() == 0 {
            weak
        } else {
            // hide the implicit reference held by the owners
            weak.saturating_sub(1)
        }
    }

    /// True if exactly one owner and no weak observers exist. Callers must
    /// hold that owner exclusively for the answer to stay true.
    pub(crate) fn is_unique(&self) -> bool {
        let unique = self.shared.get() == 1 && self.weak.get() == 1;
        if unique {
            // synchronize with the Release decrements of former owners
            self.shared.acquire_fence();
        }
        unique
    }

    /// Address of the object this block was created for.
    pub(crate) fn object(&self) -> NonNull<()> {
        self.object
    }

    /// Runs the stored deleter on the managed object.
    ///
    /// # Safety
    /// Must be called at most once per block, and only after the shared count
    /// has reached zero.
    pub(crate) unsafe fn invoke_deleter(this: NonNull<Self>) {
        let f = this.as_ref().drop_value;
        f(this)
    }

    /// Drops one owning reference, destroying the object if it was the last.
    ///
    /// # Safety
    /// The caller must own one shared reference on `this` and give it up.
    pub(crate) unsafe fn release_shared(this: NonNull<Self>) {
        let block = this.as_ref();
        if block.decrement_shared() != 1 {
            return;
        }
        // last owner was just dropped
        block.shared.acquire_fence();
        trace!("control block {:p}: last owner released", this);

        // Drop the weak reference owned collectively by the owners once the
        // deleter is done, even if it panics.
        let _weak = WeakGuard(this);
        Self::invoke_deleter(this);
    }

    /// Drops one weak reference, freeing the block if it was the last.
    ///
    /// # Safety
    /// The caller must own one weak reference on `this` and give it up.
    pub(crate) unsafe fn release_weak(this: NonNull<Self>) {
        let block = this.as_ref();
        if block.decrement_weak() != 1 {
            return;
        }
        // Make sure freeing the block happens-after the deleter ran on
        // whichever thread released the last owner.
        block.weak.acquire_fence();
        let f = block.drop_block;
        trace!("control block {:p} freed", this);
        f(this)
    }
}

// Owns one weak reference and gives it up when dropped.
struct WeakGuard<C: Counter>(NonNull<ControlBlock<C>>);

impl<C: Counter> Drop for WeakGuard<C> {
    fn drop(&mut self) {
        // Safety: the guard was created from a weak reference its creator
        // owned and handed over.
        unsafe { ControlBlock::release_weak(self.0) }
    }
}

impl<C: Counter> fmt::Debug for ControlBlock<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlBlock")
            .field("shared", &self.shared_count())
            .field("weak", &self.weak_count())
            .field("object", &self.object)
            .finish()
    }
}

fn allocate<B>() -> Result<NonNull<B>, Layout> {
    let layout = Layout::new::<B>();
    // Safety: every block starts with a header, so the layout is never
    // zero-sized.
    let raw = unsafe { alloc(layout) } as *mut B;
    NonNull::new(raw).ok_or(layout)
}

unsafe fn drop_inline_value<T, C>(ptr: NonNull<ControlBlock<C>>) {
    let b = ptr.cast::<InlineBlock<T, C>>().as_ptr();
    let value = &mut *ptr::addr_of_mut!((*b).value);
    value.assume_init_drop();
}

unsafe fn drop_inline_block<T, C>(ptr: NonNull<ControlBlock<C>>) {
    dealloc(ptr.as_ptr() as *mut u8, Layout::new::<InlineBlock<T, C>>());
}

unsafe fn drop_out_of_line_value<T: ?Sized, D: Deleter<T>, C>(ptr: NonNull<ControlBlock<C>>) {
    let b = ptr.cast::<OutOfLineBlock<T, D, C>>().as_ptr();
    let deleter = ManuallyDrop::take(&mut *ptr::addr_of_mut!((*b).deleter));
    deleter.delete((*b).ptr);
}

unsafe fn drop_out_of_line_block<T: ?Sized, D, C>(ptr: NonNull<ControlBlock<C>>) {
    // the deleter was consumed by `drop_out_of_line_value`
    dealloc(
        ptr.as_ptr() as *mut u8,
        Layout::new::<OutOfLineBlock<T, D, C>>(),
    );
}

pub(crate) mod private {
    pub trait Sealed {}
    pub trait SealedFor<T: ?Sized> {}
}
