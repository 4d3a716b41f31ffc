//! `sharedptr::local::LocalPtr<T>` is very similar to
//! `sharedptr::sync::SharedPtr<T>`, but with nonatomic counts for
//! single-threaded use.
//!
//! See [`GenShared`] for the detailed API, as it's the same as
//! `sharedptr::sync::SharedPtr<T>`.
//!
//! ## See also
//!
//! `sharedptr::sync::SharedPtr<T>` in this crate is the atomic version for
//! sharing data across threads.
use core::cell::Cell;

use crate::{
    control::{count_overflow, private, Counter, Manages, MAX_COUNT},
    shared::{GenShared, GenWeak},
};

/// Plain `Cell` counts, selecting the single-threaded flavour of
/// [`GenShared`].
pub struct Nonatomic(Cell<usize>);

impl private::Sealed for Nonatomic {}

unsafe impl Counter for Nonatomic {
    fn new(v: usize) -> Self {
        Nonatomic(Cell::new(v))
    }

    fn get(&self) -> usize {
        self.0.get()
    }

    fn inc_relaxed(&self) -> usize {
        let i = self.0.get();
        if i >= MAX_COUNT {
            count_overflow();
        }
        self.0.set(i + 1);
        i
    }

    fn inc_if_nonzero(&self) -> bool {
        let i = self.0.get();
        if i >= MAX_COUNT {
            count_overflow();
        }
        if i != 0 {
            self.0.set(i + 1);
            true
        } else {
            false
        }
    }

    fn set_release(&self, value: usize) {
        self.0.set(value);
    }

    fn dec(&self) -> usize {
        let i = self.0.get();
        if i != 0 {
            self.0.set(i - 1);
        }
        i
    }

    fn acquire_fence(&self) {}
}

// `LocalPtr` is never `Send`, so it can keep any object alive.
impl<T: ?Sized> private::SealedFor<T> for Nonatomic {}
impl<T: ?Sized> Manages<T> for Nonatomic {}

pub type LocalPtr<T> = GenShared<T, Nonatomic>;
pub type LocalWeakPtr<T> = GenWeak<T, Nonatomic>;
