/*!
This crate provides [`SharedPtr<T>`], a reference-counted pointer in the
style of C++'s [`shared_ptr`](https://en.cppreference.com/w/cpp/memory/shared_ptr):
the counts and the destruction routine for the managed object live in a
separately allocated control block, so a handle can adopt objects that were
allocated anywhere, with any deleter.

```rust
    use sharedptr::{make_shared, SharedPtr};

    let a = SharedPtr::from_box(Box::new(42));
    assert_eq!(SharedPtr::use_count(&a), 1);

    let b = a.clone();
    assert_eq!(SharedPtr::use_count(&b), 2);

    drop(a);
    assert_eq!(*b, 42);

    // the object and its control block in a single allocation
    let c = make_shared((42, 'z', true));
    assert_eq!(c.1, 'z');
```

# Empty handles

Unlike `std::sync::Arc`, a handle can be empty. Empty handles own no control
block, so [`use_count`][GenShared::use_count] is 0 for them. Dereferencing an
empty handle panics; use [`get`][GenShared::get] to check first.

```
    use sharedptr::SharedPtr;

    let mut a = SharedPtr::new(String::from("payload"));
    let b = SharedPtr::take(&mut a);

    assert!(SharedPtr::is_null(&a));
    assert_eq!(SharedPtr::get(&a), None);
    assert_eq!(SharedPtr::use_count(&a), 0);
    assert_eq!(SharedPtr::use_count(&b), 1);
```

# Deleters

Raw pointers are adopted through `unsafe` constructors, with an optional
[`Deleter`] deciding how the object dies once the last owner is released.
The deleter is stored in the control block, so every handle sharing the block
agrees on it.

```
    use sharedptr::{NoopDelete, SharedPtr};

    let mut config = [1u8, 2, 3, 4];
    {
        // nothing to free: the object outlives every handle
        let p: SharedPtr<[u8]> =
            unsafe { SharedPtr::from_raw_with(&mut config[..] as *mut [u8], NoopDelete) };
        assert_eq!(p[2], 3);
    }
    config[0] = 0;
```

# Projection

If you have a `SharedPtr<T>`, and `T` contains some subobject of type `U`, then
you can construct a `SharedPtr<U>` that shares ownership with the original
object by calling [`project`][GenShared::project]. This is the aliasing
constructor of C++'s `shared_ptr`.

```
    use sharedptr::SharedPtr;
    let a: SharedPtr<[i32; 3]> = SharedPtr::new([1, 2, 3]);

    // convert the sized array into a slice
    let b: SharedPtr<[i32]> = SharedPtr::project(a, |x| &x[..]);

    // get a reference to one element of the array
    let c: SharedPtr<i32> = SharedPtr::project(b, |x| &x[1]);
    assert_eq!(*c, 2);
```

# Weak pointers

[`WeakPtr<T>`] observes a control block without keeping the object alive.
Upgrading succeeds only while some owner remains.

```
    use sharedptr::SharedPtr;

    let a = SharedPtr::new(5);
    let w = SharedPtr::downgrade(&a);
    assert_eq!(*w.upgrade().unwrap(), 5);

    drop(a);
    assert!(w.upgrade().is_none());
```

# Notes

`SharedPtr<T>` (atomic counts) and [`LocalPtr<T>`] (`Cell` counts, not
`Send`) share a single generic implementation, [`GenShared<T, C>`]. This does
make the documentation a little uglier, since it's all on struct `GenShared`
instead of the actual types you normally care about.

The constructors that allocate abort through
[`handle_alloc_error`][alloc::alloc::handle_alloc_error] when memory runs out,
like `Box`. `try_new`, `try_from_box` and `try_from_raw_with` return
[`Error`] instead.

There is no cycle collection: a cycle of owning handles leaks. Break cycles
with [`WeakPtr`].
*/
#![no_std]
#[cfg(test)]
extern crate std;

extern crate alloc;

pub mod control;
pub mod deleter;
mod error;
pub mod local;
pub mod shared;
pub mod sync;

pub use self::control::{ControlBlock, Counter, Manages};
pub use self::deleter::{DefaultDelete, Deleter, DropInPlace, NoopDelete};
pub use self::error::Error;
pub use self::local::{LocalPtr, LocalWeakPtr, Nonatomic};
pub use self::shared::{GenShared, GenWeak};
pub use self::sync::{make_shared, try_make_shared, Atomic, SharedPtr, WeakPtr};
