//! `sharedptr::sync::SharedPtr<T>` is the thread-safe shared pointer, with
//! atomic reference counts in a separately allocated control block.
//!
//! See [`GenShared`] for the detailed API, as it's shared with
//! `sharedptr::local::LocalPtr<T>`.
//!
//! ## See also
//!
//! `sharedptr::local::LocalPtr<T>` in this crate is the nonatomic version for
//! single-threaded use.
use core::sync::atomic::{
    AtomicUsize,
    Ordering::{Acquire, Relaxed, Release},
};

use crate::{
    control::{count_overflow, private, Counter, Manages, MAX_COUNT},
    error::Error,
    shared::{GenShared, GenWeak},
};

/// Atomic counts, selecting the thread-safe flavour of [`GenShared`].
pub struct Atomic(AtomicUsize);

impl private::Sealed for Atomic {}

unsafe impl Counter for Atomic {
    fn new(v: usize) -> Self {
        Atomic(AtomicUsize::new(v))
    }

    fn get(&self) -> usize {
        // relaxed ordering as this is only advisory
        self.0.load(Relaxed)
    }

    fn inc_relaxed(&self) -> usize {
        // New references can only be made from an existing one, which
        // already keeps the block alive, so no ordering is needed.
        let old = self.0.fetch_add(1, Relaxed);
        // Only leaked handles get here. Other threads may push the count a
        // little further before we abort, but never far enough to wrap.
        if old > MAX_COUNT {
            count_overflow();
        }
        old
    }

    fn inc_if_nonzero(&self) -> bool {
        // See std::sync::Weak::upgrade for explanation of atomic logic
        self.0
            .fetch_update(Acquire, Relaxed, |n| match n {
                0 => None,
                n if n > MAX_COUNT => count_overflow(),
                n => Some(n + 1),
            })
            .is_ok()
    }

    fn set_release(&self, value: usize) {
        self.0.store(value, Release)
    }

    fn dec(&self) -> usize {
        match self.0.fetch_update(Release, Relaxed, |n| n.checked_sub(1)) {
            Ok(n) | Err(n) => n,
        }
    }

    fn acquire_fence(&self) {
        // either `fence()` or `load()` would work here, and either may be more
        // performant depending on platform details.
        self.0.load(Acquire);
    }
}

pub type SharedPtr<T> = GenShared<T, Atomic>;
pub type WeakPtr<T> = GenWeak<T, Atomic>;

// The object may be dropped (and the deleter run) on whichever thread
// releases the last owner, so both `Send` and `Sync` are required of `T`.
unsafe impl<T: ?Sized + Sync + Send> Send for GenShared<T, Atomic> {}
unsafe impl<T: ?Sized + Sync + Send> Sync for GenShared<T, Atomic> {}
unsafe impl<T: ?Sized + Sync + Send> Send for GenWeak<T, Atomic> {}
unsafe impl<T: ?Sized + Sync + Send> Sync for GenWeak<T, Atomic> {}

// A projected handle is `Send` based on its own type alone, so the object it
// keeps alive has to qualify up front.
impl<T: ?Sized + Sync + Send> private::SealedFor<T> for Atomic {}
impl<T: ?Sized + Sync + Send> Manages<T> for Atomic {}

/// Constructs `value` and its control block in one allocation.
pub fn make_shared<T>(value: T) -> SharedPtr<T> {
    SharedPtr::new(value)
}

/// Fallible version of [`make_shared`].
pub fn try_make_shared<T>(value: T) -> Result<SharedPtr<T>, Error> {
    SharedPtr::try_new(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        deleter::{DropInPlace, NoopDelete},
        test_util::init_logging,
    };
    use bumpalo::Bump;
    use core::ptr::NonNull;
    use std::{
        boxed::Box,
        env, format,
        process::Command,
        string::String,
        sync::{atomic::Ordering::SeqCst, Arc},
        thread,
        vec::Vec,
    };

    const VALUE: i32 = 42;

    fn counts<T: ?Sized>(x: &SharedPtr<T>) -> (usize, usize) {
        (SharedPtr::use_count(x), SharedPtr::weak_count(x))
    }
    fn wcounts<T: ?Sized>(x: &WeakPtr<T>) -> (usize, usize) {
        (WeakPtr::strong_count(x), WeakPtr::weak_count(x))
    }

    // Counts drops through a shared tally, so it can cross threads and be
    // owned by `'static` deleters.
    struct Tracked<T>(T, Arc<AtomicUsize>);
    impl<T> Drop for Tracked<T> {
        fn drop(&mut self) {
            self.1.fetch_add(1, SeqCst);
        }
    }

    fn counting_deleter<T>(fired: &Arc<AtomicUsize>) -> impl FnOnce(NonNull<T>) + Send + 'static
    where
        T: 'static,
    {
        let fired = fired.clone();
        move |p: NonNull<T>| {
            fired.fetch_add(1, SeqCst);
            drop(unsafe { Box::from_raw(p.as_ptr()) });
        }
    }

    fn fixture() -> SharedPtr<i32> {
        SharedPtr::from_box(Box::new(VALUE))
    }

    struct Example {
        val: i32,
        sign: char,
        flag: bool,
    }

    impl Example {
        fn new(val: i32, sign: char, flag: bool) -> Self {
            Example { val, sign, flag }
        }
    }

    #[test]
    fn test_default_is_null() {
        let p: SharedPtr<i32> = SharedPtr::default();
        assert!(SharedPtr::is_null(&p));
        assert_eq!(SharedPtr::get(&p), None);
        assert_eq!(SharedPtr::as_ptr(&p), None);
        assert_eq!(SharedPtr::use_count(&p), 0);
        assert!(SharedPtr::control_block(&p).is_none());
    }

    #[test]
    fn test_from_box() {
        let p = SharedPtr::from_box(Box::new(VALUE));
        assert!(!SharedPtr::is_null(&p));
        assert_eq!(*p, VALUE);
        assert_eq!(SharedPtr::use_count(&p), 1);
    }

    #[test]
    fn test_from_null_raw() {
        let fired = Arc::new(AtomicUsize::new(0));
        let p: SharedPtr<i32> =
            unsafe { SharedPtr::from_raw_with(core::ptr::null_mut(), counting_deleter(&fired)) };
        assert!(SharedPtr::is_null(&p));
        assert_eq!(SharedPtr::use_count(&p), 0);
        let q = p.clone();
        assert!(SharedPtr::is_null(&q));
        drop(p);
        drop(q);
        assert_eq!(fired.load(SeqCst), 0);
    }

    #[test]
    fn test_clone() {
        let orig = fixture();
        assert_eq!(SharedPtr::use_count(&orig), 1);

        let p = orig.clone();
        assert_eq!(*p, *orig);
        assert!(SharedPtr::ptr_eq(&p, &orig));
        assert!(SharedPtr::owner_eq(&p, &orig));
        assert_eq!(SharedPtr::use_count(&p), 2);
        assert_eq!(SharedPtr::use_count(&orig), 2);
    }

    #[test]
    fn test_take_empties_source() {
        let mut orig = fixture();
        let addr = SharedPtr::as_ptr(&orig);

        let p = SharedPtr::take(&mut orig);
        assert_eq!(*p, VALUE);
        assert_eq!(SharedPtr::as_ptr(&p), addr);
        assert_eq!(SharedPtr::use_count(&p), 1);
        assert!(SharedPtr::is_null(&orig));
        assert_eq!(SharedPtr::get(&orig), None);
        assert_eq!(SharedPtr::use_count(&orig), 0);
    }

    #[test]
    fn test_move_assign() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut a = unsafe {
            SharedPtr::from_raw_with(Box::into_raw(Box::new(1)), counting_deleter(&fired))
        };
        let mut b = fixture();
        a = SharedPtr::take(&mut b);
        // old object of `a` went through its own deleter
        assert_eq!(fired.load(SeqCst), 1);
        assert_eq!(*a, VALUE);
        assert_eq!(SharedPtr::use_count(&a), 1);
        assert!(SharedPtr::is_null(&b));
    }

    #[test]
    fn test_copy_assign() {
        let mut orig = fixture();
        let p = SharedPtr::from_box(Box::new(VALUE * VALUE));
        assert_eq!(SharedPtr::use_count(&p), 1);

        orig.clone_from(&p);
        let other = orig.clone();
        assert_eq!(*other, VALUE * VALUE);
        assert_eq!(SharedPtr::use_count(&other), 3);
        assert_eq!(SharedPtr::use_count(&p), 3);
    }

    #[test]
    fn test_copy_assign_releases_old() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut a = unsafe {
            SharedPtr::from_raw_with(Box::into_raw(Box::new(1)), counting_deleter(&fired))
        };
        let b = fixture();
        a.clone_from(&b);
        assert_eq!(fired.load(SeqCst), 1);
        assert_eq!(*a, VALUE);
    }

    #[test]
    fn test_self_assign() {
        let mut a = fixture();
        let alias = a.clone();
        let addr = SharedPtr::as_ptr(&a);

        a.clone_from(&alias);
        assert_eq!(SharedPtr::as_ptr(&a), addr);
        assert_eq!(SharedPtr::use_count(&a), 2);

        a = SharedPtr::take(&mut a);
        assert_eq!(SharedPtr::as_ptr(&a), addr);
        assert_eq!(SharedPtr::use_count(&a), 2);

        let mut empty: SharedPtr<i32> = SharedPtr::null();
        let other_empty = SharedPtr::null();
        empty.clone_from(&other_empty);
        assert!(SharedPtr::is_null(&empty));
    }

    #[test]
    fn test_swap() {
        let mut orig = fixture();
        let mut p = SharedPtr::from_box(Box::new(-VALUE));
        let alias = p.clone();
        let (orig_addr, p_addr) = (SharedPtr::as_ptr(&orig), SharedPtr::as_ptr(&p));

        SharedPtr::swap(&mut p, &mut orig);
        assert_eq!(*orig, -VALUE);
        assert_eq!(*p, VALUE);
        assert_eq!(SharedPtr::as_ptr(&orig), p_addr);
        assert_eq!(SharedPtr::as_ptr(&p), orig_addr);
        assert_eq!(SharedPtr::use_count(&orig), 2);
        assert_eq!(SharedPtr::use_count(&p), 1);
        assert!(SharedPtr::owner_eq(&orig, &alias));
    }

    #[test]
    fn test_reset_to_value() {
        let mut orig = fixture();
        let p = orig.clone();
        assert_eq!(SharedPtr::use_count(&orig), 2);

        SharedPtr::reset_to(&mut orig, Box::new(-VALUE));
        assert_eq!(*orig, -VALUE);
        assert_eq!(SharedPtr::use_count(&orig), 1);
        assert_eq!(SharedPtr::use_count(&p), 1);
        assert_eq!(*p, VALUE);
    }

    #[test]
    fn test_reset_to_null() {
        let mut orig = fixture();
        assert_eq!(SharedPtr::use_count(&orig), 1);

        SharedPtr::reset(&mut orig);
        assert!(SharedPtr::is_null(&orig));
        assert_eq!(SharedPtr::get(&orig), None);
        assert_eq!(SharedPtr::use_count(&orig), 0);
    }

    #[test]
    fn test_reset_fires_old_deleter_first() {
        init_logging();
        let old = Arc::new(AtomicUsize::new(0));
        let new = Arc::new(AtomicUsize::new(0));
        let mut a = unsafe {
            SharedPtr::from_raw_with(Box::into_raw(Box::new(1)), counting_deleter(&old))
        };
        let raw = Box::into_raw(Box::new(2));
        unsafe { SharedPtr::reset_raw_with(&mut a, raw, counting_deleter(&new)) };
        assert_eq!(old.load(SeqCst), 1);
        assert_eq!(new.load(SeqCst), 0);
        assert_eq!(SharedPtr::as_ptr(&a), NonNull::new(raw));
        assert_eq!(SharedPtr::use_count(&a), 1);

        unsafe { SharedPtr::reset_raw(&mut a, Box::into_raw(Box::new(3))) };
        assert_eq!(new.load(SeqCst), 1);
        assert_eq!(*a, 3);
    }

    #[test]
    fn test_make_shared_trivial() {
        let p = make_shared(VALUE);
        assert!(!SharedPtr::is_null(&p));
        assert_eq!(*p, VALUE);
        assert_eq!(SharedPtr::use_count(&p), 1);
    }

    #[test]
    fn test_make_shared_custom() {
        let p = make_shared(Example::new(VALUE, 'z', true));
        assert_eq!(SharedPtr::use_count(&p), 1);
        assert_eq!(p.val, VALUE);
        assert_eq!(p.sign, 'z');
        assert!(p.flag);
    }

    #[test]
    fn test_try_make_shared() {
        let p = try_make_shared(Example::new(1, 'a', false)).unwrap();
        assert_eq!(p.val, 1);
        let q = SharedPtr::try_from_box(Box::new(5)).unwrap();
        assert_eq!(*q, 5);
    }

    #[test]
    fn test_lifecycle() {
        init_logging();
        let fired = Arc::new(AtomicUsize::new(0));
        let a = unsafe {
            SharedPtr::from_raw_with(Box::into_raw(Box::new(VALUE)), counting_deleter(&fired))
        };
        assert_eq!(SharedPtr::use_count(&a), 1);
        assert_eq!(*a, VALUE);

        let b = a.clone();
        assert_eq!(SharedPtr::use_count(&a), 2);
        assert_eq!(SharedPtr::use_count(&b), 2);

        drop(a);
        assert_eq!(SharedPtr::use_count(&b), 1);
        assert_eq!(*b, VALUE);
        assert_eq!(fired.load(SeqCst), 0);

        drop(b);
        assert_eq!(fired.load(SeqCst), 1);
    }

    #[test]
    fn test_external_object() {
        let mut x = 7;
        {
            let p = unsafe { SharedPtr::from_raw_with(&mut x as *mut i32, NoopDelete) };
            let q = p.clone();
            assert_eq!(*q, 7);
        }
        x += 1;
        assert_eq!(x, 8);
    }

    #[test]
    fn test_arena_objects() {
        let tally = Arc::new(AtomicUsize::new(0));
        let bump = Bump::new();
        {
            let obj = bump.alloc(Tracked(VALUE, tally.clone()));
            let p = unsafe { SharedPtr::from_raw_with(obj as *mut Tracked<i32>, DropInPlace) };
            let q = p.clone();
            drop(p);
            assert_eq!(tally.load(SeqCst), 0);
            assert_eq!(q.0, VALUE);
        }
        // destructor ran, memory still belongs to the arena
        assert_eq!(tally.load(SeqCst), 1);
        drop(bump);
        assert_eq!(tally.load(SeqCst), 1);
    }

    #[test]
    fn test_slice() {
        let p: SharedPtr<[i32]> = SharedPtr::from_box(Box::from([1, 2, 3]));
        assert_eq!(&*p, &[1, 2, 3]);
        let q: SharedPtr<[i32]> = (4..7).collect();
        assert_eq!(format!("{:?}", q), "[4, 5, 6]");
    }

    #[test]
    fn test_weak() {
        let x = SharedPtr::new(2);
        let y = SharedPtr::downgrade(&x);
        assert_eq!(wcounts(&y), (1, 1));
        assert_eq!(counts(&x), (1, 1));

        let z = y.upgrade().unwrap();
        assert_eq!(counts(&z), (2, 1));
        drop(z);
        drop(x);
        assert!(y.is_dangling());
        assert!(y.upgrade().is_none());
        assert_eq!(wcounts(&y), (0, 0));
        drop(y);

        let empty: WeakPtr<i32> = WeakPtr::new();
        assert!(empty.upgrade().is_none());
        let w = SharedPtr::downgrade(&SharedPtr::<i32>::null());
        assert!(w.is_dangling());
    }

    #[test]
    fn test_project() {
        let tally = Arc::new(AtomicUsize::new(0));
        {
            let x = SharedPtr::new(Tracked((1, 2), tally.clone()));
            let y = SharedPtr::project(x.clone(), |x| &x.0 .0);
            let z = SharedPtr::project(x.clone(), |x| &x.0 .1);
            assert_eq!(*y, 1);
            assert_eq!(*z, 2);
            assert_eq!(counts(&z), (3, 0));
            drop(x);
            drop(y);
            assert_eq!(counts(&z), (1, 0));
            assert_eq!(tally.load(SeqCst), 0);
            drop(z);
        }
        assert_eq!(tally.load(SeqCst), 1);
    }

    #[test]
    fn test_projected_handle_crosses_threads() {
        let tally = Arc::new(AtomicUsize::new(0));
        let x = SharedPtr::new(Tracked((3u32, 4u32), tally.clone()));
        let y: SharedPtr<u32> = SharedPtr::project(x, |x| &x.0 .1);
        let h = thread::spawn(move || {
            assert_eq!(*y, 4);
            drop(y);
        });
        h.join().unwrap();
        assert_eq!(tally.load(SeqCst), 1);
    }

    #[test]
    fn test_count_overflow_aborts() {
        const CHILD: &str = "SHAREDPTR_OVERFLOW_CHILD";
        if env::var_os(CHILD).is_some() {
            let c = Atomic::new(MAX_COUNT);
            c.inc_relaxed();
            c.inc_relaxed();
            unreachable!("count wrapped without aborting");
        }
        // Aborting takes the whole test binary down, so rerun just this test
        // in a child process.
        let out = Command::new(env::current_exe().unwrap())
            .args(["--exact", "sync::tests::test_count_overflow_aborts", "--nocapture"])
            .env(CHILD, "1")
            .output()
            .unwrap();
        assert!(!out.status.success());
        let stderr = String::from_utf8_lossy(&out.stderr);
        assert!(stderr.contains("reference count overflow"), "{stderr}");
        assert!(!stderr.contains("count wrapped"), "{stderr}");
    }

    #[test]
    fn test_trait_obj() {
        let x = SharedPtr::new(2);
        let d = SharedPtr::project(x.clone(), |p| p as &(dyn core::fmt::Debug + Send + Sync));
        assert_eq!(format!("{:?}", d), "2");
    }

    #[test]
    fn test_get_mut() {
        static FIXED: i32 = 10;

        let mut x = SharedPtr::new([1, 2, 3]);
        SharedPtr::get_mut(&mut x).unwrap()[0] = 5;
        assert_eq!(*x, [5, 2, 3]);

        let y = x.clone();
        assert!(SharedPtr::get_mut(&mut x).is_none());
        drop(y);

        let w = SharedPtr::downgrade(&x);
        assert!(SharedPtr::get_mut(&mut x).is_none());
        drop(w);

        let mut s = SharedPtr::project(x, |_| &FIXED);
        assert!(SharedPtr::get_mut(&mut s).is_none());

        let mut empty: SharedPtr<i32> = SharedPtr::null();
        assert!(SharedPtr::get_mut(&mut empty).is_none());
    }

    #[test]
    fn test_cyclic() {
        struct Cyclic(WeakPtr<Cyclic>);
        let x = SharedPtr::new_cyclic(|p| {
            assert!(p.upgrade().is_none());
            Cyclic(p.clone())
        });
        assert_eq!(SharedPtr::use_count(&x), 1);
        assert_eq!(SharedPtr::weak_count(&x), 1);
        assert!(SharedPtr::ptr_eq(&x.0.upgrade().unwrap(), &x));
    }

    #[test]
    fn test_concurrent_clone_drop() {
        init_logging();
        let tally = Arc::new(AtomicUsize::new(0));
        let p = make_shared(Tracked(VALUE, tally.clone()));

        thread::scope(|s| {
            for _ in 0..8 {
                let p = p.clone();
                s.spawn(move || {
                    let mut held = Vec::new();
                    for _ in 0..1000 {
                        held.push(p.clone());
                    }
                    assert!(SharedPtr::use_count(&p) > 1000);
                    for q in held.drain(..) {
                        assert_eq!(q.0, VALUE);
                    }
                });
            }
        });

        assert_eq!(SharedPtr::use_count(&p), 1);
        assert_eq!(tally.load(SeqCst), 0);
        drop(p);
        assert_eq!(tally.load(SeqCst), 1);
    }

    #[test]
    fn test_concurrent_last_release() {
        // every thread gets one owner; exactly one of them destroys
        for _ in 0..50 {
            let tally = Arc::new(AtomicUsize::new(0));
            let p = make_shared(Tracked((), tally.clone()));
            let owners: Vec<_> = (0..4).map(|_| p.clone()).collect();
            let w = SharedPtr::downgrade(&p);
            drop(p);
            thread::scope(|s| {
                for q in owners {
                    s.spawn(move || drop(q));
                }
            });
            assert_eq!(tally.load(SeqCst), 1);
            assert!(w.upgrade().is_none());
        }
    }

    #[test]
    fn test_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SharedPtr<i32>>();
        assert_send_sync::<WeakPtr<[u8]>>();
    }

    #[test]
    #[should_panic(expected = "empty shared pointer")]
    fn test_deref_empty() {
        let p: SharedPtr<i32> = SharedPtr::null();
        let _v: i32 = *p;
    }

    #[test]
    fn test_fmt() {
        let p = SharedPtr::new(3);
        assert_eq!(format!("{} {:?}", p, p), "3 3");
        let n: SharedPtr<i32> = SharedPtr::null();
        assert_eq!(format!("{} {:?}", n, n), "(null) (null)");
    }

    #[test]
    fn test_cmp() {
        let a = SharedPtr::new(1);
        let b = SharedPtr::new(2);
        assert!(a < b);
        assert_eq!(a, SharedPtr::new(1));
        assert!(SharedPtr::<i32>::null() < a);
    }
}
