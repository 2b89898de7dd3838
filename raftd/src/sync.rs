//! Mutually exclusive cells
//!
//! Every piece of state shared between timer callbacks and connection
//! tasks lives in a [`Synchronized`]. Access only ever happens inside a
//! closure, so a guard can't leak out of the critical section.
//!
//! The `apply_many*` functions lock several cells at once. Cells are always
//! locked in the order of their addresses, so two call sites locking
//! overlapping sets of cells (in any order of arguments) can't deadlock.
use std::fmt;
use std::sync::{Mutex, MutexGuard};

pub struct Synchronized<T> {
    inner: Mutex<T>,
}

impl<T> Synchronized<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Run `f` with exclusive access to the value
    ///
    /// Calling `apply` on the same cell from within `f` deadlocks.
    pub fn apply<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut *self.lock())
    }

    /// Snapshot of the current value
    pub fn read_copy(&self) -> T
    where
        T: Clone,
    {
        self.apply(|v| v.clone())
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner().expect("locking failed")
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().expect("locking failed")
    }

    #[allow(clippy::as_conversions)]
    fn addr(&self) -> usize {
        self as *const Self as usize
    }
}

impl<T: Default> Default for Synchronized<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Synchronized<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Ok(v) => f.debug_tuple("Synchronized").field(&*v).finish(),
            Err(_) => f.write_str("Synchronized(<locked>)"),
        }
    }
}

macro_rules! impl_apply_many {
    ($(#[$doc:meta])* $name:ident; $($t:ident $cell:ident $guard:ident $idx:literal),+) => {
        $(#[$doc])*
        pub fn $name<$($t,)+ R>(
            $($cell: &Synchronized<$t>,)+
            f: impl FnOnce($(&mut $t),+) -> R,
        ) -> R {
            let mut order = [$(($cell.addr(), $idx)),+];
            order.sort_unstable();
            debug_assert!(
                order.windows(2).all(|w| w[0].0 != w[1].0),
                "the same cell passed twice"
            );

            $(let mut $guard = None;)+
            for (_, idx) in order {
                match idx {
                    $($idx => $guard = Some($cell.lock()),)+
                    _ => unreachable!(),
                }
            }
            $(let mut $guard = $guard.expect("every cell locked");)+

            f($(&mut *$guard),+)
        }
    };
}

impl_apply_many!(
    /// Run `f` with exclusive access to both cells
    apply_many2; A a a_guard 0usize, B b b_guard 1usize
);
impl_apply_many!(
    /// Run `f` with exclusive access to all three cells
    apply_many3; A a a_guard 0usize, B b b_guard 1usize, C c c_guard 2usize
);
