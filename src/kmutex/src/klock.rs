//! Kernel state locking mechanism
//!
//! Every piece of mutable kernel state lives in a [`CpuLockCell`], which can
//! only be accessed through a [`CpuLockToken`]. The only way to obtain a
//! token is to enter a CPU Lock state by [`lock_cpu`] (or to assume one by
//! [`assume_cpu_lock`]), so holding a token proves that the calling context
//! has exclusive access to the kernel state.
use core::{
    cell::{Ref, RefCell, RefMut},
    fmt,
    marker::PhantomData,
    ops,
};
use critical_section::CriticalSection;

use crate::{error::BadContextError, utils::Init, PortThreading};

/// The key that "unlocks" [`CpuLockCell`].
///
/// This type wraps a [`CriticalSection`] token. CPU Lock is this kernel's
/// critical section, but it's entered through [`PortThreading`] rather than
/// through the global `critical_section` implementation.
pub struct CpuLockToken<Traits> {
    cs: CriticalSection<'static>,
    _phantom: PhantomData<(fn() -> Traits, *const ())>,
}

impl<Traits> CpuLockToken<Traits> {
    /// Reborrow `self`. This is what passing a [`CpuLockTokenRefMut`] to a
    /// function looks like in this crate.
    #[inline]
    pub fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_, Traits> {
        self
    }
}

/// Borrowed version of [`CpuLockGuard`].
///
///  - Always prefer this over `&mut CpuLockGuard` in function parameters.
///  - Call [`borrow_mut`](CpuLockToken::borrow_mut) to pass it down without
///    giving it up.
pub type CpuLockTokenRefMut<'a, Traits> = &'a mut CpuLockToken<Traits>;

/// Cell type that can be accessed by [`CpuLockToken`] (which can be obtained
/// by [`lock_cpu`]).
pub struct CpuLockCell<Traits, T> {
    inner: critical_section::Mutex<RefCell<T>>,
    _phantom: PhantomData<fn() -> Traits>,
}

impl<Traits, T> CpuLockCell<Traits, T> {
    pub const fn new(x: T) -> Self {
        Self {
            inner: critical_section::Mutex::new(RefCell::new(x)),
            _phantom: PhantomData,
        }
    }

    /// Borrow the contents immutably.
    #[inline]
    pub fn read<'a>(&'a self, token: &'a CpuLockToken<Traits>) -> Ref<'a, T> {
        self.inner.borrow(token.cs).borrow()
    }

    /// Borrow the contents mutably.
    ///
    /// Requiring `&mut CpuLockToken` rules out overlapping borrows at compile
    /// time, so the inner `RefCell` never panics.
    #[inline]
    pub fn write<'a>(&'a self, token: &'a mut CpuLockToken<Traits>) -> RefMut<'a, T> {
        self.inner.borrow(token.cs).borrow_mut()
    }

    /// Clone the contents.
    #[inline]
    pub fn get(&self, token: &CpuLockToken<Traits>) -> T
    where
        T: Clone,
    {
        self.read(token).clone()
    }

    /// Replace the contents, returning the old value.
    #[inline]
    pub fn replace(&self, token: &mut CpuLockToken<Traits>, x: T) -> T {
        core::mem::replace(&mut *self.write(token), x)
    }
}

impl<Traits: PortThreading, T> CpuLockCell<Traits, T> {
    /// Return a debug formatting proxy of the cell. The given closure is used
    /// to format the borrowed contents. Note that CPU Lock is active when the
    /// closure is called.
    ///
    /// `CpuLockCell` needs to acquire CPU Lock when doing debug formatting and
    /// fails to do so if CPU Lock is already active, in which case
    /// `< locked >` is printed instead.
    pub fn debug_fmt_with_ref<'a, F: 'a + Fn(&T, &mut fmt::Formatter) -> fmt::Result>(
        &'a self,
        f: F,
    ) -> impl fmt::Debug + 'a {
        struct DebugFmtWithRef<'a, Traits, T, F> {
            cell: &'a CpuLockCell<Traits, T>,
            f: F,
        }

        impl<Traits: PortThreading, T, F: Fn(&T, &mut fmt::Formatter) -> fmt::Result> fmt::Debug
            for DebugFmtWithRef<'_, Traits, T, F>
        {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if let Ok(lock) = lock_cpu::<Traits>() {
                    f.write_str("CpuLockCell(")?;
                    (self.f)(&self.cell.read(&lock), f)?;
                    f.write_str(")")
                } else {
                    f.write_str("CpuLockCell(< locked >)")
                }
            }
        }

        DebugFmtWithRef { cell: self, f }
    }
}

impl<Traits: PortThreading, T: fmt::Debug> fmt::Debug for CpuLockCell<Traits, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.debug_fmt_with_ref(|x, f| x.fmt(f)).fmt(f)
    }
}

impl<Traits, T: Init> Init for CpuLockCell<Traits, T> {
    const INIT: Self = Self::new(T::INIT);
}

/// Attempt to enter a CPU Lock state and get an RAII guard.
/// Return `BadContext` if the kernel is already in a CPU Lock state.
pub fn lock_cpu<Traits: PortThreading>() -> Result<CpuLockGuard<Traits>, BadContextError> {
    // Safety: `try_enter_cpu_lock` is only meant to be called by the kernel
    if unsafe { Traits::try_enter_cpu_lock() } {
        // Safety: We just entered a CPU Lock state. This also means there are
        //         no instances of `CpuLockGuard` existing at this point.
        Ok(unsafe { assume_cpu_lock() })
    } else {
        Err(BadContextError::RestrictedContext)
    }
}

/// Assume a CPU Lock state and get `CpuLockGuard`.
///
/// # Safety
///
/// The system must be really in a CPU Lock state. There must be no instances of
/// `CpuLockGuard` existing at the point of the call.
pub unsafe fn assume_cpu_lock<Traits: PortThreading>() -> CpuLockGuard<Traits> {
    debug_assert!(Traits::is_cpu_lock_active());

    CpuLockGuard {
        token: CpuLockToken {
            // Safety: CPU Lock masks every context that can touch the kernel
            //         state, and there are no other instances of
            //         `CpuLockToken`; this is upheld by the caller.
            cs: unsafe { CriticalSection::new() },
            _phantom: PhantomData,
        },
    }
}

/// RAII guard for a CPU Lock state.
///
/// [`CpuLockToken`] can be borrowed from this type.
pub struct CpuLockGuard<Traits: PortThreading> {
    token: CpuLockToken<Traits>,
}

impl<Traits: PortThreading> CpuLockGuard<Traits> {
    /// Construct a [`CpuLockTokenRefMut`] by borrowing `self`.
    #[inline]
    pub fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_, Traits> {
        &mut self.token
    }
}

impl<Traits: PortThreading> Drop for CpuLockGuard<Traits> {
    fn drop(&mut self) {
        // Safety: CPU Lock is currently active, and it's us (the kernel) who
        // are currently controlling the CPU Lock state
        unsafe {
            Traits::leave_cpu_lock();
        }
    }
}

impl<Traits: PortThreading> ops::Deref for CpuLockGuard<Traits> {
    type Target = CpuLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: PortThreading> ops::DerefMut for CpuLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}
