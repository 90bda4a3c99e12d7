//! Priority inheritance for inversion-safe mutexes
//!
//! When a task blocks on an inversion-safe mutex owned by a task having a
//! lower effective priority, the owner's effective priority is raised to the
//! waiter's. The elevation isn't transitive: if the owner is itself blocked on
//! another mutex, that mutex's owner is left alone.
//!
//! An owner keeps elevated priorities until it releases the *last*
//! inversion-safe mutex it holds, at which point its effective priority
//! reverts to its base priority.
use crate::{klock::CpuLockTokenRefMut, task::TaskRecord, KernelTraits};

/// Raise `owner`'s effective priority to `waiter`'s if the latter is higher.
///
/// This must be called in the same critical section as the one in which
/// `waiter` is suspended.
pub(crate) fn elevate_owner<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    owner: &'static Traits::TaskCb,
    waiter: &'static Traits::TaskCb,
) {
    let waiter_priority = Traits::task_priority(lock.borrow_mut(), waiter);
    if waiter_priority < Traits::task_priority(lock.borrow_mut(), owner) {
        Traits::set_task_priority(lock, owner, waiter_priority);
    }
}

/// Record that `task` acquired an inversion-safe mutex.
pub(crate) fn acquire<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static Traits::TaskCb,
) {
    *task.mutex_state().held_inversion_safe.write(lock) += 1;
}

/// Record that `task` released an inversion-safe mutex. If it was the last
/// one, restore the task's effective priority to its base priority.
pub(crate) fn release<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static Traits::TaskCb,
) {
    let remaining = {
        let mut held = task.mutex_state().held_inversion_safe.write(lock.borrow_mut());
        debug_assert_ne!(*held, 0);
        *held = held.saturating_sub(1);
        *held
    };

    if remaining == 0 {
        let base_priority = Traits::task_base_priority(lock.borrow_mut(), task);
        if Traits::task_priority(lock.borrow_mut(), task) != base_priority {
            Traits::set_task_priority(lock, task, base_priority);
        }
    }
}
