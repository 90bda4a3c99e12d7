//! Deletion safety
//!
//! A task is *deletion-safe* while its deletion-safety depth is non-zero. The
//! depth is incremented each time the task acquires a delete-safe mutex (or
//! calls [`System::task_safe`]) and decremented on the matching release. A
//! deletion request targeting a deletion-safe task is deferred by the port
//! until the depth drops to zero, at which point
//! [`KernelTraits::flush_deferred_deletion`] is called.
use crate::{
    error::{QueryTaskError, TaskSafetyError},
    klock::{self, CpuLockTokenRefMut},
    state,
    task::{self, TaskRecord},
    KernelTraits, System,
};

/// Increment `task`'s deletion-safety depth.
pub(crate) fn acquire<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static Traits::TaskCb,
) {
    *task.mutex_state().deletion_safe_depth.write(lock) += 1;
}

/// Decrement `task`'s deletion-safety depth. If it reaches zero, let the port
/// carry out a deferred deletion request.
pub(crate) fn release<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static Traits::TaskCb,
) {
    let depth = {
        let mut depth = task.mutex_state().deletion_safe_depth.write(lock.borrow_mut());
        debug_assert_ne!(*depth, 0);
        *depth = depth.saturating_sub(1);
        *depth
    };

    if depth == 0 {
        Traits::flush_deferred_deletion(lock, task);
    }
}

/// Get a flag indicating whether `task` can't be deleted right now.
///
/// Ports call this from their deletion routine to decide whether the request
/// should be deferred.
pub fn is_deletion_safe<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static Traits::TaskCb,
) -> bool {
    deletion_safe_depth(lock, task) != 0
}

/// Get `task`'s deletion-safety depth.
pub fn deletion_safe_depth<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static Traits::TaskCb,
) -> usize {
    task.mutex_state().deletion_safe_depth.get(lock)
}

impl<Traits: KernelTraits> System<Traits> {
    /// Make the calling task deletion-safe (or increase the depth if it's
    /// already deletion-safe).
    pub fn task_safe() -> Result<(), TaskSafetyError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        let task = task::current_task(lock.borrow_mut())?;
        *task.mutex_state().explicit_safe_depth.write(lock.borrow_mut()) += 1;
        acquire(lock.borrow_mut(), task);
        Ok(())
    }

    /// Undo one call to [`task_safe`](Self::task_safe). When the depth
    /// reaches zero, a deletion request deferred in the meantime is carried
    /// out, in which case this method doesn't return.
    ///
    /// Fails with `NotOwner` if there's no outstanding `task_safe` call. The
    /// deletion safety conferred by owned delete-safe mutexes can only be
    /// given up by releasing them.
    pub fn task_unsafe() -> Result<(), TaskSafetyError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        let task = task::current_task(lock.borrow_mut())?;

        {
            let mut explicit_depth = task
                .mutex_state()
                .explicit_safe_depth
                .write(lock.borrow_mut());
            if *explicit_depth == 0 {
                return Err(TaskSafetyError::NotOwner);
            }
            *explicit_depth -= 1;
        }

        release(lock.borrow_mut(), task);

        task::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Get a flag indicating whether `task` is currently deletion-safe.
    pub fn is_deletion_safe(task: &'static Traits::TaskCb) -> Result<bool, QueryTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        Ok(is_deletion_safe(lock.borrow_mut(), task))
    }

    /// Get `task`'s deletion-safety depth.
    pub fn deletion_safe_depth(task: &'static Traits::TaskCb) -> Result<usize, QueryTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        Ok(deletion_safe_depth(lock.borrow_mut(), task))
    }
}
