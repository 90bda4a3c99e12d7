//! The per-task state maintained on behalf of mutexes
use core::fmt;

use crate::{
    error::{BadContextError, QueryTaskError},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    mutex::{Mutex, MutexCb},
    utils::Init,
    KernelTraits, System,
};

/// Implemented by a port's task control block to give the mutex
/// implementation a place to store per-task bookkeeping.
pub trait TaskRecord<Traits: KernelTraits>: Send + Sync + 'static {
    fn mutex_state(&self) -> &TaskMutexState<Traits>;
}

/// The mutex-related fields of a task control block.
///
/// The port embeds this in its task control block and initializes it with
/// [`Init::INIT`].
pub struct TaskMutexState<Traits: KernelTraits> {
    /// The number of inversion-safe mutexes the task currently owns. The
    /// task's effective priority reverts to its base priority when this
    /// reaches zero.
    pub(crate) held_inversion_safe: CpuLockCell<Traits, usize>,

    /// The deletion-safety depth. The task can't be deleted while this is
    /// non-zero.
    pub(crate) deletion_safe_depth: CpuLockCell<Traits, usize>,

    /// The part of `deletion_safe_depth` contributed by
    /// [`System::task_safe`]. The rest comes from owned delete-safe mutexes.
    pub(crate) explicit_safe_depth: CpuLockCell<Traits, usize>,

    /// The inversion-safe mutex the task is blocked on.
    pub(crate) pending_mutex: CpuLockCell<Traits, Option<&'static MutexCb<Traits>>>,
}

impl<Traits: KernelTraits> Init for TaskMutexState<Traits> {
    const INIT: Self = Self {
        held_inversion_safe: Init::INIT,
        deletion_safe_depth: Init::INIT,
        explicit_safe_depth: Init::INIT,
        pending_mutex: Init::INIT,
    };
}

impl<Traits: KernelTraits> fmt::Debug for TaskMutexState<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskMutexState")
            .field("held_inversion_safe", &self.held_inversion_safe)
            .field("deletion_safe_depth", &self.deletion_safe_depth)
            .field("explicit_safe_depth", &self.explicit_safe_depth)
            .field(
                "pending_mutex",
                &self.pending_mutex.debug_fmt_with_ref(|x, f| {
                    fmt::Debug::fmt(&x.map(|cb| cb as *const MutexCb<Traits>), f)
                }),
            )
            .finish()
    }
}

/// Get the running task. Fails if there is no running task (e.g., the caller
/// is an interrupt handler that preempted the idle loop).
pub(crate) fn current_task<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> Result<&'static Traits::TaskCb, BadContextError> {
    Traits::running_task(lock).ok_or(BadContextError::RestrictedContext)
}

/// Relinquish CPU Lock. After that, if there's a higher-priority task than
/// the running task (or the running task has a deletion pending), call
/// `KernelTraits::yield_cpu`.
///
/// System services that transition a task into the Ready state should call
/// this before returning to the caller.
pub(crate) fn unlock_cpu_and_check_preemption<Traits: KernelTraits>(
    mut lock: klock::CpuLockGuard<Traits>,
) {
    let preempt = Traits::is_preemption_pending(lock.borrow_mut());

    // Relinquish CPU Lock
    drop(lock);

    if preempt {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// Get the inversion-safe mutex `task` is blocked on.
pub fn pending_mutex<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static Traits::TaskCb,
) -> Option<Mutex<Traits>> {
    task.mutex_state()
        .pending_mutex
        .get(lock)
        .map(Mutex::from_cb)
}

/// Get the number of inversion-safe mutexes `task` owns.
pub fn held_inversion_safe_count<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task: &'static Traits::TaskCb,
) -> usize {
    task.mutex_state().held_inversion_safe.get(lock)
}

impl<Traits: KernelTraits> System<Traits> {
    /// Get the inversion-safe mutex `task` is currently blocked on.
    pub fn pending_mutex(
        task: &'static Traits::TaskCb,
    ) -> Result<Option<Mutex<Traits>>, QueryTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        Ok(pending_mutex(lock.borrow_mut(), task))
    }

    /// Get the number of inversion-safe mutexes `task` currently owns.
    pub fn held_inversion_safe_count(
        task: &'static Traits::TaskCb,
    ) -> Result<usize, QueryTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        Ok(held_inversion_safe_count(lock.borrow_mut(), task))
    }
}
