#![doc = include_str!("./lib.md")]
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::doc_markdown)]

#[cfg(feature = "alloc")]
extern crate alloc;

use core::{fmt, marker::PhantomData};

pub mod error;
pub mod event;
mod inherit;
pub mod klock;
pub mod mutex;
pub mod safety;
mod state;
pub mod task;
pub mod timeout;
pub mod utils;
pub mod wait;

pub use self::{
    error::*,
    event::{EventBits, EventOptions},
    mutex::{Mutex, MutexCb, MutexInfo, MutexOptions},
    task::{TaskMutexState, TaskRecord},
    timeout::{Ticks, Timeout},
    wait::{PendQueue, QueueOrder, WakeReason},
};

use self::klock::CpuLockTokenRefMut;

/// Numeric value used to express task priorities. Lower values denote more
/// urgent tasks.
pub trait Priority: Ord + Copy + fmt::Debug + Send + Sync + 'static {}

impl<T: Ord + Copy + fmt::Debug + Send + Sync + 'static> Priority for T {}

/// Implemented by a port. This trait contains items related to the low-level
/// control of the processor state.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// initializing the execution environment and providing a dispatcher
/// implementation.
///
/// These methods are only meant to be called by the kernel.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait PortThreading: Sized + Send + Sync + 'static {
    /// Disable all kernel-managed interrupts (this state is called *CPU Lock*)
    /// if they aren't already disabled.
    ///
    /// Returns `false` if CPU Lock was already active. In this case, the
    /// state must be left unchanged.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Re-enable kernel-managed interrupts previously disabled by
    /// `try_enter_cpu_lock`, thus deactivating the CPU Lock state.
    ///
    /// Precondition: CPU Lock active
    unsafe fn leave_cpu_lock();

    /// Return a flag indicating whether a CPU Lock state is active.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether the current context is
    /// [a task context].
    ///
    /// [a task context]: crate#contexts
    fn is_task_context() -> bool;
}

/// The collaborators a mutex needs from the rest of the kernel: the
/// scheduler, the tick clock, the deletion subsystem, and the event
/// subsystem.
///
/// # Safety
///
/// The methods taking [`CpuLockTokenRefMut`] are called with CPU Lock active
/// and must not release it, except for
/// [`suspend_current_task`](Self::suspend_current_task), which may release it
/// while the calling task is not running and must reacquire it before
/// returning.
pub unsafe trait KernelTraits: PortThreading {
    /// The task priority type. Lower values denote more urgent tasks.
    type TaskPriority: Priority;

    /// The task control block type.
    type TaskCb: TaskRecord<Self>;

    /// The wait queue type embedded in every mutex.
    type PendQueue: PendQueue<Self>;

    /// Get the currently running task. Returns `None` if no task is
    /// running.
    fn running_task(lock: CpuLockTokenRefMut<'_, Self>) -> Option<&'static Self::TaskCb>;

    /// Get the effective priority of `task`.
    fn task_priority(
        lock: CpuLockTokenRefMut<'_, Self>,
        task: &'static Self::TaskCb,
    ) -> Self::TaskPriority;

    /// Get the base priority of `task`, i.e., the priority it would have if no
    /// priority inheritance were in effect.
    fn task_base_priority(
        lock: CpuLockTokenRefMut<'_, Self>,
        task: &'static Self::TaskCb,
    ) -> Self::TaskPriority;

    /// Change the effective priority of `task`. If `task` is waiting in a
    /// priority-ordered queue, the implementation must reposition it.
    ///
    /// This method does not switch contexts. The caller checks for pending
    /// preemption after leaving the critical section.
    fn set_task_priority(
        lock: CpuLockTokenRefMut<'_, Self>,
        task: &'static Self::TaskCb,
        priority: Self::TaskPriority,
    );

    /// Get the current tick count.
    fn tick_count(lock: CpuLockTokenRefMut<'_, Self>) -> Ticks;

    /// Block the current task on `queue` (which the caller has already
    /// inserted the task into) until it's woken up by [`wake_task`] or the
    /// timeout expires.
    ///
    /// On timeout or interruption, the implementation removes the task from
    /// `queue` before returning.
    ///
    /// [`wake_task`]: Self::wake_task
    fn suspend_current_task(
        lock: CpuLockTokenRefMut<'_, Self>,
        queue: &'static Self::PendQueue,
        timeout: Timeout,
    ) -> WakeReason;

    /// Make a task blocked by [`suspend_current_task`] Ready. The caller has
    /// already removed the task from its wait queue.
    ///
    /// [`suspend_current_task`]: Self::suspend_current_task
    fn wake_task(
        lock: CpuLockTokenRefMut<'_, Self>,
        task: &'static Self::TaskCb,
        reason: WakeReason,
    );

    /// Return a flag indicating whether the running task should relinquish
    /// the processor.
    fn is_preemption_pending(lock: CpuLockTokenRefMut<'_, Self>) -> bool;

    /// Yield the processor to a higher-priority task (or carry out the
    /// running task's pending deletion).
    ///
    /// Precondition: CPU Lock inactive, task context
    unsafe fn yield_cpu();

    /// Carry out the deletion of `task` if a deletion request was deferred
    /// because the task was deletion-safe. Does nothing if there is no such
    /// request.
    ///
    /// If `task` is the running task, the deletion takes effect the next time
    /// it relinquishes CPU Lock, which must be signaled through
    /// [`is_preemption_pending`](Self::is_preemption_pending).
    fn flush_deferred_deletion(lock: CpuLockTokenRefMut<'_, Self>, task: &'static Self::TaskCb);

    /// Post `events` to `task`.
    fn send_events(
        lock: CpuLockTokenRefMut<'_, Self>,
        task: &'static Self::TaskCb,
        events: EventBits,
    ) -> Result<(), EventSendError>;
}

/// Wraps a provided [trait type][1] `Traits` to instantiate the mutex-related
/// system calls that aren't tied to a specific mutex.
///
/// [1]: KernelTraits
pub struct System<Traits>(PhantomData<Traits>);

impl<Traits> fmt::Debug for System<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("System")
    }
}
