#![doc = include_str!("./lib.md")]
#![deny(unsafe_op_in_unsafe_fn)]
use kmutex::{
    klock::{self, CpuLockCell, CpuLockGuard},
    KernelTraits,
};
use spin::Mutex as SpinMutex;
use std::{
    any::Any,
    cell::Cell,
    panic,
    sync::{
        atomic::{AtomicBool, Ordering},
        Condvar, Mutex as StdMutex, PoisonError,
    },
};

mod pend;
mod sched;
mod task;

pub use self::{
    pend::WaitQueue,
    sched::TaskSt,
    task::{receive_events, sleep, tick_count, DeleteOutcome, Task, TaskBuilder, TaskCb, TaskError},
};

use self::sched::{Baton, Outcome, SchedState};

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate kmutex;
/// Used by test harnesses
#[doc(hidden)]
pub extern crate env_logger;

/// Implemented on a kernel trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
#[doc(hidden)]
pub unsafe trait PortInstance:
    KernelTraits<TaskPriority = usize, TaskCb = TaskCb<Self>, PendQueue = WaitQueue<Self>>
{
    fn port_state() -> &'static State<Self>;
}

/// The internal state of the port.
///
/// # Safety
///
/// For the safety information of this type's methods, see the documentation of
/// the corresponding trait methods of [`KernelTraits`] and
/// [`PortThreading`](kmutex::PortThreading).
#[doc(hidden)]
pub struct State<Traits: PortInstance> {
    /// The CPU Lock flag. Only the thread holding the baton may set it.
    cpu_lock: AtomicBool,
    sched: CpuLockCell<Traits, SchedState<Traits>>,
    baton: StdMutex<Baton>,
    baton_cv: Condvar,
    /// A panic that occurred in a task thread, to be propagated by [`run`].
    ///
    /// `SpinMutex` is sufficient because a task thread only stores a payload
    /// right before giving up the baton for good.
    panic_payload: SpinMutex<Option<Box<dyn Any + Send + 'static>>>,
}

/// The role of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    /// The backing thread for a task, currently executing an interrupt
    /// handler by [`simulate_interrupt`].
    Interrupt,
    /// The backing thread for a task.
    Task,
}

thread_local! {
    /// The current thread's role. It's automatically assigned after the
    /// creation of a thread managed by the port.
    static THREAD_ROLE: Cell<ThreadRole> = Cell::new(ThreadRole::Unknown);
}

/// Return a flag indicating whether the calling thread is executing a task
/// (and not an interrupt handler).
pub fn is_task_context() -> bool {
    THREAD_ROLE.with(|role| role.get() == ThreadRole::Task)
}

#[allow(clippy::missing_safety_doc)]
#[allow(clippy::new_without_default)]
impl<Traits: PortInstance> State<Traits> {
    pub const fn new() -> Self {
        Self {
            cpu_lock: AtomicBool::new(false),
            sched: CpuLockCell::new(SchedState::new()),
            baton: StdMutex::new(Baton::Idle),
            baton_cv: Condvar::new(),
            panic_payload: SpinMutex::new(None),
        }
    }

    pub unsafe fn try_enter_cpu_lock(&self) -> bool {
        !self.cpu_lock.swap(true, Ordering::Acquire)
    }

    pub unsafe fn leave_cpu_lock(&self) {
        let was_active = self.cpu_lock.swap(false, Ordering::Release);
        debug_assert!(was_active);
    }

    pub fn is_cpu_lock_active(&self) -> bool {
        self.cpu_lock.load(Ordering::Relaxed)
    }

    /// Clear the CPU Lock flag without dropping the `CpuLockGuard` that
    /// represents it. Used when the calling thread is about to give up the
    /// baton in the middle of a critical section.
    pub(crate) fn release_cpu_lock_flag(&self) {
        self.cpu_lock.store(false, Ordering::Release);
    }

    /// Undo [`Self::release_cpu_lock_flag`] after getting the baton back.
    pub(crate) fn acquire_cpu_lock_flag(&self) {
        let was_active = self.cpu_lock.swap(true, Ordering::Acquire);
        debug_assert!(!was_active);
    }

    fn set_baton(&self, next: Baton) {
        let mut baton = self.baton.lock().unwrap_or_else(PoisonError::into_inner);
        *baton = next;
        self.baton_cv.notify_all();
    }

    pub(crate) fn hand_over(&self, next: Baton) {
        log::trace!("handing over the processor to {:?}", next);
        self.set_baton(next);
    }

    /// Block the calling thread until the task with the specified index is
    /// dispatched.
    pub(crate) fn wait_for_turn(&self, index: usize) {
        let mut baton = self.baton.lock().unwrap_or_else(PoisonError::into_inner);
        while *baton != Baton::Task(index) {
            baton = self
                .baton_cv
                .wait(baton)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn wait_for_finish(&self) -> Outcome {
        let mut baton = self.baton.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Baton::Finished(outcome) = *baton {
                return outcome;
            }
            baton = self
                .baton_cv
                .wait(baton)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// The error type returned by [`run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunError {
    /// `run` was called from a task, from an interrupt handler, or while
    /// another `run` call is in progress.
    BadContext,
    /// A backing thread couldn't be created.
    SpawnFailed,
    /// Some tasks were left blocked with no timeout that could ever wake them
    /// up.
    Deadlock,
}

/// Run the tasks created by [`Task::build`] until all of them exit or are
/// deleted.
///
/// Tasks blocked at the point of return stay blocked. Calling `run` again
/// after creating more tasks resumes the simulation with the same clock.
///
/// A panic in a task stops the simulation and is propagated to the caller.
pub fn run<Traits: PortInstance>() -> Result<(), RunError> {
    if THREAD_ROLE.with(Cell::get) != ThreadRole::Unknown {
        return Err(RunError::BadContext);
    }

    let state = Traits::port_state();
    let mut lock = klock::lock_cpu::<Traits>().map_err(|_| RunError::BadContext)?;

    let new_tasks: Vec<_> = state
        .sched
        .write(&mut lock)
        .tasks
        .iter_mut()
        .filter_map(|task| Some((task.cb, task.body.take()?)))
        .collect();

    for (cb, body) in new_tasks {
        log::trace!("spawning the backing thread of {:?}", cb.name);
        std::thread::Builder::new()
            .name(cb.name.to_owned())
            .spawn(move || task::task_main::<Traits>(cb, body))
            .map_err(|e| {
                log::error!("failed to spawn the backing thread of {:?}: {}", cb.name, e);
                RunError::SpawnFailed
            })?;
    }

    state.set_baton(Baton::Idle);

    let outcome = match sched::choose_running_task::<Traits>(lock.borrow_mut()) {
        Baton::Finished(outcome) => outcome,
        next => {
            drop(lock);
            state.hand_over(next);
            state.wait_for_finish()
        }
    };

    // Propagate any panic that occurred in a task thread
    if let Some(payload) = state.panic_payload.lock().take() {
        panic::resume_unwind(payload);
    }

    log::debug!("run: {:?}", outcome);

    match outcome {
        Outcome::Completed | Outcome::Panicked => Ok(()),
        Outcome::Deadlock => Err(RunError::Deadlock),
    }
}

/// Execute `handler` as if it were an interrupt handler preempting the
/// calling task. Kernel services that require a task context fail with
/// `RestrictedContext` inside `handler`.
///
/// Any dispatching caused by `handler` takes place when it returns.
pub fn simulate_interrupt<Traits: PortInstance, R>(handler: impl FnOnce() -> R) -> R {
    struct RestoreRole(ThreadRole);

    impl Drop for RestoreRole {
        fn drop(&mut self) {
            THREAD_ROLE.with(|role| role.set(self.0));
        }
    }

    let prev_role = THREAD_ROLE.with(|role| role.replace(ThreadRole::Interrupt));
    let restore = RestoreRole(prev_role);

    log::trace!("entering an interrupt handler");
    let output = handler();
    log::trace!("leaving an interrupt handler");

    drop(restore);

    if prev_role == ThreadRole::Task {
        if let Ok(lock) = klock::lock_cpu::<Traits>() {
            unlock_cpu_and_check_preemption(lock);
        }
    }

    output
}

/// Relinquish CPU Lock. After that, if the calling context is a task and
/// there's a higher-priority task than the running task, call
/// `KernelTraits::yield_cpu`.
pub(crate) fn unlock_cpu_and_check_preemption<Traits: PortInstance>(
    mut lock: CpuLockGuard<Traits>,
) {
    let preempt = Traits::is_preemption_pending(lock.borrow_mut());

    // Relinquish CPU Lock
    drop(lock);

    if preempt && is_task_context() {
        // Safety: CPU Lock inactive, task context
        unsafe { Traits::yield_cpu() };
    }
}

/// Instantiate the port. Implements the port traits on the given type and
/// allocates the port state for it.
///
/// Every kernel trait type has its own scheduler, tick clock, and set of
/// tasks.
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $SystemTraits:ident) => {
        $vis struct $SystemTraits;

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::kmutex::{
                klock::CpuLockTokenRefMut, EventBits, EventSendError, KernelTraits,
                PortThreading, Ticks, Timeout, WakeReason,
            };
            use $crate::{PortInstance, State, TaskCb, WaitQueue};

            pub(super) static PORT_STATE: State<$SystemTraits> = State::new();

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State<Self> {
                    &PORT_STATE
                }
            }

            unsafe impl PortThreading for $SystemTraits {
                unsafe fn try_enter_cpu_lock() -> bool {
                    unsafe { PORT_STATE.try_enter_cpu_lock() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock() }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active()
                }

                fn is_task_context() -> bool {
                    $crate::is_task_context()
                }
            }

            unsafe impl KernelTraits for $SystemTraits {
                type TaskPriority = usize;
                type TaskCb = TaskCb<Self>;
                type PendQueue = WaitQueue<Self>;

                fn running_task(
                    lock: CpuLockTokenRefMut<'_, Self>,
                ) -> Option<&'static TaskCb<Self>> {
                    PORT_STATE.running_task(lock)
                }

                fn task_priority(
                    lock: CpuLockTokenRefMut<'_, Self>,
                    task: &'static TaskCb<Self>,
                ) -> usize {
                    PORT_STATE.task_priority(lock, task)
                }

                fn task_base_priority(
                    lock: CpuLockTokenRefMut<'_, Self>,
                    task: &'static TaskCb<Self>,
                ) -> usize {
                    PORT_STATE.task_base_priority(lock, task)
                }

                fn set_task_priority(
                    lock: CpuLockTokenRefMut<'_, Self>,
                    task: &'static TaskCb<Self>,
                    priority: usize,
                ) {
                    PORT_STATE.set_task_priority(lock, task, priority)
                }

                fn tick_count(lock: CpuLockTokenRefMut<'_, Self>) -> Ticks {
                    PORT_STATE.tick_count(lock)
                }

                fn suspend_current_task(
                    lock: CpuLockTokenRefMut<'_, Self>,
                    queue: &'static WaitQueue<Self>,
                    timeout: Timeout,
                ) -> WakeReason {
                    PORT_STATE.suspend_current_task(lock, queue, timeout)
                }

                fn wake_task(
                    lock: CpuLockTokenRefMut<'_, Self>,
                    task: &'static TaskCb<Self>,
                    reason: WakeReason,
                ) {
                    PORT_STATE.wake_task(lock, task, reason)
                }

                fn is_preemption_pending(lock: CpuLockTokenRefMut<'_, Self>) -> bool {
                    PORT_STATE.is_preemption_pending(lock)
                }

                unsafe fn yield_cpu() {
                    unsafe { PORT_STATE.yield_cpu() }
                }

                fn flush_deferred_deletion(
                    lock: CpuLockTokenRefMut<'_, Self>,
                    task: &'static TaskCb<Self>,
                ) {
                    PORT_STATE.flush_deferred_deletion(lock, task)
                }

                fn send_events(
                    lock: CpuLockTokenRefMut<'_, Self>,
                    task: &'static TaskCb<Self>,
                    events: EventBits,
                ) -> Result<(), EventSendError> {
                    PORT_STATE.send_events(lock, task, events)
                }
            }
        }
    };
}
