//! Tasks
use kmutex::{
    klock::{self, CpuLockGuard},
    utils::Init,
    EventBits, KernelTraits, TaskMutexState, TaskRecord, Ticks, Timeout, WakeReason,
};
use std::{cell::Cell, fmt, marker::PhantomData, panic, ptr};

use crate::{
    is_task_context,
    sched::{self, Baton, Outcome, TaskSt},
    PortInstance, State, ThreadRole, THREAD_ROLE,
};

/// The error type returned by the task operations of this port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// CPU Lock is active, or the operation requires a different context.
    BadContext,
    /// The task isn't in a state the operation applies to. This includes
    /// tasks that exited or were deleted.
    BadObjectState,
    /// The wait was interrupted by [`Task::interrupt`].
    Interrupted,
}

/// The result of [`Task::delete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The task was deleted.
    Deleted,
    /// The task is deletion-safe. It will be deleted when it stops being
    /// deletion-safe.
    Deferred,
}

/// Task control block
pub struct TaskCb<Traits: KernelTraits> {
    /// The position in the scheduler's task table
    pub(crate) index: usize,
    pub(crate) name: &'static str,
    mutex_state: TaskMutexState<Traits>,
}

impl<Traits: KernelTraits> TaskRecord<Traits> for TaskCb<Traits> {
    #[inline]
    fn mutex_state(&self) -> &TaskMutexState<Traits> {
        &self.mutex_state
    }
}

impl<Traits: KernelTraits> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("name", &self.name)
            .field("mutex_state", &self.mutex_state)
            .finish()
    }
}

/// Represents a single task.
pub struct Task<Traits: PortInstance>(&'static TaskCb<Traits>);

impl<Traits: PortInstance> Clone for Task<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: PortInstance> Copy for Task<Traits> {}

impl<Traits: PortInstance> PartialEq for Task<Traits> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.0, other.0)
    }
}

impl<Traits: PortInstance> Eq for Task<Traits> {}

impl<Traits: PortInstance> fmt::Debug for Task<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Task").field(&self.0.name).finish()
    }
}

/// Builds a task. Created by [`Task::build`].
#[must_use = "call `start` to create the task"]
pub struct TaskBuilder<Traits> {
    name: &'static str,
    priority: usize,
    _phantom: PhantomData<fn() -> Traits>,
}

impl<Traits: PortInstance> TaskBuilder<Traits> {
    /// Set the task's name, which is also given to its backing thread.
    pub fn name(self, name: &'static str) -> Self {
        Self { name, ..self }
    }

    /// Set the task's initial (base) priority. Lower values denote more
    /// urgent tasks.
    pub fn priority(self, priority: usize) -> Self {
        Self { priority, ..self }
    }

    /// Create the task. It starts running on the next call to
    /// [`run`](crate::run).
    ///
    /// Fails with `BadContext` if called from a task or an interrupt
    /// handler.
    pub fn start(self, body: impl FnOnce() + Send + 'static) -> Result<Task<Traits>, TaskError> {
        if THREAD_ROLE.with(Cell::get) != ThreadRole::Unknown {
            return Err(TaskError::BadContext);
        }

        let mut lock = klock::lock_cpu::<Traits>().map_err(|_| TaskError::BadContext)?;
        let mut sched = Traits::port_state().sched.write(&mut lock);

        let cb: &'static TaskCb<Traits> = Box::leak(Box::new(TaskCb {
            index: sched.tasks.len(),
            name: self.name,
            mutex_state: Init::INIT,
        }));
        sched.add_task(cb, self.priority, Box::new(body));

        log::trace!("created {:?} with priority {}", cb.name, self.priority);

        Ok(Task(cb))
    }
}

impl<Traits: PortInstance> Task<Traits> {
    /// Start building a task.
    pub fn build() -> TaskBuilder<Traits> {
        TaskBuilder {
            name: "task",
            priority: 0,
            _phantom: PhantomData,
        }
    }

    /// Construct a `Task` from a task control block.
    pub fn from_cb(cb: &'static TaskCb<Traits>) -> Self {
        Self(cb)
    }

    /// Get the task control block.
    pub fn cb(self) -> &'static TaskCb<Traits> {
        self.0
    }

    pub fn name(self) -> &'static str {
        self.0.name
    }

    /// Get the running task. In an interrupt handler, this is the task the
    /// handler preempted.
    pub fn current() -> Result<Option<Self>, TaskError> {
        let mut lock = klock::lock_cpu::<Traits>().map_err(|_| TaskError::BadContext)?;
        Ok(Traits::running_task(lock.borrow_mut()).map(Self))
    }

    fn read<R>(self, f: impl FnOnce(&sched::TaskEntry<Traits>) -> R) -> Result<R, TaskError> {
        let lock = klock::lock_cpu::<Traits>().map_err(|_| TaskError::BadContext)?;
        let sched = Traits::port_state().sched.read(&lock);
        Ok(f(&sched.tasks[self.0.index]))
    }

    pub fn state(self) -> Result<TaskSt, TaskError> {
        self.read(|task| task.st)
    }

    /// Get the task's effective priority.
    pub fn priority(self) -> Result<usize, TaskError> {
        self.read(|task| task.priority)
    }

    pub fn base_priority(self) -> Result<usize, TaskError> {
        self.read(|task| task.base_priority)
    }

    /// Get the events posted to the task and not yet received.
    pub fn pending_events(self) -> Result<EventBits, TaskError> {
        self.read(|task| task.events)
    }

    /// Get a flag indicating whether a deletion request is waiting for the
    /// task to stop being deletion-safe.
    pub fn is_deletion_pending(self) -> Result<bool, TaskError> {
        self.read(|task| task.deletion_deferred || task.doomed)
    }

    /// Change the task's base priority.
    ///
    /// While the task owns inversion-safe mutexes, the effective priority is
    /// only ever raised by this method. Lowering takes effect when the task
    /// releases the last of them.
    pub fn set_priority(self, priority: usize) -> Result<(), TaskError> {
        let mut lock = klock::lock_cpu::<Traits>().map_err(|_| TaskError::BadContext)?;

        let effective_priority = {
            let mut sched = Traits::port_state().sched.write(&mut lock);
            let task = &mut sched.tasks[self.0.index];
            if task.st.is_dead() {
                return Err(TaskError::BadObjectState);
            }
            task.base_priority = priority;
            task.priority
        };

        let holds_inversion_safe =
            kmutex::task::held_inversion_safe_count(lock.borrow_mut(), self.0) != 0;

        if !holds_inversion_safe || priority < effective_priority {
            Traits::set_task_priority(lock.borrow_mut(), self.0, priority);
        }

        crate::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Interrupt a blocking operation of the task, like a signal would. A
    /// mutex wait restarts with the residual timeout; [`sleep`] returns
    /// `Interrupted`.
    ///
    /// This can be called from an interrupt handler.
    pub fn interrupt(self) -> Result<(), TaskError> {
        let mut lock = klock::lock_cpu::<Traits>().map_err(|_| TaskError::BadContext)?;

        if Traits::port_state().sched.read(&lock).tasks[self.0.index].st != TaskSt::Waiting {
            return Err(TaskError::BadObjectState);
        }

        log::trace!("interrupting {:?}", self.0.name);
        sched::release_waiting_task::<Traits>(lock.borrow_mut(), self.0.index, WakeReason::Interrupted);

        crate::unlock_cpu_and_check_preemption(lock);
        Ok(())
    }

    /// Delete the task.
    ///
    /// If the task is deletion-safe, the deletion is deferred until it stops
    /// being so and `Deferred` is returned. Deleting the calling task
    /// doesn't return unless the deletion is deferred.
    ///
    /// Mutexes owned by the task aren't released. Use
    /// [`Mutex::give_force`](kmutex::Mutex::give_force) to recover them.
    pub fn delete(self) -> Result<DeleteOutcome, TaskError> {
        if !is_task_context() {
            return Err(TaskError::BadContext);
        }

        let mut lock = klock::lock_cpu::<Traits>().map_err(|_| TaskError::BadContext)?;
        let state = Traits::port_state();

        let (st, is_running) = {
            let sched = state.sched.read(&lock);
            (
                sched.tasks[self.0.index].st,
                sched.running == Some(self.0.index),
            )
        };

        if st.is_dead() {
            return Err(TaskError::BadObjectState);
        }

        if kmutex::safety::is_deletion_safe(lock.borrow_mut(), self.0) {
            log::debug!("deferring the deletion of {:?}", self.0.name);
            state.sched.write(&mut lock).tasks[self.0.index].deletion_deferred = true;
            return Ok(DeleteOutcome::Deferred);
        }

        if is_running {
            state.exit_current_task(lock);
        }

        sched::delete_inactive_task::<Traits>(lock.borrow_mut(), self.0.index);
        Ok(DeleteOutcome::Deleted)
    }
}

/// Block the calling task for the specified number of ticks. `sleep(0)`
/// yields the processor to other tasks having the same priority.
pub fn sleep<Traits: PortInstance>(ticks: Ticks) -> Result<(), TaskError> {
    if !is_task_context() {
        return Err(TaskError::BadContext);
    }

    let mut lock = klock::lock_cpu::<Traits>().map_err(|_| TaskError::BadContext)?;
    let state = Traits::port_state();

    if ticks == 0 {
        let me = {
            let mut sched = state.sched.write(&mut lock);
            let me = sched.running_index();
            sched.make_ready(me, false);
            me
        };
        sched::switch_away::<Traits>(lock.borrow_mut(), me);
        return Ok(());
    }

    match state.wait_current_task(lock.borrow_mut(), None, Timeout::Ticks(ticks)) {
        WakeReason::Interrupted => Err(TaskError::Interrupted),
        _ => Ok(()),
    }
}

/// Get the current tick count.
pub fn tick_count<Traits: PortInstance>() -> Result<Ticks, TaskError> {
    let mut lock = klock::lock_cpu::<Traits>().map_err(|_| TaskError::BadContext)?;
    Ok(Traits::tick_count(lock.borrow_mut()))
}

/// Take the events posted to the calling task, clearing them.
pub fn receive_events<Traits: PortInstance>() -> Result<EventBits, TaskError> {
    if !is_task_context() {
        return Err(TaskError::BadContext);
    }

    let mut lock = klock::lock_cpu::<Traits>().map_err(|_| TaskError::BadContext)?;
    let mut sched = Traits::port_state().sched.write(&mut lock);
    let me = sched.running_index();
    Ok(std::mem::take(&mut sched.tasks[me].events))
}

/// The entry point of a task's backing thread
pub(crate) fn task_main<Traits: PortInstance>(
    cb: &'static TaskCb<Traits>,
    body: Box<dyn FnOnce() + Send + 'static>,
) {
    THREAD_ROLE.with(|role| role.set(ThreadRole::Task));

    let state = Traits::port_state();
    state.wait_for_turn(cb.index);

    log::debug!("{:?} started", cb.name);

    let result = panic::catch_unwind(panic::AssertUnwindSafe(body));

    let mut lock = match klock::lock_cpu::<Traits>() {
        Ok(lock) => lock,
        // Safety: The task leaked a `CpuLockGuard`. We hold the baton, so
        // nobody else can be using it.
        Err(_) => unsafe { klock::assume_cpu_lock() },
    };

    {
        let mut sched = state.sched.write(&mut lock);
        sched.tasks[cb.index].st = TaskSt::Exited;
        sched.running = None;
    }

    let next = match result {
        Ok(()) => {
            log::debug!("{:?} exited", cb.name);
            sched::choose_running_task::<Traits>(lock.borrow_mut())
        }
        Err(payload) => {
            log::error!("{:?} panicked", cb.name);
            *state.panic_payload.lock() = Some(payload);
            Baton::Finished(Outcome::Panicked)
        }
    };

    drop(lock);
    state.hand_over(next);
}

impl<Traits: PortInstance> State<Traits> {
    /// Delete the running task and dispatch the next one. The backing thread
    /// is never resumed.
    pub(crate) fn exit_current_task(&'static self, mut lock: CpuLockGuard<Traits>) -> ! {
        {
            let mut sched = self.sched.write(&mut lock);
            let me = sched.running_index();
            let task = &mut sched.tasks[me];
            task.st = TaskSt::Deleted;
            task.doomed = false;
            log::debug!("{:?} deleted", task.cb.name);
            sched.running = None;
        }

        let next = sched::choose_running_task::<Traits>(lock.borrow_mut());
        drop(lock);
        self.hand_over(next);

        loop {
            std::thread::park();
        }
    }
}
