//! The scheduler of the simulated processor
//!
//! Every task is backed by an OS thread, but only the thread of the running
//! task is allowed to make progress. The other task threads are parked on the
//! *baton*, which names the task that currently owns the processor. Handing
//! the baton over is how a context switch is performed.
//!
//! Time is virtual. The tick count only advances when no task is Ready, and
//! then it jumps straight to the earliest pending timeout.
use kmutex::{klock::CpuLockTokenRefMut, EventBits, PendQueue as _, Ticks, Timeout, WakeReason};
use std::fmt;

use crate::{PortInstance, State, TaskCb, WaitQueue};

/// Task state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskSt {
    /// The task can run but doesn't have the processor.
    Ready,
    /// The task has the processor.
    Running,
    /// The task is blocked on a wait queue or sleeping.
    Waiting,
    /// The task's entry point returned (or panicked).
    Exited,
    /// The task was deleted.
    Deleted,
}

impl TaskSt {
    /// Get a flag indicating whether the task no longer exists.
    #[inline]
    pub fn is_dead(self) -> bool {
        matches!(self, Self::Exited | Self::Deleted)
    }
}

/// The result of running the tasks to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// All tasks exited or were deleted.
    Completed,
    /// Some tasks are blocked forever.
    Deadlock,
    /// A task panicked.
    Panicked,
}

/// Who may run on the simulated processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Baton {
    /// Nobody. `run` hasn't started dispatching yet.
    Idle,
    /// The task with the specified index.
    Task(usize),
    /// The thread calling `run`. The simulation is over.
    Finished(Outcome),
}

pub(crate) struct TaskEntry<Traits: PortInstance> {
    pub(crate) cb: &'static TaskCb<Traits>,
    pub(crate) st: TaskSt,
    /// The effective priority
    pub(crate) priority: usize,
    pub(crate) base_priority: usize,
    /// The sort key within a priority level of the ready queue
    ready_seq: i64,
    /// The tick at which the current wait times out
    wake_at: Option<u64>,
    wake_reason: Option<WakeReason>,
    /// The queue the task is waiting in
    pend_queue: Option<&'static WaitQueue<Traits>>,
    pub(crate) events: EventBits,
    /// A deletion request was deferred because the task was deletion-safe.
    pub(crate) deletion_deferred: bool,
    /// The running task is to be deleted when it leaves CPU Lock.
    pub(crate) doomed: bool,
    /// The entry point, taken when the backing thread is spawned
    pub(crate) body: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl<Traits: PortInstance> fmt::Debug for TaskEntry<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskEntry")
            .field("name", &self.cb.name)
            .field("st", &self.st)
            .field("priority", &self.priority)
            .field("base_priority", &self.base_priority)
            .field("wake_at", &self.wake_at)
            .field("deletion_deferred", &self.deletion_deferred)
            .field("doomed", &self.doomed)
            .finish_non_exhaustive()
    }
}

pub(crate) struct SchedState<Traits: PortInstance> {
    pub(crate) tasks: Vec<TaskEntry<Traits>>,
    pub(crate) running: Option<usize>,
    /// The current tick count. Never wraps around; `Ticks` values are
    /// derived by truncation.
    pub(crate) tick: u64,
    back_seq: i64,
    front_seq: i64,
}

impl<Traits: PortInstance> SchedState<Traits> {
    pub(crate) const fn new() -> Self {
        Self {
            tasks: Vec::new(),
            running: None,
            tick: 0,
            back_seq: 0,
            front_seq: 0,
        }
    }

    pub(crate) fn add_task(
        &mut self,
        cb: &'static TaskCb<Traits>,
        priority: usize,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) {
        debug_assert_eq!(cb.index, self.tasks.len());
        self.tasks.push(TaskEntry {
            cb,
            st: TaskSt::Ready,
            priority,
            base_priority: priority,
            ready_seq: 0,
            wake_at: None,
            wake_reason: None,
            pend_queue: None,
            events: 0,
            deletion_deferred: false,
            doomed: false,
            body: Some(body),
        });
        self.make_ready(cb.index, false);
    }

    /// Transition a task into the Ready state. A preempted task goes to the
    /// front of its priority level; everything else goes to the back.
    pub(crate) fn make_ready(&mut self, index: usize, front: bool) {
        let seq = if front {
            self.front_seq -= 1;
            self.front_seq
        } else {
            self.back_seq += 1;
            self.back_seq
        };
        let task = &mut self.tasks[index];
        task.st = TaskSt::Ready;
        task.ready_seq = seq;
    }

    /// Find the highest-priority Ready task.
    fn choose_next(&self) -> Option<usize> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| task.st == TaskSt::Ready)
            .min_by_key(|(_, task)| (task.priority, task.ready_seq))
            .map(|(index, _)| index)
    }

    fn next_deadline(&self) -> Option<u64> {
        self.tasks
            .iter()
            .filter(|task| task.st == TaskSt::Waiting)
            .filter_map(|task| task.wake_at)
            .min()
    }

    fn all_dead(&self) -> bool {
        self.tasks.iter().all(|task| task.st.is_dead())
    }

    /// Get a flag indicating whether the running task should relinquish the
    /// processor.
    pub(crate) fn is_preemption_pending(&self) -> bool {
        let Some(running) = self.running else {
            return false;
        };
        let running = &self.tasks[running];
        running.doomed
            || self
                .tasks
                .iter()
                .any(|task| task.st == TaskSt::Ready && task.priority < running.priority)
    }

    pub(crate) fn tick_count(&self) -> Ticks {
        // Wrapping is intentional
        self.tick as Ticks
    }

    /// Get the index of the running task.
    pub(crate) fn running_index(&self) -> usize {
        match self.running {
            Some(index) => index,
            None => unreachable!("no task is running"),
        }
    }
}

/// Choose the next task to run and mark it as Running. Advance the clock
/// while no task is Ready.
pub(crate) fn choose_running_task<Traits: PortInstance>(
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> Baton {
    let state = Traits::port_state();
    loop {
        {
            let mut sched = state.sched.write(&mut *lock);
            if let Some(index) = sched.choose_next() {
                sched.tasks[index].st = TaskSt::Running;
                sched.running = Some(index);
                log::trace!("dispatching {:?}", sched.tasks[index].cb.name);
                return Baton::Task(index);
            }

            sched.running = None;

            let Some(deadline) = sched.next_deadline() else {
                return Baton::Finished(if sched.all_dead() {
                    Outcome::Completed
                } else {
                    log::debug!("deadlock: {:#?}", sched.tasks);
                    Outcome::Deadlock
                });
            };

            log::trace!("idle; advancing the clock from {} to {}", sched.tick, deadline);
            sched.tick = sched.tick.max(deadline);
        }

        expire_timeouts::<Traits>(lock.borrow_mut());
    }
}

/// Wake up the tasks whose timeouts have expired.
fn expire_timeouts<Traits: PortInstance>(lock: CpuLockTokenRefMut<'_, Traits>) {
    let expired: Vec<usize> = {
        let sched = Traits::port_state().sched.read(&*lock);
        sched
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| {
                task.st == TaskSt::Waiting && task.wake_at.map_or(false, |at| at <= sched.tick)
            })
            .map(|(index, _)| index)
            .collect()
    };

    for index in expired {
        release_waiting_task::<Traits>(lock.borrow_mut(), index, WakeReason::Timeout);
    }
}

/// Remove a Waiting task from its wait queue (if any) and make it Ready.
pub(crate) fn release_waiting_task<Traits: PortInstance>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    index: usize,
    reason: WakeReason,
) {
    let state = Traits::port_state();
    let (cb, queue) = {
        let mut sched = state.sched.write(&mut *lock);
        let task = &mut sched.tasks[index];
        debug_assert_eq!(task.st, TaskSt::Waiting);
        (task.cb, task.pend_queue.take())
    };

    if let Some(queue) = queue {
        queue.remove(lock.borrow_mut(), cb);
    }

    let mut sched = state.sched.write(&mut *lock);
    let task = &mut sched.tasks[index];
    task.wake_at = None;
    task.wake_reason = Some(reason);
    sched.make_ready(index, false);
}

/// Remove a task that isn't running from the scheduler for good.
pub(crate) fn delete_inactive_task<Traits: PortInstance>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    index: usize,
) {
    let state = Traits::port_state();
    let (cb, queue) = {
        let mut sched = state.sched.write(&mut *lock);
        debug_assert_ne!(sched.running, Some(index));
        let task = &mut sched.tasks[index];
        task.st = TaskSt::Deleted;
        task.wake_at = None;
        (task.cb, task.pend_queue.take())
    };

    log::debug!("deleting {:?}", cb.name);

    if let Some(queue) = queue {
        queue.remove(lock, cb);
    }
}

/// Hand the processor over to the next task and block the calling thread
/// until `me` is dispatched again.
///
/// The caller must have already updated the state of `me`. CPU Lock is
/// released while the thread is blocked and reacquired before returning.
pub(crate) fn switch_away<Traits: PortInstance>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    me: usize,
) {
    let next = choose_running_task::<Traits>(lock);
    if next == Baton::Task(me) {
        return;
    }

    let state = Traits::port_state();
    state.release_cpu_lock_flag();
    state.hand_over(next);
    state.wait_for_turn(me);
    state.acquire_cpu_lock_flag();
}

#[allow(clippy::missing_safety_doc)]
impl<Traits: PortInstance> State<Traits> {
    pub fn running_task(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static TaskCb<Traits>> {
        let sched = self.sched.read(lock);
        sched.running.map(|index| sched.tasks[index].cb)
    }

    pub fn task_priority(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        task: &'static TaskCb<Traits>,
    ) -> usize {
        self.sched.read(lock).tasks[task.index].priority
    }

    pub fn task_base_priority(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        task: &'static TaskCb<Traits>,
    ) -> usize {
        self.sched.read(lock).tasks[task.index].base_priority
    }

    /// Change the effective priority of a task, repositioning it in its wait
    /// queue if necessary.
    pub fn set_task_priority(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        task: &'static TaskCb<Traits>,
        priority: usize,
    ) {
        let queue = {
            let mut sched = self.sched.write(&mut *lock);
            let entry = &mut sched.tasks[task.index];
            log::trace!(
                "effective priority of {:?}: {} -> {}",
                task.name,
                entry.priority,
                priority
            );
            entry.priority = priority;
            entry.pend_queue
        };

        if let Some(queue) = queue {
            queue.reposition(lock, task);
        }
    }

    pub fn tick_count(&'static self, lock: CpuLockTokenRefMut<'_, Traits>) -> Ticks {
        self.sched.read(lock).tick_count()
    }

    pub fn suspend_current_task(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        queue: &'static WaitQueue<Traits>,
        timeout: Timeout,
    ) -> WakeReason {
        self.wait_current_task(lock, Some(queue), timeout)
    }

    /// Block the running task until it's woken up by `wake_task`,
    /// `release_waiting_task`, or the timeout.
    pub(crate) fn wait_current_task(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        queue: Option<&'static WaitQueue<Traits>>,
        timeout: Timeout,
    ) -> WakeReason {
        let me = {
            let mut sched = self.sched.write(&mut *lock);
            let me = sched.running_index();
            let wake_at = match timeout {
                Timeout::Forever => None,
                Timeout::Ticks(ticks) => Some(sched.tick + u64::from(ticks)),
            };
            let task = &mut sched.tasks[me];
            task.st = TaskSt::Waiting;
            task.pend_queue = queue;
            task.wake_at = wake_at;
            task.wake_reason = None;
            me
        };

        switch_away::<Traits>(lock.borrow_mut(), me);

        match self.sched.write(&mut *lock).tasks[me].wake_reason.take() {
            Some(reason) => reason,
            None => unreachable!("resumed without a wake reason"),
        }
    }

    pub fn wake_task(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        task: &'static TaskCb<Traits>,
        reason: WakeReason,
    ) {
        let mut sched = self.sched.write(lock);
        let entry = &mut sched.tasks[task.index];
        debug_assert_eq!(entry.st, TaskSt::Waiting);
        entry.pend_queue = None;
        entry.wake_at = None;
        entry.wake_reason = Some(reason);
        sched.make_ready(task.index, false);
    }

    pub fn is_preemption_pending(&'static self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.sched.read(lock).is_preemption_pending()
    }

    /// Relinquish the processor if a higher-priority task is Ready, or carry
    /// out the running task's pending deletion.
    ///
    /// Precondition: CPU Lock inactive, task context
    pub unsafe fn yield_cpu(&'static self) {
        let Ok(mut lock) = kmutex::klock::lock_cpu::<Traits>() else {
            return;
        };

        let (me, doomed) = {
            let sched = self.sched.read(&lock);
            let me = sched.running_index();
            (me, sched.tasks[me].doomed)
        };

        if doomed {
            self.exit_current_task(lock);
        }

        self.sched.write(&mut lock).make_ready(me, true);
        switch_away::<Traits>(lock.borrow_mut(), me);
    }

    pub fn flush_deferred_deletion(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        task: &'static TaskCb<Traits>,
    ) {
        {
            let mut sched = self.sched.write(&mut *lock);
            let is_running = sched.running == Some(task.index);
            let entry = &mut sched.tasks[task.index];
            if !entry.deletion_deferred {
                return;
            }
            entry.deletion_deferred = false;

            if is_running {
                // Deleted by `yield_cpu` after the caller leaves CPU Lock
                log::debug!("{:?} will be deleted on leaving the kernel", task.name);
                entry.doomed = true;
                return;
            }
        }

        delete_inactive_task::<Traits>(lock, task.index);
    }

    pub fn send_events(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        task: &'static TaskCb<Traits>,
        events: EventBits,
    ) -> Result<(), kmutex::EventSendError> {
        let mut sched = self.sched.write(lock);
        let entry = &mut sched.tasks[task.index];
        if entry.st.is_dead() {
            log::debug!("can't send events {:#x} to {:?}", events, task.name);
            return Err(kmutex::EventSendError::EventSendFailed);
        }
        log::trace!("sending events {:#x} to {:?}", events, task.name);
        entry.events |= events;
        Ok(())
    }
}
