//! Wait queues
use crate::{klock::CpuLockTokenRefMut, utils::Init, KernelTraits};

/// Specifies the sorting order of a wait queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueOrder {
    /// The wait queue is processed in a FIFO order.
    Fifo,
    /// The wait queue is processed in a task priority order. Tasks with the
    /// same priorities follow a FIFO order.
    TaskPriority,
}

impl Init for QueueOrder {
    const INIT: Self = Self::Fifo;
}

/// The reason a task blocked in
/// [`KernelTraits::suspend_current_task`] was resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WakeReason {
    /// The waited-for resource was handed over to the task.
    Granted,
    /// The timeout expired.
    Timeout,
    /// The wait was interrupted by a signal. The blocking operation restarts
    /// with the residual timeout.
    Interrupted,
    /// The object the task was waiting on was destroyed.
    Destroyed,
}

/// A wait queue, supplied by a port.
///
/// All methods are called with CPU Lock active.
pub trait PendQueue<Traits: KernelTraits>: Init + Send + Sync + 'static {
    /// Insert `task` into the queue. With [`QueueOrder::TaskPriority`], `task`
    /// is placed after all tasks having a higher or equal effective priority.
    fn insert(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        task: &'static Traits::TaskCb,
        order: QueueOrder,
    );

    /// Remove and return the first task in the queue.
    fn remove_first(&self, lock: CpuLockTokenRefMut<'_, Traits>)
        -> Option<&'static Traits::TaskCb>;

    /// Remove `task` from the queue. Returns `false` if it wasn't in the
    /// queue.
    fn remove(&self, lock: CpuLockTokenRefMut<'_, Traits>, task: &'static Traits::TaskCb)
        -> bool;

    /// Get the number of tasks in the queue.
    fn len(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> usize;

    /// Get a flag indicating whether the queue is empty.
    fn is_empty(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.len(lock) == 0
    }
}

/// Wake up all tasks in `queue` with `reason`.
pub(crate) fn wake_all<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    queue: &Traits::PendQueue,
    reason: WakeReason,
) {
    while let Some(task) = queue.remove_first(lock.borrow_mut()) {
        Traits::wake_task(lock.borrow_mut(), task, reason);
    }
}
