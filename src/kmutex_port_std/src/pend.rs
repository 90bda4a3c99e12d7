//! Wait queues
use kmutex::{
    klock::{CpuLockCell, CpuLockTokenRefMut},
    utils::Init,
    KernelTraits, PendQueue, QueueOrder,
};
use std::{fmt, ptr};

use crate::PortInstance;

/// A wait queue embedded in every mutex control block.
///
/// The queue remembers the order it was last inserted with so that it can
/// reposition a waiter whose priority changes.
pub struct WaitQueue<Traits: KernelTraits> {
    waiters: CpuLockCell<Traits, Vec<&'static Traits::TaskCb>>,
    order: CpuLockCell<Traits, QueueOrder>,
}

impl<Traits: KernelTraits> Init for WaitQueue<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        waiters: CpuLockCell::new(Vec::new()),
        order: Init::INIT,
    };
}

impl<Traits: PortInstance> fmt::Debug for WaitQueue<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field(
                "waiters",
                &self.waiters.debug_fmt_with_ref(|waiters, f| {
                    f.debug_list()
                        .entries(waiters.iter().map(|task| task.name))
                        .finish()
                }),
            )
            .field("order", &self.order)
            .finish()
    }
}

impl<Traits: PortInstance> WaitQueue<Traits> {
    /// Move `task` to the position its current effective priority calls for.
    /// Does nothing for a FIFO queue.
    pub(crate) fn reposition(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        task: &'static Traits::TaskCb,
    ) {
        if self.order.get(&*lock) == QueueOrder::TaskPriority
            && self.remove(lock.borrow_mut(), task)
        {
            self.insert(lock, task, QueueOrder::TaskPriority);
        }
    }
}

impl<Traits: PortInstance> PendQueue<Traits> for WaitQueue<Traits> {
    fn insert(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        task: &'static Traits::TaskCb,
        order: QueueOrder,
    ) {
        self.order.replace(&mut *lock, order);

        let position = {
            let waiters = self.waiters.read(&*lock);
            match order {
                QueueOrder::Fifo => waiters.len(),
                QueueOrder::TaskPriority => {
                    let sched = Traits::port_state().sched.read(&*lock);
                    let priority = sched.tasks[task.index].priority;
                    waiters
                        .iter()
                        .position(|waiter| sched.tasks[waiter.index].priority > priority)
                        .unwrap_or(waiters.len())
                }
            }
        };

        self.waiters.write(&mut *lock).insert(position, task);
    }

    fn remove_first(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static Traits::TaskCb> {
        let mut waiters = self.waiters.write(lock);
        if waiters.is_empty() {
            None
        } else {
            Some(waiters.remove(0))
        }
    }

    fn remove(&self, lock: CpuLockTokenRefMut<'_, Traits>, task: &'static Traits::TaskCb) -> bool {
        let mut waiters = self.waiters.write(lock);
        if let Some(position) = waiters.iter().position(|waiter| ptr::eq(*waiter, task)) {
            waiters.remove(position);
            true
        } else {
            false
        }
    }

    fn len(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> usize {
        self.waiters.read(lock).len()
    }
}
