//! Event notification on release
//!
//! A task can register to receive a set of events whenever a mutex becomes
//! free (i.e., is released with no waiter to hand it over to). At most one
//! registration exists per mutex.
use core::fmt;

use crate::{
    error::EventSendError,
    klock::CpuLockTokenRefMut,
    mutex::{MutexCb, MutexOptions},
    KernelTraits,
};

/// A set of events. Each bit represents one event.
pub type EventBits = u32;

bitflags::bitflags! {
    /// Options for [`Mutex::register_event`](crate::Mutex::register_event).
    pub struct EventOptions: u8 {
        /// Clear the registration after the first delivery. Without this
        /// flag, the registration persists across deliveries.
        const SEND_ONCE = 1 << 0;
        /// If the mutex is free at the time of registration, deliver the
        /// events immediately.
        const SEND_IF_FREE = 1 << 1;
        /// Replace another task's registration instead of failing with
        /// `AlreadyRegistered`.
        const ALLOW_OVERWRITE = 1 << 2;
    }
}

/// A task's request to be notified when a mutex becomes free.
pub(crate) struct EventRegistration<Traits: KernelTraits> {
    pub(crate) task: &'static Traits::TaskCb,
    pub(crate) events: EventBits,
    pub(crate) options: EventOptions,
}

impl<Traits: KernelTraits> Clone for EventRegistration<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: KernelTraits> Copy for EventRegistration<Traits> {}

impl<Traits: KernelTraits> fmt::Debug for EventRegistration<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventRegistration")
            .field("task", &(self.task as *const Traits::TaskCb))
            .field("events", &self.events)
            .field("options", &self.options)
            .finish()
    }
}

/// Post the registered events for a mutex that has just become free.
///
/// A one-shot registration is cleared whether the delivery succeeds or not. A
/// persistent registration survives a successful delivery but not a failed
/// one, since the failure means the registered task can no longer receive
/// events.
///
/// A failure is only reported if the mutex was created with
/// [`MutexOptions::EVENTSEND_ERR_NOTIFY`].
pub(crate) fn deliver<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) -> Result<(), EventSendError> {
    let Some(registration) = mutex_cb.event.get(lock.borrow_mut()) else {
        return Ok(());
    };

    let result = Traits::send_events(lock.borrow_mut(), registration.task, registration.events);

    if result.is_err() || registration.options.contains(EventOptions::SEND_ONCE) {
        mutex_cb.event.replace(lock.borrow_mut(), None);
    }

    if mutex_cb
        .options
        .get(lock)
        .contains(MutexOptions::EVENTSEND_ERR_NOTIFY)
    {
        result
    } else {
        Ok(())
    }
}

/// Deliver the events to a registration that was just installed on a free
/// mutex. Unlike [`deliver`], failures are always reported and always undo
/// the registration.
pub(crate) fn deliver_on_register<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    registration: EventRegistration<Traits>,
) -> Result<(), EventSendError> {
    let result = Traits::send_events(lock.borrow_mut(), registration.task, registration.events);

    if result.is_err() || registration.options.contains(EventOptions::SEND_ONCE) {
        mutex_cb.event.replace(lock, None);
    }

    result
}
