//! Mutexes
use core::{fmt, hash, ptr};

use crate::{
    error::{
        BadHandleError, DestroyMutexError, EventSendError, GiveForceMutexError,
        GiveMutexError, InitMutexError, QueryMutexError, RegisterEventError, TakeMutexError,
        UnregisterEventError,
    },
    event::{self, EventBits, EventOptions, EventRegistration},
    inherit,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    safety, state,
    task::{self, TaskRecord},
    timeout::{Deadline, Timeout},
    utils::Init,
    wait::{self, PendQueue, QueueOrder, WakeReason},
    KernelTraits,
};

bitflags::bitflags! {
    /// Options specified when a mutex is created.
    pub struct MutexOptions: u32 {
        /// Waiters are queued in the priority order. Without this flag, they
        /// are queued in the FIFO order.
        const Q_PRIORITY = 1 << 0;
        /// The owner can't be deleted while it owns the mutex.
        const DELETE_SAFE = 1 << 2;
        /// The owner inherits the priority of a higher-priority waiter.
        /// Requires [`Q_PRIORITY`](Self::Q_PRIORITY).
        const INVERSION_SAFE = 1 << 3;
        /// Report a failure to post the registered events to the caller of
        /// the release operation.
        const EVENTSEND_ERR_NOTIFY = 1 << 4;
    }
}

impl MutexOptions {
    /// Waiters are queued in the FIFO order. This is the default.
    pub const Q_FIFO: Self = Self::empty();

    /// Check the validity of the option combination.
    pub fn validate(self) -> Result<(), InitMutexError> {
        if self.contains(Self::INVERSION_SAFE) && !self.contains(Self::Q_PRIORITY) {
            Err(InitMutexError::InvalidOption)
        } else {
            Ok(())
        }
    }

    /// Get the order in which waiters are queued.
    pub fn queue_order(self) -> QueueOrder {
        if self.contains(Self::Q_PRIORITY) {
            QueueOrder::TaskPriority
        } else {
            QueueOrder::Fifo
        }
    }
}

impl Init for MutexOptions {
    const INIT: Self = Self::empty();
}

/// *Mutex control block* - the state data of a mutex.
///
/// A control block is inert until it's initialized by [`Mutex::init`]. After
/// [`Mutex::destroy`], it's inert again, and all handles referring to it
/// become invalid (operations fail with `InvalidHandle`).
pub struct MutexCb<Traits: KernelTraits> {
    /// `true` between initialization and destruction.
    pub(crate) valid: CpuLockCell<Traits, bool>,

    pub(crate) options: CpuLockCell<Traits, MutexOptions>,

    /// The task that currently owns the mutex.
    pub(crate) owning_task: CpuLockCell<Traits, Option<&'static Traits::TaskCb>>,

    /// The number of extra acquisitions made by the owner. `0` means the
    /// owner acquired the mutex once.
    pub(crate) recursion: CpuLockCell<Traits, usize>,

    pub(crate) wait_queue: Traits::PendQueue,

    pub(crate) event: CpuLockCell<Traits, Option<EventRegistration<Traits>>>,
}

impl<Traits: KernelTraits> Init for MutexCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        valid: Init::INIT,
        options: Init::INIT,
        owning_task: Init::INIT,
        recursion: Init::INIT,
        wait_queue: Init::INIT,
        event: Init::INIT,
    };
}

impl<Traits: KernelTraits> MutexCb<Traits> {
    /// Construct an uninitialized control block, to be placed in a `static`
    /// and passed to [`Mutex::init`].
    pub const fn new() -> Self {
        Self::INIT
    }
}

impl<Traits: KernelTraits> fmt::Debug for MutexCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MutexCb")
            .field("self", &(self as *const _))
            .field("valid", &self.valid)
            .field("options", &self.options)
            .field("recursion", &self.recursion)
            .field(
                "owning_task",
                // break infinite recursion (TaskCb → MutexCb → TaskCb → ...)
                &self.owning_task.debug_fmt_with_ref(|x, f| {
                    fmt::Debug::fmt(&x.map(|x| x as *const Traits::TaskCb), f)
                }),
            )
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

/// A snapshot of a mutex's state, returned by [`Mutex::info`].
pub struct MutexInfo<Traits: KernelTraits> {
    /// The owning task, if any.
    pub owner: Option<&'static Traits::TaskCb>,
    /// The number of extra acquisitions made by the owner.
    pub recursion: usize,
    /// The number of tasks waiting for the mutex.
    pub num_waiters: usize,
    pub options: MutexOptions,
    /// `true` if a task has registered for the mutex's events.
    pub has_event_registration: bool,
}

impl<Traits: KernelTraits> fmt::Debug for MutexInfo<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MutexInfo")
            .field("owner", &self.owner.map(|x| x as *const Traits::TaskCb))
            .field("recursion", &self.recursion)
            .field("num_waiters", &self.num_waiters)
            .field("options", &self.options)
            .field("has_event_registration", &self.has_event_registration)
            .finish()
    }
}

/// Represents a single mutex.
///
/// A mutex is owned by at most one task at a time. The owner can acquire it
/// again without blocking; it's released when the owner has released it as
/// many times as it acquired it.
///
/// <center>
///
#[doc = svgbobdoc::transform!(
/// ```svgbob
///                  take (by owner)
///                   give (nested)
///                      .----.
///                      |    |
///  .------.  take  .-------.<'   give (last),
///  | Free |------->| Owned |   waiter exists
///  '------'<-------'-------'<------------------.
///     |    give (last),  |  '-------------------'
///     |     no waiter    |
///     |                  |
///     | destroy          | destroy
///     v                  |
///  .-----------.         |
///  | Destroyed |<--------'
///  '-----------'
/// ```
)]
///
/// </center>
///
/// A `Mutex` is a handle. Copying it doesn't create a new mutex.
pub struct Mutex<Traits: KernelTraits>(&'static MutexCb<Traits>);

impl<Traits: KernelTraits> Clone for Mutex<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: KernelTraits> Copy for Mutex<Traits> {}

impl<Traits: KernelTraits> PartialEq for Mutex<Traits> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.0, other.0)
    }
}

impl<Traits: KernelTraits> Eq for Mutex<Traits> {}

impl<Traits: KernelTraits> hash::Hash for Mutex<Traits> {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        ptr::hash(self.0, state)
    }
}

impl<Traits: KernelTraits> fmt::Debug for Mutex<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Mutex")
            .field(&(self.0 as *const MutexCb<Traits>))
            .finish()
    }
}

impl<Traits: KernelTraits> Mutex<Traits> {
    #[inline]
    pub(crate) fn from_cb(cb: &'static MutexCb<Traits>) -> Self {
        Self(cb)
    }

    /// Get the control block this handle refers to.
    #[inline]
    pub fn cb(self) -> &'static MutexCb<Traits> {
        self.0
    }

    /// Initialize a mutex in the caller-provided control block `cb`.
    ///
    /// `cb` must not hold a live mutex.
    pub fn init(cb: &'static MutexCb<Traits>, options: MutexOptions) -> Result<Self, InitMutexError> {
        options.validate()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        init_mutex(lock.borrow_mut(), cb, options);
        Ok(Self(cb))
    }

    /// Allocate and initialize a mutex.
    ///
    /// The control block is never freed. A destroyed mutex's handle
    /// stays safe to use and reports `InvalidHandle`.
    #[cfg(feature = "alloc")]
    pub fn create(options: MutexOptions) -> Result<Self, crate::error::CreateMutexError> {
        options.validate()?;
        let cb = alloc::boxed::Box::leak(alloc::boxed::Box::new(MutexCb::INIT));
        Ok(Self::init(cb, options)?)
    }

    /// Acquire the mutex, blocking for at most `timeout`.
    ///
    /// If the calling task already owns the mutex, this increments the
    /// recursion count and returns immediately.
    ///
    /// If the wait is interrupted by a signal, the wait restarts with the
    /// residual timeout.
    pub fn take(self, timeout: Timeout) -> Result<(), TakeMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        expect_valid(lock.borrow_mut(), self.0)?;

        take_mutex(self.0, lock, timeout)
    }

    /// Acquire the mutex if it can be done without blocking. Fails with
    /// `Timeout` otherwise.
    #[inline]
    pub fn try_take(self) -> Result<(), TakeMutexError> {
        self.take(Timeout::NO_WAIT)
    }

    /// Release the mutex.
    ///
    /// The mutex is handed over to the first waiter, if any. If there are none,
    /// the mutex becomes free and the registered events (if any) are posted.
    pub fn give(self) -> Result<(), GiveMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        expect_valid(lock.borrow_mut(), self.0)?;

        give_mutex(self.0, lock)
    }

    /// Release the mutex regardless of who owns it or how many times it was
    /// acquired. Does nothing if the mutex is free.
    ///
    /// This is meant for recovering a mutex held by a task that can no longer
    /// release it, e.g., because it's dead.
    pub fn give_force(self) -> Result<(), GiveForceMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        expect_valid(lock.borrow_mut(), self.0)?;

        give_force_mutex(self.0, lock)
    }

    /// Destroy the mutex. All waiters are woken up and fail with `Destroyed`.
    ///
    /// If the mutex is owned, the owner's deletion-safety and priority
    /// inheritance bookkeeping for it is undone.
    pub fn destroy(self) -> Result<(), DestroyMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        expect_valid(lock.borrow_mut(), self.0)?;

        destroy_mutex(self.0, lock);
        Ok(())
    }

    /// Get a flag indicating whether the mutex is owned by a task.
    pub fn is_locked(self) -> Result<bool, QueryMutexError> {
        Ok(self.owner()?.is_some())
    }

    /// Get the task owning the mutex.
    pub fn owner(self) -> Result<Option<&'static Traits::TaskCb>, QueryMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        expect_valid(lock.borrow_mut(), self.0)?;
        Ok(self.0.owning_task.get(&lock))
    }

    /// Get a snapshot of the mutex's state.
    pub fn info(self) -> Result<MutexInfo<Traits>, QueryMutexError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        expect_valid(lock.borrow_mut(), self.0)?;
        let has_event_registration = self.0.event.read(&lock).is_some();
        let info = MutexInfo {
            owner: self.0.owning_task.get(&lock),
            recursion: self.0.recursion.get(&lock),
            num_waiters: self.0.wait_queue.len(lock.borrow_mut()),
            options: self.0.options.get(&lock),
            has_event_registration,
        };
        Ok(info)
    }

    /// Register the calling task to receive `events` when the mutex becomes
    /// free.
    pub fn register_event(
        self,
        events: EventBits,
        options: EventOptions,
    ) -> Result<(), RegisterEventError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        expect_valid(lock.borrow_mut(), self.0)?;

        register_event(self.0, lock.borrow_mut(), events, options)?;
        Ok(())
    }

    /// Remove the mutex's event registration. Any task can do this.
    pub fn unregister_event(self) -> Result<(), UnregisterEventError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        state::expect_task_context::<Traits>()?;
        expect_valid(lock.borrow_mut(), self.0)?;

        if self.0.event.replace(&mut lock, None).is_none() {
            Err(UnregisterEventError::NotRegistered)
        } else {
            Ok(())
        }
    }
}

/// Return `Err(InvalidHandle)` if `mutex_cb` doesn't hold a live mutex.
#[inline]
fn expect_valid<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
) -> Result<(), BadHandleError> {
    if mutex_cb.valid.get(lock) {
        Ok(())
    } else {
        Err(BadHandleError::InvalidHandle)
    }
}

fn init_mutex<Traits: KernelTraits>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    mutex_cb: &'static MutexCb<Traits>,
    options: MutexOptions,
) {
    debug_assert!(!mutex_cb.valid.get(lock.borrow_mut()), "mutex is already live");
    debug_assert!(mutex_cb.wait_queue.is_empty(lock.borrow_mut()));

    mutex_cb.options.replace(lock.borrow_mut(), options);
    mutex_cb.owning_task.replace(lock.borrow_mut(), None);
    mutex_cb.recursion.replace(lock.borrow_mut(), 0);
    mutex_cb.event.replace(lock.borrow_mut(), None);
    mutex_cb.valid.replace(lock, true);
}

/// Check if the calling task can acquire the mutex right now.
///
/// If it can, this function updates the mutex and returns `true`. Otherwise,
/// it returns `false`, indicating the calling task should be blocked.
#[inline]
fn poll_core<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    running_task: &'static Traits::TaskCb,
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> bool {
    match mutex_cb.owning_task.get(lock.borrow_mut()) {
        None => {
            lock_core(mutex_cb, running_task, lock);
            true
        }
        Some(owner) if ptr::eq(owner, running_task) => {
            *mutex_cb.recursion.write(lock) += 1;
            true
        }
        Some(_) => false,
    }
}

/// Give the ownership of the free mutex to `task`.
fn lock_core<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    task: &'static Traits::TaskCb,
    lock: CpuLockTokenRefMut<'_, Traits>,
) {
    debug_assert_eq!(mutex_cb.recursion.get(lock.borrow_mut()), 0);

    mutex_cb.owning_task.replace(lock.borrow_mut(), Some(task));

    let options = mutex_cb.options.get(lock.borrow_mut());
    if options.contains(MutexOptions::DELETE_SAFE) {
        safety::acquire(lock.borrow_mut(), task);
    }
    if options.contains(MutexOptions::INVERSION_SAFE) {
        inherit::acquire(lock, task);
    }
}

fn take_mutex<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
    timeout: Timeout,
) -> Result<(), TakeMutexError> {
    let running_task = task::current_task(lock.borrow_mut())?;
    let deadline = Deadline::new(Traits::tick_count(lock.borrow_mut()), timeout);

    loop {
        if poll_core(mutex_cb, running_task, lock.borrow_mut()) {
            return Ok(());
        }

        let timeout = deadline.remaining(Traits::tick_count(lock.borrow_mut()));
        if timeout.is_no_wait() {
            return Err(TakeMutexError::Timeout);
        }

        match wait_for_ownership(mutex_cb, running_task, lock.borrow_mut(), timeout) {
            WakeReason::Granted => {
                // The wake-upper made us the owner by `lock_core`
                debug_assert!(ptr::eq(
                    ptr_from_option_ref(mutex_cb.owning_task.get(&lock)),
                    running_task
                ));
                return Ok(());
            }
            WakeReason::Timeout => return Err(TakeMutexError::Timeout),
            WakeReason::Destroyed => return Err(TakeMutexError::Destroyed),
            WakeReason::Interrupted => {
                // Restart with the residual timeout. The mutex might have been
                // destroyed in the meantime.
                expect_valid(lock.borrow_mut(), mutex_cb)?;
            }
        }
    }
}

/// Block the calling task until it's given the ownership of the mutex (or the
/// wait ends for another reason).
///
/// If the mutex is inversion-safe, the owner's priority is raised in the same
/// critical section before the caller is suspended.
fn wait_for_ownership<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    running_task: &'static Traits::TaskCb,
    lock: CpuLockTokenRefMut<'_, Traits>,
    timeout: Timeout,
) -> WakeReason {
    let options = mutex_cb.options.get(lock.borrow_mut());
    let inversion_safe = options.contains(MutexOptions::INVERSION_SAFE);

    mutex_cb
        .wait_queue
        .insert(lock.borrow_mut(), running_task, options.queue_order());

    if inversion_safe {
        running_task
            .mutex_state()
            .pending_mutex
            .replace(lock.borrow_mut(), Some(mutex_cb));

        if let Some(owner) = mutex_cb.owning_task.get(lock.borrow_mut()) {
            inherit::elevate_owner(lock.borrow_mut(), owner, running_task);
        }
    }

    let reason = Traits::suspend_current_task(lock.borrow_mut(), &mutex_cb.wait_queue, timeout);

    if inversion_safe {
        // `Granted` already cleared it in `hand_over`
        running_task.mutex_state().pending_mutex.replace(lock, None);
    }

    reason
}

fn give_mutex<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
) -> Result<(), GiveMutexError> {
    let running_task = task::current_task(lock.borrow_mut())?;

    if ptr_from_option_ref(mutex_cb.owning_task.get(&lock)) != running_task as *const _ {
        // The current task does not currently own the mutex.
        return Err(GiveMutexError::NotOwner);
    }

    {
        let mut recursion = mutex_cb.recursion.write(&mut lock);
        if *recursion > 0 {
            *recursion -= 1;
            return Ok(());
        }
    }

    let result = release_mutex(mutex_cb, running_task, lock.borrow_mut());

    task::unlock_cpu_and_check_preemption(lock);

    Ok(result?)
}

fn give_force_mutex<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
) -> Result<(), GiveForceMutexError> {
    let Some(owner) = mutex_cb.owning_task.get(&lock) else {
        return Ok(());
    };

    // Discarding the nested acquisitions is equivalent to calling `give`
    // repeatedly, whoever the owner is.
    mutex_cb.recursion.replace(&mut lock, 0);

    let result = release_mutex(mutex_cb, owner, lock.borrow_mut());

    task::unlock_cpu_and_check_preemption(lock);

    Ok(result?)
}

/// Undo the owner's bookkeeping and pass the mutex on.
///
/// This method may make a task Ready, but doesn't yield the processor.
/// Call `unlock_cpu_and_check_preemption` after this.
fn release_mutex<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    owner: &'static Traits::TaskCb,
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> Result<(), EventSendError> {
    debug_assert_eq!(mutex_cb.recursion.get(lock.borrow_mut()), 0);

    let options = mutex_cb.options.get(lock.borrow_mut());
    if options.contains(MutexOptions::DELETE_SAFE) {
        safety::release(lock.borrow_mut(), owner);
    }
    if options.contains(MutexOptions::INVERSION_SAFE) {
        inherit::release(lock.borrow_mut(), owner);
    }

    hand_over(mutex_cb, lock)
}

/// Give the mutex to the next waiter or, if there's none, make it free.
fn hand_over<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    lock: CpuLockTokenRefMut<'_, Traits>,
) -> Result<(), EventSendError> {
    mutex_cb.owning_task.replace(lock.borrow_mut(), None);

    // Check if there's any other tasks waiting on the mutex
    if let Some(next_task) = mutex_cb.wait_queue.remove_first(lock.borrow_mut()) {
        next_task
            .mutex_state()
            .pending_mutex
            .replace(lock.borrow_mut(), None);

        // Give the ownership of the mutex to `next_task`
        lock_core(mutex_cb, next_task, lock.borrow_mut());

        // Wake up the next waiter
        Traits::wake_task(lock, next_task, WakeReason::Granted);
        Ok(())
    } else {
        // There's no one waiting
        event::deliver(lock, mutex_cb)
    }
}

fn destroy_mutex<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    mut lock: klock::CpuLockGuard<Traits>,
) {
    mutex_cb.valid.replace(&mut lock, false);

    if let Some(owner) = mutex_cb.owning_task.replace(&mut lock, None) {
        let options = mutex_cb.options.get(&lock);
        if options.contains(MutexOptions::DELETE_SAFE) {
            safety::release(lock.borrow_mut(), owner);
        }
        if options.contains(MutexOptions::INVERSION_SAFE) {
            inherit::release(lock.borrow_mut(), owner);
        }
    }

    mutex_cb.recursion.replace(&mut lock, 0);
    mutex_cb.event.replace(&mut lock, None);

    wait::wake_all(lock.borrow_mut(), &mutex_cb.wait_queue, WakeReason::Destroyed);

    task::unlock_cpu_and_check_preemption(lock);
}

fn register_event<Traits: KernelTraits>(
    mutex_cb: &'static MutexCb<Traits>,
    lock: CpuLockTokenRefMut<'_, Traits>,
    events: EventBits,
    options: EventOptions,
) -> Result<(), RegisterEventError> {
    let running_task = task::current_task(lock.borrow_mut())?;

    if let Some(existing) = mutex_cb.event.get(lock.borrow_mut()) {
        if !ptr::eq(existing.task, running_task)
            && !options.contains(EventOptions::ALLOW_OVERWRITE)
        {
            return Err(RegisterEventError::AlreadyRegistered);
        }
    }

    let registration = EventRegistration {
        task: running_task,
        events,
        options,
    };
    mutex_cb.event.replace(lock.borrow_mut(), Some(registration));

    if options.contains(EventOptions::SEND_IF_FREE)
        && mutex_cb.owning_task.get(lock.borrow_mut()).is_none()
    {
        event::deliver_on_register(lock, mutex_cb, registration)?;
    }

    Ok(())
}

#[inline]
fn ptr_from_option_ref<T>(x: Option<&T>) -> *const T {
    if let Some(x) = x {
        x
    } else {
        core::ptr::null()
    }
}
