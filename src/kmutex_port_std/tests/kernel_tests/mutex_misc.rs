//! Validates error codes returned by mutex manipulation methods. Also,
//! checks miscellaneous properties of [`kmutex::Mutex`].
//!
//! 1. (`seq`: 0 → 1, 0 ticks) `task0` starts sleeping.
//! 2. (`seq`: 1 → 2, 0 ticks) `task1` takes `m2` twice and starts sleeping.
//! 3. (`seq`: 2 → 3, 1 tick) `task0` checks error codes.
//! 4. (`seq`: 3 → 4, 10 ticks) `task1` releases `m2`.
use kmutex::{
    klock, DestroyMutexError, EventOptions, GiveForceMutexError, GiveMutexError, Mutex,
    MutexOptions, QueryMutexError, RegisterEventError, ResultCode, System, TakeMutexError,
    TaskSafetyError, Timeout, UnregisterEventError,
};
use kmutex_port_std::{simulate_interrupt, sleep, PortInstance, Task};
use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

use super::utils::{owner_of, SeqTracker};

pub fn run<Traits: PortInstance>() {
    static SEQ: SeqTracker = SeqTracker::new();

    let m1 = Mutex::<Traits>::create(MutexOptions::Q_FIFO).unwrap();
    let m2 = Mutex::<Traits>::create(MutexOptions::Q_PRIORITY).unwrap();
    let m3 = Mutex::<Traits>::create(MutexOptions::DELETE_SAFE).unwrap();

    let task1 = Task::<Traits>::build()
        .name("task1")
        .priority(2)
        .start(move || {
            SEQ.expect_and_replace(1, 2);
            m2.take(Timeout::Forever).unwrap();
            m2.take(Timeout::Forever).unwrap();
            sleep::<Traits>(10).unwrap();

            SEQ.expect_and_replace(3, 4);
            m2.give().unwrap();
            m2.give().unwrap();
        })
        .unwrap();

    Task::<Traits>::build()
        .name("task0")
        .priority(1)
        .start(move || {
            SEQ.expect_and_replace(0, 1);
            sleep::<Traits>(1).unwrap();
            SEQ.expect_and_replace(2, 3);

            // `PartialEq`
            assert_ne!(m1, m2);
            assert_eq!(m1, m1);

            // `Hash`
            let hash = |x: Mutex<Traits>| {
                let mut hasher = DefaultHasher::new();
                x.hash(&mut hasher);
                hasher.finish()
            };
            assert_eq!(hash(m1), hash(m1));

            // Giving a mutex owned by another task
            assert_eq!(m2.give(), Err(GiveMutexError::NotOwner));
            assert_eq!(owner_of(m2), Some(task1));
            assert_eq!(m2.info().unwrap().recursion, 1);

            // Giving a free mutex
            assert_eq!(m1.give(), Err(GiveMutexError::NotOwner));
            assert_eq!(owner_of(m1), None);

            // Giving a mutex once too often
            m1.take(Timeout::Forever).unwrap();
            m1.give().unwrap();
            assert_eq!(m1.give(), Err(GiveMutexError::NotOwner));
            assert_eq!(m1.info().unwrap().recursion, 0);

            // `ResultCode`
            assert_eq!(
                ResultCode::from(GiveMutexError::NotOwner),
                ResultCode::NotOwner
            );
            assert!(ResultCode::from(TakeMutexError::Timeout).is_err());

            // Not deletion-safe
            assert_eq!(System::<Traits>::task_unsafe(), Err(TaskSafetyError::NotOwner));

            // CPU Lock active
            let lock = klock::lock_cpu::<Traits>().unwrap();
            assert_eq!(
                m1.take(Timeout::Forever),
                Err(TakeMutexError::RestrictedContext)
            );
            assert_eq!(m1.try_take(), Err(TakeMutexError::RestrictedContext));
            assert_eq!(m1.give(), Err(GiveMutexError::RestrictedContext));
            assert_eq!(m1.give_force(), Err(GiveForceMutexError::RestrictedContext));
            assert_eq!(m1.destroy(), Err(DestroyMutexError::RestrictedContext));
            assert_eq!(m1.is_locked(), Err(QueryMutexError::RestrictedContext));
            assert_eq!(
                Mutex::<Traits>::create(MutexOptions::Q_FIFO).map(|_| ()),
                Err(kmutex::CreateMutexError::RestrictedContext)
            );
            drop(lock);

            // Interrupt context
            simulate_interrupt::<Traits, _>(|| {
                assert_eq!(
                    m1.take(Timeout::NO_WAIT),
                    Err(TakeMutexError::RestrictedContext)
                );
                assert_eq!(m1.give(), Err(GiveMutexError::RestrictedContext));
                assert_eq!(m2.give_force(), Err(GiveForceMutexError::RestrictedContext));
                assert_eq!(m1.destroy(), Err(DestroyMutexError::RestrictedContext));
                assert_eq!(
                    m1.register_event(1, EventOptions::empty()),
                    Err(RegisterEventError::RestrictedContext)
                );
                assert_eq!(
                    m1.unregister_event(),
                    Err(UnregisterEventError::RestrictedContext)
                );
                assert_eq!(
                    System::<Traits>::task_safe(),
                    Err(TaskSafetyError::RestrictedContext)
                );

                // Queries are allowed
                assert_eq!(m1.is_locked(), Ok(false));
                assert_eq!(owner_of(m2), Some(task1));
            });

            // Destroyed mutex
            m3.destroy().unwrap();
            assert_eq!(m3.take(Timeout::Forever), Err(TakeMutexError::InvalidHandle));
            assert_eq!(m3.try_take(), Err(TakeMutexError::InvalidHandle));
            assert_eq!(m3.give(), Err(GiveMutexError::InvalidHandle));
            assert_eq!(m3.give_force(), Err(GiveForceMutexError::InvalidHandle));
            assert_eq!(m3.destroy(), Err(DestroyMutexError::InvalidHandle));
            assert_eq!(m3.is_locked(), Err(QueryMutexError::InvalidHandle));
            assert_eq!(m3.owner().err(), Some(QueryMutexError::InvalidHandle));
            assert!(m3.info().is_err());
            assert_eq!(
                m3.register_event(1, EventOptions::empty()),
                Err(RegisterEventError::InvalidHandle)
            );
            assert_eq!(
                m3.unregister_event(),
                Err(UnregisterEventError::InvalidHandle)
            );

            // Debug formatting must not deadlock
            log::debug!("m1 = {:?}", m1.cb());
            log::debug!("task1 = {:?}", task1.cb());
        })
        .unwrap();

    kmutex_port_std::run::<Traits>().unwrap();

    assert_eq!(SEQ.get(), 4);
}
