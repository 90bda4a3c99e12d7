//! Validates the option combinations accepted by [`kmutex::Mutex::create`]
//! and [`kmutex::Mutex::init`].
use kmutex::{
    CreateMutexError, DestroyMutexError, InitMutexError, Mutex, MutexCb, MutexOptions,
    QueueOrder, TakeMutexError, Timeout,
};
use kmutex_port_std::{PortInstance, Task};

use super::utils::owner_of;

pub fn run<Traits: PortInstance>() {
    // Inversion safety requires the priority queuing
    assert_eq!(
        Mutex::<Traits>::create(MutexOptions::INVERSION_SAFE),
        Err(CreateMutexError::InvalidOption)
    );
    assert_eq!(
        Mutex::<Traits>::create(
            MutexOptions::Q_FIFO | MutexOptions::INVERSION_SAFE | MutexOptions::DELETE_SAFE
        ),
        Err(CreateMutexError::InvalidOption)
    );

    let options = MutexOptions::Q_PRIORITY
        | MutexOptions::INVERSION_SAFE
        | MutexOptions::DELETE_SAFE
        | MutexOptions::EVENTSEND_ERR_NOTIFY;
    let m1 = Mutex::<Traits>::create(options).unwrap();
    let info = m1.info().unwrap();
    assert_eq!(info.options, options);
    assert_eq!(info.options.queue_order(), QueueOrder::TaskPriority);
    assert!(info.owner.is_none());
    assert_eq!(info.recursion, 0);
    assert_eq!(info.num_waiters, 0);
    assert!(!info.has_event_registration);

    // A caller-provided control block
    let cb: &'static MutexCb<Traits> = Box::leak(Box::new(MutexCb::new()));
    assert_eq!(
        Mutex::init(cb, MutexOptions::INVERSION_SAFE),
        Err(InitMutexError::InvalidOption)
    );
    let m2 = Mutex::init(cb, MutexOptions::Q_FIFO).unwrap();
    assert_eq!(m2.cb() as *const _, cb as *const _);
    assert_eq!(m2.is_locked(), Ok(false));

    // Mutating operations require a task context
    assert_eq!(m2.destroy(), Err(DestroyMutexError::RestrictedContext));
    assert_eq!(
        m2.take(Timeout::NO_WAIT),
        Err(TakeMutexError::RestrictedContext)
    );

    Task::<Traits>::build()
        .name("task0")
        .start(move || {
            m1.take(Timeout::Forever).unwrap();
            assert_eq!(owner_of(m1), Task::current().unwrap());
            m1.give().unwrap();

            // A destroyed control block can be initialized again
            m2.destroy().unwrap();
            assert!(m2.is_locked().is_err());
            let m2 = Mutex::init(cb, MutexOptions::Q_PRIORITY).unwrap();
            assert_eq!(m2.info().unwrap().options, MutexOptions::Q_PRIORITY);
            m2.try_take().unwrap();
            m2.give().unwrap();
        })
        .unwrap();

    kmutex_port_std::run::<Traits>().unwrap();
}
