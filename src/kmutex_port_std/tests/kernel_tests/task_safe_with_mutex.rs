//! `task_unsafe` only gives up the levels added by `task_safe`. The deletion
//! safety conferred by an owned delete-safe mutex lasts until the mutex is
//! released.
//!
//! 1. (`seq`: 0 → 1, 0 ticks) `killer` starts sleeping.
//! 2. (`seq`: 1 → 2, 0 ticks) `task` takes the mutex. `task_unsafe` is
//!    rejected until `task_safe` is called. `task` starts sleeping.
//! 3. (`seq`: 2 → 3, 5 ticks) `killer` wakes up and tries to delete `task`.
//!    The deletion is deferred.
//! 4. (`seq`: 3 → 5, 10 ticks) `task` wakes up, calls `task_safe`, and gives
//!    the mutex. It's still deletion-safe. `task_unsafe` deletes `task`.
//! 5. (`seq`: 5 → 6, 15 ticks) `killer` checks that `task` is gone.
use kmutex::{Mutex, MutexOptions, System, TaskSafetyError, Timeout};
use kmutex_port_std::{sleep, DeleteOutcome, PortInstance, Task, TaskSt};

use super::utils::{owner_of, SeqTracker};

pub fn run<Traits: PortInstance>() {
    static SEQ: SeqTracker = SeqTracker::new();

    let m = Mutex::<Traits>::create(MutexOptions::DELETE_SAFE).unwrap();

    let task = Task::<Traits>::build()
        .name("task")
        .priority(20)
        .start(move || {
            let me = Task::<Traits>::current().unwrap().unwrap();

            SEQ.expect_and_replace(1, 2);
            m.take(Timeout::Forever).unwrap();
            assert_eq!(System::<Traits>::deletion_safe_depth(me.cb()), Ok(1));

            // The mutex's level can't be given up this way
            assert_eq!(
                System::<Traits>::task_unsafe(),
                Err(TaskSafetyError::NotOwner)
            );
            assert_eq!(System::<Traits>::deletion_safe_depth(me.cb()), Ok(1));
            assert_eq!(owner_of(m), Some(me));

            System::<Traits>::task_safe().unwrap();
            assert_eq!(System::<Traits>::deletion_safe_depth(me.cb()), Ok(2));
            System::<Traits>::task_unsafe().unwrap();
            assert_eq!(System::<Traits>::deletion_safe_depth(me.cb()), Ok(1));
            assert_eq!(System::<Traits>::is_deletion_safe(me.cb()), Ok(true));

            assert_eq!(
                System::<Traits>::task_unsafe(),
                Err(TaskSafetyError::NotOwner)
            );
            assert_eq!(System::<Traits>::deletion_safe_depth(me.cb()), Ok(1));

            sleep::<Traits>(10).unwrap();

            SEQ.expect_and_replace(3, 4);
            assert_eq!(me.is_deletion_pending(), Ok(true));

            System::<Traits>::task_safe().unwrap();
            assert_eq!(System::<Traits>::deletion_safe_depth(me.cb()), Ok(2));

            // The explicit level keeps `task` alive
            m.give().unwrap();
            assert_eq!(m.is_locked(), Ok(false));
            assert_eq!(System::<Traits>::deletion_safe_depth(me.cb()), Ok(1));
            assert_eq!(me.is_deletion_pending(), Ok(true));

            SEQ.expect_and_replace(4, 5);

            System::<Traits>::task_unsafe().unwrap();
            unreachable!("`task` should have been deleted by `task_unsafe`");
        })
        .unwrap();

    Task::<Traits>::build()
        .name("killer")
        .priority(10)
        .start(move || {
            SEQ.expect_and_replace(0, 1);
            sleep::<Traits>(5).unwrap();
            SEQ.expect_and_replace(2, 3);

            assert_eq!(task.delete(), Ok(DeleteOutcome::Deferred));
            assert_eq!(task.state(), Ok(TaskSt::Waiting));

            sleep::<Traits>(10).unwrap();
            SEQ.expect_and_replace(5, 6);

            assert_eq!(task.state(), Ok(TaskSt::Deleted));
            assert_eq!(System::<Traits>::deletion_safe_depth(task.cb()), Ok(0));
            assert_eq!(m.is_locked(), Ok(false));
        })
        .unwrap();

    kmutex_port_std::run::<Traits>().unwrap();

    assert_eq!(SEQ.get(), 6);
}
