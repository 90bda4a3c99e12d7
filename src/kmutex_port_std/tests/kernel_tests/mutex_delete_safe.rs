//! A task owning a delete-safe mutex is protected from deletion. The deletion
//! takes effect when the task releases the mutex for good.
//!
//! 1. (`seq`: 0 → 1, 0 ticks) `killer` starts sleeping.
//! 2. (`seq`: 1 → 2, 0 ticks) `task` takes the mutex twice and starts
//!    sleeping.
//! 3. (`seq`: 2 → 3, 5 ticks) `killer` wakes up and tries to delete `task`.
//!    The deletion is deferred. `killer` deletes `bystander` outright.
//! 4. (`seq`: 3 → 5, 10 ticks) `task` wakes up and gives the mutex twice. The
//!    second give deletes `task`.
//! 5. (`seq`: 5 → 6, 15 ticks) `killer` checks that `task` is gone and then
//!    deletes itself.
use kmutex::{Mutex, MutexOptions, System, TaskSafetyError, Timeout};
use kmutex_port_std::{sleep, DeleteOutcome, PortInstance, Task, TaskError, TaskSt};

use super::utils::{owner_of, SeqTracker};

pub fn run<Traits: PortInstance>() {
    static SEQ: SeqTracker = SeqTracker::new();

    let m = Mutex::<Traits>::create(MutexOptions::DELETE_SAFE).unwrap();

    let bystander = Task::<Traits>::build()
        .name("bystander")
        .priority(40)
        .start(move || {
            sleep::<Traits>(1000).unwrap();
            unreachable!("`bystander` should have been deleted while sleeping");
        })
        .unwrap();

    let task = Task::<Traits>::build()
        .name("task")
        .priority(20)
        .start(move || {
            let me = Task::<Traits>::current().unwrap().unwrap();

            SEQ.expect_and_replace(1, 2);
            m.take(Timeout::Forever).unwrap();
            m.take(Timeout::Forever).unwrap();

            // Counted once per ownership, not per nesting level
            assert_eq!(System::<Traits>::deletion_safe_depth(me.cb()), Ok(1));
            assert_eq!(m.info().unwrap().recursion, 1);

            sleep::<Traits>(10).unwrap();

            SEQ.expect_and_replace(3, 4);
            assert_eq!(me.is_deletion_pending(), Ok(true));

            m.give().unwrap();

            // Still the owner
            assert_eq!(owner_of(m), Some(me));
            assert_eq!(System::<Traits>::is_deletion_safe(me.cb()), Ok(true));
            assert_eq!(me.is_deletion_pending(), Ok(true));

            SEQ.expect_and_replace(4, 5);

            m.give().unwrap();
            unreachable!("`task` should have been deleted by the last give");
        })
        .unwrap();

    Task::<Traits>::build()
        .name("killer")
        .priority(10)
        .start(move || {
            let me = Task::<Traits>::current().unwrap().unwrap();

            SEQ.expect_and_replace(0, 1);
            sleep::<Traits>(5).unwrap();
            SEQ.expect_and_replace(2, 3);

            assert_eq!(task.delete(), Ok(DeleteOutcome::Deferred));
            assert_eq!(task.state(), Ok(TaskSt::Waiting));
            assert_eq!(task.is_deletion_pending(), Ok(true));

            assert_eq!(bystander.delete(), Ok(DeleteOutcome::Deleted));
            assert_eq!(bystander.state(), Ok(TaskSt::Deleted));
            assert_eq!(bystander.delete(), Err(TaskError::BadObjectState));

            sleep::<Traits>(10).unwrap();
            SEQ.expect_and_replace(5, 6);

            assert_eq!(task.state(), Ok(TaskSt::Deleted));
            assert_eq!(task.is_deletion_pending(), Ok(false));
            assert_eq!(task.delete(), Err(TaskError::BadObjectState));
            assert_eq!(System::<Traits>::is_deletion_safe(task.cb()), Ok(false));
            assert_eq!(m.is_locked(), Ok(false));

            // Explicit deletion safety
            System::<Traits>::task_safe().unwrap();
            System::<Traits>::task_safe().unwrap();
            assert_eq!(System::<Traits>::deletion_safe_depth(me.cb()), Ok(2));
            assert_eq!(me.delete(), Ok(DeleteOutcome::Deferred));
            System::<Traits>::task_unsafe().unwrap();
            assert_eq!(me.is_deletion_pending(), Ok(true));

            SEQ.expect_and_replace(6, 7);

            // The deferred deletion takes effect here
            System::<Traits>::task_unsafe().unwrap();
            unreachable!("`killer` should have been deleted by `task_unsafe`");
        })
        .unwrap();

    kmutex_port_std::run::<Traits>().unwrap();

    assert_eq!(SEQ.get(), 7);
    assert_eq!(
        System::<Traits>::task_unsafe(),
        Err(TaskSafetyError::RestrictedContext)
    );
}
