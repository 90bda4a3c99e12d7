//! A task owning two inversion-safe mutexes inherits the priorities of the
//! waiters of both, keeps the inherited priority until it releases the last
//! of them, and only ever has its effective priority raised by
//! [`Task::set_priority`] in the meantime.
//!
//! 1. (`seq`: 0 → 1, 0 ticks) `task_b` starts sleeping.
//! 2. (`seq`: 1 → 2, 0 ticks) `task_a` starts sleeping.
//! 3. (`seq`: 2 → 3, 0 ticks) `owner` takes `ma` and `mb` and starts sleeping.
//! 4. (`seq`: 3 → 4, 5 ticks) `task_a` blocks on `ma`.
//! 5. (`seq`: 4 → 5, 6 ticks) `task_b` blocks on `mb`.
//! 6. (`seq`: 5 → 6, 10 ticks) `owner` wakes up and gives `mb`. The priority
//!    inherited from `task_b` is retained.
//! 7. (`seq`: 6 → 7, 10 ticks) `owner` lowers its base priority, which
//!    doesn't lower the effective priority yet. `owner` gives `ma`.
//! 8. (`seq`: 7 → 8, 10 ticks) `task_b` preempts `owner`.
//! 9. (`seq`: 8 → 9, 10 ticks) `task_a` runs.
//! 10. (`seq`: 9 → 10, 10 ticks) `owner` resumes with the new base priority.
use kmutex::{Mutex, MutexOptions, System, Timeout};
use kmutex_port_std::{sleep, PortInstance, Task, TaskError};

use super::utils::{owner_of, SeqTracker};

pub fn run<Traits: PortInstance>() {
    static SEQ: SeqTracker = SeqTracker::new();

    let options = MutexOptions::Q_PRIORITY | MutexOptions::INVERSION_SAFE;
    let ma = Mutex::<Traits>::create(options).unwrap();
    let mb = Mutex::<Traits>::create(options).unwrap();

    let task_b = Task::<Traits>::build()
        .name("task_b")
        .priority(10)
        .start(move || {
            SEQ.expect_and_replace(0, 1);
            sleep::<Traits>(6).unwrap();
            SEQ.expect_and_replace(4, 5);

            mb.take(Timeout::Forever).unwrap();

            SEQ.expect_and_replace(7, 8);
            assert_eq!(owner_of(mb), Task::current().unwrap());
            mb.give().unwrap();
        })
        .unwrap();

    let task_a = Task::<Traits>::build()
        .name("task_a")
        .priority(20)
        .start(move || {
            SEQ.expect_and_replace(1, 2);
            sleep::<Traits>(5).unwrap();
            SEQ.expect_and_replace(3, 4);

            ma.take(Timeout::Forever).unwrap();

            SEQ.expect_and_replace(8, 9);
            ma.give().unwrap();
        })
        .unwrap();

    Task::<Traits>::build()
        .name("owner")
        .priority(30)
        .start(move || {
            let me = Task::<Traits>::current().unwrap().unwrap();
            let held = || System::<Traits>::held_inversion_safe_count(me.cb()).unwrap();

            SEQ.expect_and_replace(2, 3);
            ma.take(Timeout::Forever).unwrap();
            mb.take(Timeout::Forever).unwrap();
            assert_eq!(held(), 2);
            sleep::<Traits>(10).unwrap();

            SEQ.expect_and_replace(5, 6);
            assert_eq!(me.priority(), Ok(10));

            mb.give().unwrap();
            assert_eq!(owner_of(mb), Some(task_b));
            assert_eq!(held(), 1);
            // Still holding `ma`
            assert_eq!(me.priority(), Ok(10));

            SEQ.expect_and_replace(6, 7);

            // Lowering is postponed
            me.set_priority(40).unwrap();
            assert_eq!(me.priority(), Ok(10));
            assert_eq!(me.base_priority(), Ok(40));

            ma.give().unwrap();

            SEQ.expect_and_replace(9, 10);
            assert_eq!(held(), 0);
            assert_eq!(me.priority(), Ok(40));

            // Raising takes effect immediately
            ma.take(Timeout::Forever).unwrap();
            me.set_priority(35).unwrap();
            assert_eq!(me.priority(), Ok(35));
            me.set_priority(50).unwrap();
            assert_eq!(me.priority(), Ok(35));
            ma.give().unwrap();
            assert_eq!(me.priority(), Ok(50));

            // Without inversion-safe mutexes, changes are immediate
            me.set_priority(45).unwrap();
            assert_eq!(me.priority(), Ok(45));
        })
        .unwrap();

    kmutex_port_std::run::<Traits>().unwrap();

    assert_eq!(SEQ.get(), 10);
    assert_eq!(task_a.set_priority(1), Err(TaskError::BadObjectState));
}
