//! Priority inheritance isn't transitive. When the owner of a mutex is itself
//! blocked on another inversion-safe mutex, only the direct owner inherits
//! the waiter's priority.
//!
//! 1. (`seq`: 0 → 3, 0 ticks) `task_e` and `task_d` start sleeping. `task_c`
//!    takes `m1` and starts sleeping.
//! 2. (`seq`: 3 → 4, 5 ticks) `task_d` takes `m2` and blocks on `m1`.
//!    `task_c` inherits `task_d`'s priority.
//! 3. (`seq`: 4 → 5, 10 ticks) `task_e` blocks on `m2`. `task_d` inherits
//!    `task_e`'s priority, but `task_c` doesn't.
//! 4. (`seq`: 5 → 6, 20 ticks) `task_c` wakes up and gives `m1`.
//! 5. (`seq`: 6 → 7, 20 ticks) `task_d` preempts `task_c` and gives both
//!    mutexes.
//! 6. (`seq`: 7 → 8, 20 ticks) `task_e` preempts `task_d`.
//! 7. (`seq`: 8 → 10, 20 ticks) `task_d` and then `task_c` resume.
use kmutex::{Mutex, MutexOptions, System, Timeout};
use kmutex_port_std::{sleep, PortInstance, Task};

use super::utils::{owner_of, SeqTracker};

pub fn run<Traits: PortInstance>() {
    static SEQ: SeqTracker = SeqTracker::new();

    let options = MutexOptions::Q_PRIORITY | MutexOptions::INVERSION_SAFE;
    let m1 = Mutex::<Traits>::create(options).unwrap();
    let m2 = Mutex::<Traits>::create(options).unwrap();

    let task_e = Task::<Traits>::build()
        .name("task_e")
        .priority(10)
        .start(move || {
            SEQ.expect_and_replace(0, 1);
            sleep::<Traits>(10).unwrap();
            SEQ.expect_and_replace(4, 5);

            m2.take(Timeout::Forever).unwrap();

            SEQ.expect_and_replace(7, 8);
            assert_eq!(owner_of(m2), Task::current().unwrap());
            m2.give().unwrap();
        })
        .unwrap();

    let task_d = Task::<Traits>::build()
        .name("task_d")
        .priority(20)
        .start(move || {
            let me = Task::<Traits>::current().unwrap().unwrap();

            SEQ.expect_and_replace(1, 2);
            sleep::<Traits>(5).unwrap();
            SEQ.expect_and_replace(3, 4);

            m2.take(Timeout::Forever).unwrap();
            m1.take(Timeout::Forever).unwrap();

            SEQ.expect_and_replace(6, 7);
            assert_eq!(me.priority(), Ok(10));
            assert_eq!(
                System::<Traits>::held_inversion_safe_count(me.cb()),
                Ok(2)
            );

            m1.give().unwrap();
            assert_eq!(me.priority(), Ok(10));
            m2.give().unwrap();

            SEQ.expect_and_replace(8, 9);
            assert_eq!(me.priority(), Ok(20));
        })
        .unwrap();

    Task::<Traits>::build()
        .name("task_c")
        .priority(30)
        .start(move || {
            let me = Task::<Traits>::current().unwrap().unwrap();

            SEQ.expect_and_replace(2, 3);
            m1.take(Timeout::Forever).unwrap();
            sleep::<Traits>(20).unwrap();

            SEQ.expect_and_replace(5, 6);

            // Inherited from `task_d`, not from `task_e`
            assert_eq!(me.priority(), Ok(20));
            assert_eq!(task_d.priority(), Ok(10));
            assert_eq!(System::<Traits>::pending_mutex(task_d.cb()), Ok(Some(m1)));
            assert_eq!(System::<Traits>::pending_mutex(task_e.cb()), Ok(Some(m2)));
            assert_eq!(System::<Traits>::pending_mutex(me.cb()), Ok(None));

            m1.give().unwrap();

            SEQ.expect_and_replace(9, 10);
            assert_eq!(me.priority(), Ok(30));
        })
        .unwrap();

    kmutex_port_std::run::<Traits>().unwrap();

    assert_eq!(SEQ.get(), 10);
}
