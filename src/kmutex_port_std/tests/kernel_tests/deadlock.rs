//! Two tasks taking two mutexes in the opposite orders deadlock. `run`
//! detects that nothing can make progress anymore.
use kmutex::{Mutex, MutexOptions, Timeout};
use kmutex_port_std::{sleep, PortInstance, RunError, Task, TaskSt};

use super::utils::{owner_of, SeqTracker};

pub fn run<Traits: PortInstance>() {
    static SEQ: SeqTracker = SeqTracker::new();

    let a = Mutex::<Traits>::create(MutexOptions::Q_PRIORITY | MutexOptions::INVERSION_SAFE)
        .unwrap();
    let b = Mutex::<Traits>::create(MutexOptions::Q_PRIORITY | MutexOptions::INVERSION_SAFE)
        .unwrap();

    let task1 = Task::<Traits>::build()
        .name("task1")
        .priority(10)
        .start(move || {
            SEQ.expect_and_replace(0, 1);
            a.take(Timeout::Forever).unwrap();
            sleep::<Traits>(1).unwrap();

            SEQ.expect_and_replace(2, 3);
            b.take(Timeout::Forever).unwrap();
            unreachable!();
        })
        .unwrap();

    let task2 = Task::<Traits>::build()
        .name("task2")
        .priority(20)
        .start(move || {
            SEQ.expect_and_replace(1, 2);
            b.take(Timeout::Forever).unwrap();
            a.take(Timeout::Forever).unwrap();
            unreachable!();
        })
        .unwrap();

    assert_eq!(kmutex_port_std::run::<Traits>(), Err(RunError::Deadlock));
    assert_eq!(SEQ.get(), 3);

    assert_eq!(task1.state(), Ok(TaskSt::Waiting));
    assert_eq!(task2.state(), Ok(TaskSt::Waiting));
    assert_eq!(owner_of(a), Some(task1));
    assert_eq!(owner_of(b), Some(task2));

    // `task2` inherited the priority of `task1`
    assert_eq!(task2.priority(), Ok(10));
}
