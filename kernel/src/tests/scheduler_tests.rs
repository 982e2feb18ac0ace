/*
 * Process and Run-Queue Tests
 *
 * Creation properties (ids from 1, Loading state, distinct ids), FIFO
 * ordering of the run queue, the sleep/wake state machine, and immediate
 * wait on an already-dead process. These run before any process has been
 * switched to, so queue contents can be inspected directly without risking
 * an actual context switch.
 */

use crate::scheduler::{self, ProcessState, process};
use crate::tests::check;

pub fn run() -> (usize, usize) {
    let mut passed = 0;
    let mut failed = 0;

    let p1 = match process::create("selftest-a") {
        Ok(process) => process,
        Err(error) => {
            log::error!("process creation failed: {}", error);
            return (passed, failed + 1);
        }
    };

    let p2 = match process::create("selftest-b") {
        Ok(process) => process,
        Err(error) => {
            log::error!("process creation failed: {}", error);
            return (passed, failed + 1);
        }
    };

    unsafe {
        check((*p1).id.0 >= 1, "ids start at 1", &mut passed, &mut failed);
        check((*p1).id != (*p2).id, "distinct processes get distinct ids", &mut passed, &mut failed);
        check(
            (*p1).state == ProcessState::Loading,
            "fresh processes are Loading",
            &mut passed,
            &mut failed,
        );
        check(
            process::get((*p1).id) == Some(p1),
            "table lookup finds the record",
            &mut passed,
            &mut failed,
        );

        // FIFO: what goes in first comes out first.
        (*p1).state = ProcessState::Running;
        (*p2).state = ProcessState::Running;

        scheduler::enqueue_run(p1);
        scheduler::enqueue_run(p2);

        check(scheduler::dequeue_run() == p1, "dequeue returns p1 first", &mut passed, &mut failed);
        check(scheduler::dequeue_run() == p2, "dequeue returns p2 second", &mut passed, &mut failed);
        check(
            scheduler::dequeue_run().is_null(),
            "queue is empty afterwards",
            &mut passed,
            &mut failed,
        );

        // Sleep/wake: a sleeper re-enters the queue only via wake.
        (*p1).state = ProcessState::Sleeping;

        check(
            scheduler::dequeue_run().is_null(),
            "sleeper is not queued",
            &mut passed,
            &mut failed,
        );
        check(scheduler::wake((*p1).id), "wake reports the sleep", &mut passed, &mut failed);
        check(
            (*p1).state == ProcessState::Running,
            "wake transitions to Running",
            &mut passed,
            &mut failed,
        );
        check(!scheduler::wake((*p1).id), "second wake reports nothing", &mut passed, &mut failed);
        check(scheduler::dequeue_run() == p1, "woken process is queued once", &mut passed, &mut failed);
        check(
            scheduler::dequeue_run().is_null(),
            "woken process is queued exactly once",
            &mut passed,
            &mut failed,
        );

        // Waiting on an already-dead process returns its status at once.
        (*p2).state = ProcessState::Dead;
        (*p2).exit_status = 42;

        check(
            scheduler::wait_process((*p2).id) == Ok(42),
            "wait on a dead process returns immediately",
            &mut passed,
            &mut failed,
        );

        check(
            scheduler::wait_process(crate::scheduler::ProcessId(0xfffe)).is_err(),
            "wait on a bogus id errors",
            &mut passed,
            &mut failed,
        );

        // Leave no test process in a schedulable state.
        (*p1).state = ProcessState::Dead;
    }

    (passed, failed)
}
