use std::sync::{Mutex, MutexGuard};

use jobcrew::{Error, Subprocess, SubprocessSet};

// Signal-handler state is process-wide and the supervisor enforces a
// single live instance, so these tests must not overlap.
static SUPERVISOR_LOCK: Mutex<()> = Mutex::new(());

fn lock() -> MutexGuard<'static, ()> {
    SUPERVISOR_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn run_to_completion(set: &mut SubprocessSet) -> Subprocess {
    loop {
        if let Some(sub) = set.next_finished() {
            return sub;
        }
        assert!(!set.do_work().unwrap(), "unexpected interruption");
    }
}

#[test]
fn second_supervisor_is_rejected() {
    let _guard = lock();
    let set = SubprocessSet::new().unwrap();
    assert!(matches!(SubprocessSet::new(), Err(Error::SupervisorExists)));
    drop(set);

    // The slot frees up once the first supervisor is gone.
    let set = SubprocessSet::new().unwrap();
    drop(set);
}

#[cfg(unix)]
mod unix {
    use std::collections::HashMap;

    use jobcrew::ExitStatus;

    use super::*;

    #[test]
    fn captures_stdout() {
        let _guard = lock();
        let mut set = SubprocessSet::new().unwrap();
        set.add("echo hello", false).unwrap();

        let mut sub = run_to_completion(&mut set);
        assert!(sub.done());
        assert_eq!(sub.finish().unwrap(), ExitStatus::Success);
        assert_eq!(sub.stdout(), b"hello\n");
        assert!(sub.stderr().is_empty());
        assert_eq!(sub.combined_output(), b"hello\n");
    }

    #[test]
    fn captures_stderr_separately_and_combined() {
        let _guard = lock();
        let mut set = SubprocessSet::new().unwrap();
        set.add("echo out; echo err >&2", false).unwrap();

        let mut sub = run_to_completion(&mut set);
        assert_eq!(sub.finish().unwrap(), ExitStatus::Success);
        assert_eq!(sub.stdout(), b"out\n");
        assert_eq!(sub.stderr(), b"err\n");
        assert_eq!(
            sub.combined_output().len(),
            sub.stdout().len() + sub.stderr().len()
        );
    }

    #[test]
    fn failing_command_reports_its_exit_code() {
        let _guard = lock();
        let mut set = SubprocessSet::new().unwrap();
        set.add("exit 7", false).unwrap();

        let mut sub = run_to_completion(&mut set);
        assert_eq!(sub.finish().unwrap(), ExitStatus::Failure(7));
        assert!(sub.combined_output().is_empty());
    }

    #[test]
    fn missing_program_is_a_normal_failure() {
        let _guard = lock();
        let mut set = SubprocessSet::new().unwrap();
        set.add("definitely-not-a-real-binary-4471", false).unwrap();

        let mut sub = run_to_completion(&mut set);
        // The shell reports the lookup failure on stderr and exits 127.
        assert_eq!(sub.finish().unwrap(), ExitStatus::Failure(127));
        assert!(!sub.stderr().is_empty());
    }

    #[test]
    fn interrupt_in_child_is_reported() {
        let _guard = lock();
        let mut set = SubprocessSet::new().unwrap();
        set.add("kill -INT $$", false).unwrap();

        let mut sub = run_to_completion(&mut set);
        assert_eq!(sub.finish().unwrap(), ExitStatus::Interrupted);
    }

    #[test]
    fn termination_by_other_signals_is_a_failure() {
        let _guard = lock();
        let mut set = SubprocessSet::new().unwrap();
        set.add("kill -KILL $$", false).unwrap();

        let mut sub = run_to_completion(&mut set);
        assert_eq!(
            sub.finish().unwrap(),
            ExitStatus::Failure(128 + libc::SIGKILL)
        );
    }

    #[test]
    fn console_child_completes_via_reaping() {
        let _guard = lock();
        let mut set = SubprocessSet::new().unwrap();
        set.add("exit 0", true).unwrap();

        let mut sub = run_to_completion(&mut set);
        assert!(sub.done());
        assert!(sub.use_console());
        assert_eq!(sub.finish().unwrap(), ExitStatus::Success);
        assert!(sub.combined_output().is_empty());
    }

    #[test]
    fn many_subprocesses_all_complete() {
        let _guard = lock();
        let mut set = SubprocessSet::new().unwrap();

        let mut expected = HashMap::new();
        for i in 0..50 {
            let id = set.add(&format!("echo {}", i), false).unwrap();
            expected.insert(id, format!("{}\n", i));
        }

        for _ in 0..50 {
            let mut sub = run_to_completion(&mut set);
            assert!(sub.done());
            assert_eq!(sub.finish().unwrap(), ExitStatus::Success);
            let want = expected.remove(&sub.id()).unwrap();
            assert_eq!(sub.stdout(), want.as_bytes());
            assert_eq!(
                sub.combined_output().len(),
                sub.stdout().len() + sub.stderr().len()
            );
        }
        assert!(expected.is_empty());
        assert!(set.running().is_empty());
    }

    #[test]
    fn finished_queue_is_ordered_by_completion() {
        let _guard = lock();
        let mut set = SubprocessSet::new().unwrap();

        let slow = set.add("sleep 1; echo late", false).unwrap();
        let fast = set.add("echo early", false).unwrap();

        let mut first = run_to_completion(&mut set);
        assert_eq!(first.id(), fast);
        assert_eq!(first.finish().unwrap(), ExitStatus::Success);
        assert_eq!(first.stdout(), b"early\n");

        let mut second = run_to_completion(&mut set);
        assert_eq!(second.id(), slow);
        assert_eq!(second.finish().unwrap(), ExitStatus::Success);
        assert_eq!(second.stdout(), b"late\n");
    }

    #[test]
    fn large_interleaved_output_is_fully_captured() {
        let _guard = lock();
        let mut set = SubprocessSet::new().unwrap();

        // Well past the kernel pipe buffer on both streams.
        let line = "a".repeat(64);
        set.add(
            &format!(
                "i=0; while [ $i -lt 2000 ]; do echo {0}; echo {0} >&2; i=$((i+1)); done",
                line
            ),
            false,
        )
        .unwrap();

        let mut sub = run_to_completion(&mut set);
        assert_eq!(sub.finish().unwrap(), ExitStatus::Success);
        assert_eq!(sub.stdout().len(), 2000 * 65);
        assert_eq!(sub.stderr().len(), 2000 * 65);
        assert_eq!(
            sub.combined_output().len(),
            sub.stdout().len() + sub.stderr().len()
        );
    }

    #[test]
    fn clear_kills_running_children() {
        let _guard = lock();
        let mut set = SubprocessSet::new().unwrap();
        set.add("sleep 30", false).unwrap();
        set.add("sleep 30", false).unwrap();
        assert_eq!(set.running().len(), 2);

        // Must return promptly rather than waiting out the sleeps.
        set.clear();
        assert!(set.running().is_empty());
        assert!(set.next_finished().is_none());
    }
}

#[cfg(windows)]
mod windows {
    use jobcrew::ExitStatus;

    use super::*;

    #[test]
    fn captures_stdout() {
        let _guard = lock();
        let mut set = SubprocessSet::new().unwrap();
        set.add("cmd /c echo hello", false).unwrap();

        let mut sub = run_to_completion(&mut set);
        assert!(sub.done());
        assert_eq!(sub.finish().unwrap(), ExitStatus::Success);
        assert_eq!(String::from_utf8_lossy(sub.stdout()).trim(), "hello");
        assert!(sub.stderr().is_empty());
        assert_eq!(sub.combined_output(), sub.stdout());
    }

    #[test]
    fn exit_status_is_recorded_before_the_queue() {
        let _guard = lock();
        let mut set = SubprocessSet::new().unwrap();
        set.add("cmd /c exit 7", false).unwrap();

        let mut sub = run_to_completion(&mut set);
        // A popped subprocess is done, which includes its exit status.
        assert!(sub.done());
        assert_eq!(sub.finish().unwrap(), ExitStatus::Failure(7));
        assert!(sub.done());
    }

    #[test]
    fn missing_program_is_an_already_finished_failure() {
        let _guard = lock();
        let mut set = SubprocessSet::new().unwrap();
        set.add("definitely-not-a-real-binary-4471", false).unwrap();

        // No event-loop turn needed: the launch failure lands straight
        // in the finished queue.
        let mut sub = set.next_finished().unwrap();
        assert!(sub.done());
        assert!(!sub.stderr().is_empty());
        assert!(matches!(sub.finish().unwrap(), ExitStatus::Failure(_)));
    }

    #[test]
    fn console_child_completes_via_exit_wait() {
        let _guard = lock();
        let mut set = SubprocessSet::new().unwrap();
        set.add("cmd /c exit 0", true).unwrap();

        let mut sub = run_to_completion(&mut set);
        assert!(sub.done());
        assert!(sub.use_console());
        assert_eq!(sub.finish().unwrap(), ExitStatus::Success);
        assert!(sub.combined_output().is_empty());
    }

    #[test]
    fn clear_breaks_running_children() {
        let _guard = lock();
        let mut set = SubprocessSet::new().unwrap();
        set.add("cmd /c ping -n 30 127.0.0.1 >NUL", false).unwrap();
        assert_eq!(set.running().len(), 1);

        set.clear();
        assert!(set.running().is_empty());
        assert!(set.next_finished().is_none());
    }
}
