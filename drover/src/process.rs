//! Process utilities shared by the lock registry, scheduler, and supervisor.

use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Check if a process with the given PID is alive.
///
/// Sends the null signal (signal 0) and inspects the errno:
/// - `Ok(())` - process exists and we can signal it
/// - `EPERM` - process exists but we lack permission
/// - `ESRCH` - no such process
pub fn is_process_alive(pid: u32) -> bool {
    let pid_i32 = match i32::try_from(pid) {
        Ok(v) => v,
        Err(_) => return false,
    };

    match kill(Pid::from_raw(pid_i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => false,
    }
}

/// Outcome of a [`terminate_with_grace`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The process exited after SIGTERM within the grace period.
    Terminated,
    /// The process ignored SIGTERM and was SIGKILLed.
    Killed,
    /// The process was already gone, or survived even SIGKILL
    /// (zombie awaiting reap by its parent).
    Gone,
}

/// Gracefully terminate a process: SIGTERM, wait up to `grace`, then SIGKILL
/// and wait `post_kill_wait` before the final liveness check.
///
/// The caller is expected to hold whatever lock names this PID; this function
/// only delivers signals and polls. A child of the calling process must have
/// a concurrent waiter (the per-invocation monitor thread) or it will linger
/// as a zombie and still read as alive here.
pub fn terminate_with_grace(pid: u32, grace: Duration, post_kill_wait: Duration) -> TerminateOutcome {
    if !is_process_alive(pid) {
        return TerminateOutcome::Gone;
    }

    let nix_pid = match i32::try_from(pid) {
        Ok(v) => Pid::from_raw(v),
        Err(_) => return TerminateOutcome::Gone,
    };

    let _ = kill(nix_pid, Signal::SIGTERM);

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !is_process_alive(pid) {
            return TerminateOutcome::Terminated;
        }
        thread::sleep(Duration::from_millis(100));
    }

    let _ = kill(nix_pid, Signal::SIGKILL);
    thread::sleep(post_kill_wait);

    if is_process_alive(pid) {
        TerminateOutcome::Gone
    } else {
        TerminateOutcome::Killed
    }
}
