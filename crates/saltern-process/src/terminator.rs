//! Process-tree termination
//!
//! Reliably kills a process and every process descended from it, tolerating
//! races where children exit or reparent mid-termination. Descendants are
//! enumerated up front and unioned with any child list carried from spawn
//! time, since children reparented to init lose their lineage and cannot be
//! rediscovered later.

use std::time::Duration;

use sysinfo::{Pid, ProcessStatus, System};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Bounded wait after the graceful pass
const GRACEFUL_WAIT: Duration = Duration::from_secs(5);
/// Bounded wait after the hard-kill pass
const KILL_WAIT: Duration = Duration::from_secs(5);
/// Poll interval while waiting for signalled processes to disappear
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Collect the pids of every process descended from `root_pid`.
///
/// A root that already exited yields an empty list, not an error.
pub fn collect_children(root_pid: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes();

    let mut children: Vec<u32> = Vec::new();
    let mut frontier = vec![Pid::from_u32(root_pid)];
    while let Some(parent) = frontier.pop() {
        for (pid, process) in system.processes() {
            if process.parent() == Some(parent) && !children.contains(&pid.as_u32()) {
                children.push(pid.as_u32());
                frontier.push(*pid);
            }
        }
    }
    children
}

/// Terminate `root_pid` and all its descendants.
///
/// The live descendant snapshot is unioned with `known_children` before any
/// signal is sent. With `slow_stop` the tree first gets a graceful
/// termination signal and a bounded wait (letting e.g. coverage data flush),
/// otherwise it is killed outright. Anything still alive after the first
/// pass is hard-killed. Processes that exited on their own between
/// enumeration and signalling are expected and skipped silently.
///
/// Best effort by design: grandchildren forked after the last snapshot may
/// be missed, and a process ignoring SIGKILL is out of scope. Never blocks
/// longer than the bounded escalation waits.
pub async fn terminate_process_tree(root_pid: u32, known_children: &[u32], slow_stop: bool) {
    let mut targets: Vec<u32> = vec![root_pid];
    for &pid in known_children {
        if !targets.contains(&pid) {
            targets.push(pid);
        }
    }
    for pid in collect_children(root_pid) {
        if !targets.contains(&pid) {
            targets.push(pid);
        }
    }

    #[cfg(windows)]
    {
        use tokio::process::Command;

        debug!(root = root_pid, "killing process tree via taskkill");
        match Command::new("taskkill")
            .args(["/t", "/f", "/pid", &root_pid.to_string()])
            .output()
            .await
        {
            Ok(output) if !output.status.success() => {
                debug!(
                    root = root_pid,
                    exitcode = ?output.status.code(),
                    "taskkill reported failure; process may already be gone"
                );
            }
            Ok(_) => {}
            Err(err) => warn!(root = root_pid, error = %err, "failed to run taskkill"),
        }
        let _ = targets;
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::Signal;

        debug!(
            root = root_pid,
            targets = ?targets,
            slow_stop,
            "terminating process tree"
        );

        let first_signal = if slow_stop {
            Signal::SIGTERM
        } else {
            Signal::SIGKILL
        };
        let mut remaining = signal_pass(&targets, first_signal);
        remaining = wait_for_exit(remaining, GRACEFUL_WAIT).await;

        if !remaining.is_empty() {
            remaining = signal_pass(&remaining, Signal::SIGKILL);
            remaining = wait_for_exit(remaining, KILL_WAIT).await;
        }

        if !remaining.is_empty() {
            warn!(pids = ?remaining, "some processes failed to properly terminate");
        }
    }
}

/// Best-effort synchronous hard kill, for drop guards.
#[cfg(unix)]
pub(crate) fn kill_tree_now(root_pid: u32, known_children: &[u32]) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid as NixPid;

    let mut targets: Vec<u32> = vec![root_pid];
    targets.extend(known_children.iter().copied());
    for pid in collect_children(root_pid) {
        if !targets.contains(&pid) {
            targets.push(pid);
        }
    }
    for pid in targets {
        let _ = kill(NixPid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

#[cfg(windows)]
pub(crate) fn kill_tree_now(root_pid: u32, _known_children: &[u32]) {
    let _ = std::process::Command::new("taskkill")
        .args(["/t", "/f", "/pid", &root_pid.to_string()])
        .output();
}

#[cfg(unix)]
fn signal_pass(pids: &[u32], signal: nix::sys::signal::Signal) -> Vec<u32> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid as NixPid;

    let mut remaining = Vec::new();
    for &pid in pids {
        match kill(NixPid::from_raw(pid as i32), signal) {
            Ok(()) => {
                debug!(pid, signal = ?signal, "signalled process");
                remaining.push(pid);
            }
            // The process exited on its own between enumeration and the kill
            // attempt. Expected, not an error.
            Err(Errno::ESRCH) => {}
            Err(err) => {
                warn!(pid, error = %err, "failed to signal process");
                remaining.push(pid);
            }
        }
    }
    remaining
}

/// Poll until the given pids have exited or `timeout` elapses, returning
/// whatever is still alive. Zombies count as exited; they disappear once
/// their parent reaps them.
async fn wait_for_exit(mut pids: Vec<u32>, timeout: Duration) -> Vec<u32> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        pids = alive_pids(&pids);
        if pids.is_empty() || tokio::time::Instant::now() >= deadline {
            return pids;
        }
        sleep(EXIT_POLL_INTERVAL).await;
    }
}

fn alive_pids(pids: &[u32]) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes();
    pids.iter()
        .copied()
        .filter(|&pid| {
            system
                .process(Pid::from_u32(pid))
                .is_some_and(|process| process.status() != ProcessStatus::Zombie)
        })
        .collect()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn collect_children_of_dead_pid_is_empty() {
        // Pids wrap around well below this on every supported platform.
        assert!(collect_children(u32::MAX - 1).is_empty());
    }

    #[tokio::test]
    async fn terminate_tree_tolerates_already_exited_root() {
        let mut child = tokio::process::Command::new("true")
            .spawn()
            .expect("spawn true");
        let pid = child.id().expect("pid");
        let _ = child.wait().await;
        // Must return promptly and without error even though nothing is alive.
        terminate_process_tree(pid, &[], false).await;
    }
}
