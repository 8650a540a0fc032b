//! End-to-end subprocess lifecycle tests against real OS processes.

#![cfg(unix)]

use std::time::{Duration, Instant};

use serde_json::json;
use saltern_process::{collect_children, ProcessError, ProcessHandle, SpawnSpec};

fn sh(script: &str) -> SpawnSpec {
    SpawnSpec::new("sh").args(["-c", script])
}

const NO_EXTRA_ARGS: Vec<String> = Vec::new();

/// True once the pid no longer exists (ESRCH). Zombies linger until reaped,
/// so allow a short grace period.
fn wait_gone(pid: u32, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        let gone = matches!(
            nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None),
            Err(nix::errno::Errno::ESRCH)
        );
        if gone {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

#[tokio::test]
async fn run_captures_stdout() {
    let mut handle = ProcessHandle::new(sh("printf foo"));
    let result = handle.run(NO_EXTRA_ARGS).await.expect("run");
    assert_eq!(result.exitcode(), 0);
    assert!(result == "foo");
}

#[tokio::test]
async fn run_captures_stderr_and_exitcode() {
    let mut handle = ProcessHandle::new(sh("printf err >&2; exit 3"));
    let result = handle.run(NO_EXTRA_ARGS).await.expect("run");
    assert_eq!(result.exitcode(), 3);
    assert_eq!(result.stderr(), Some("err"));
    assert!(result.stdout().is_none());
}

#[tokio::test]
async fn run_decodes_json_stdout() {
    let mut handle = ProcessHandle::new(sh(r#"printf '{"a": 1}'"#));
    let result = handle.run(NO_EXTRA_ARGS).await.expect("run");
    assert_eq!(result.json(), Some(&json!({"a": 1})));
    assert!(result == json!({"a": 1}));
}

#[tokio::test]
async fn run_appends_extra_args() {
    let spec = SpawnSpec::new("printf").args(["%s"]);
    let mut handle = ProcessHandle::new(spec);
    let result = handle.run(["from-extra"]).await.expect("run");
    assert!(result == "from-extra");
}

#[tokio::test]
async fn run_times_out_and_terminates_the_process() {
    let spec = sh("sleep 30").timeout(Duration::from_secs(1));
    let mut handle = ProcessHandle::new(spec);
    let started = Instant::now();
    let err = handle.run(NO_EXTRA_ARGS).await.expect_err("should time out");
    // Well before the sleep would have finished on its own.
    assert!(started.elapsed() < Duration::from_secs(15));
    match err {
        ProcessError::Timeout { seconds, result } => {
            assert_eq!(seconds, 1);
            // Killed by signal, so no conventional exit code.
            assert!(result.exitcode() != 0);
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert!(!handle.is_running());
}

#[tokio::test]
async fn terminate_is_idempotent_and_caches_the_result() {
    let mut handle = ProcessHandle::new(sh("sleep 30").slow_stop(false));
    handle.start().await.expect("start");
    let pid = handle.pid().expect("pid");

    let first = handle.terminate().await.expect("terminate");
    assert!(handle.pid().is_none());
    let second = handle.terminate().await.expect("second terminate");
    assert_eq!(first, second);
    assert!(wait_gone(pid, Duration::from_secs(2)));
}

#[tokio::test]
async fn terminate_with_already_exited_root_reports_real_exitcode() {
    let mut handle = ProcessHandle::new(sh("exit 0"));
    handle.start().await.expect("start");
    // Give the short-lived process time to exit on its own.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let result = handle.terminate().await.expect("terminate");
    assert_eq!(result.exitcode(), 0);
}

#[tokio::test]
async fn terminate_kills_the_whole_descendant_tree() {
    // Two primary children, each forking two secondary children.
    let script = r#"for i in 1 2; do sh -c "sleep 30 & sleep 30 & wait" & done; wait"#;
    let mut handle = ProcessHandle::new(sh(script).slow_stop(false));
    handle.start().await.expect("start");
    let pid = handle.pid().expect("pid");

    // Give the grandchildren time to appear beyond the settling delay.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let descendants = collect_children(pid);
    assert_eq!(
        descendants.len(),
        6,
        "expected 2 shells + 4 sleeps, got {descendants:?}"
    );

    handle.terminate().await.expect("terminate");
    assert!(wait_gone(pid, Duration::from_secs(3)));
    for descendant in descendants {
        assert!(
            wait_gone(descendant, Duration::from_secs(3)),
            "descendant {descendant} survived termination"
        );
    }
}

#[tokio::test]
async fn slow_stop_lets_the_process_exit_gracefully() {
    // The trap records the SIGTERM before exiting 42.
    let script = "trap 'exit 42' TERM; sleep 30 & wait";
    let mut handle = ProcessHandle::new(sh(script).slow_stop(true));
    handle.start().await.expect("start");
    let result = handle.terminate().await.expect("terminate");
    assert_eq!(result.exitcode(), 42);
}
