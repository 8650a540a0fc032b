//! Managed subprocess handle
//!
//! [`ProcessHandle`] wraps one spawned OS process together with its captured
//! output and the running list of descendant pids used at termination time.
//! Capture goes through unlinked temp files rather than pipes: chatty
//! daemons cannot deadlock on a full pipe buffer and output stays off the
//! heap.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{ProcessError, Result};
use crate::result::{ProcessResult, ShellResult};
use crate::terminator;

/// Short sleep after spawn so immediately forked workers become visible
/// before the first descendant snapshot.
const SETTLE_DELAY: Duration = Duration::from_millis(125);
/// Poll interval for run-to-completion invocations
const RUN_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Default run-to-completion deadline
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// What to spawn and how to stop it.
///
/// Plain data attached to a [`ProcessHandle`]; concrete CLI tools compose a
/// spec instead of subclassing anything.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Executable: absolute path, or a name resolved via `PATH`
    pub program: String,
    /// Base arguments passed on every invocation
    pub args: Vec<String>,
    /// Environment variables layered over the inherited environment
    pub env: HashMap<String, String>,
    /// Working directory (`None` = inherit)
    pub cwd: Option<PathBuf>,
    /// Prefer graceful termination over an immediate hard kill, giving the
    /// process a chance to flush e.g. coverage data
    pub slow_stop: bool,
    /// Deadline for [`ProcessHandle::run`]
    pub timeout: Duration,
}

impl SpawnSpec {
    /// Create a spec for the given program
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
            slow_stop: true,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set base arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Set the stop policy
    pub fn slow_stop(mut self, slow_stop: bool) -> Self {
        self.slow_stop = slow_stop;
        self
    }

    /// Set the run-to-completion deadline
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Handle over one spawned OS process.
///
/// Lifecycle: created → started → running → terminated. `terminate` is
/// idempotent; once it has run, the cached result is returned and no second
/// kill is attempted. Dropping a still-running handle hard-kills the tree as
/// a last resort.
pub struct ProcessHandle {
    spec: SpawnSpec,
    child: Option<Child>,
    pid: Option<u32>,
    children: Vec<u32>,
    stdout_capture: Option<std::fs::File>,
    stderr_capture: Option<std::fs::File>,
    cmdline: Option<Vec<String>>,
    result: Option<ProcessResult>,
}

impl ProcessHandle {
    /// Create a handle; nothing is spawned yet
    pub fn new(spec: SpawnSpec) -> Self {
        Self {
            spec,
            child: None,
            pid: None,
            children: Vec::new(),
            stdout_capture: None,
            stderr_capture: None,
            cmdline: None,
            result: None,
        }
    }

    /// The spec this handle was built from
    pub fn spec(&self) -> &SpawnSpec {
        &self.spec
    }

    /// Pid of the running process; `None` before start and after terminate
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Descendant pids known so far
    pub fn children(&self) -> &[u32] {
        &self.children
    }

    /// Whether the process is currently running
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Spawn the process as a long-lived daemon.
    ///
    /// Fails before spawning when the program cannot be resolved. After the
    /// settling delay an initial descendant snapshot is taken; the daemon
    /// may fork workers immediately.
    pub async fn start(&mut self) -> Result<()> {
        self.start_with_args(Vec::new()).await
    }

    async fn start_with_args(&mut self, extra_args: Vec<String>) -> Result<()> {
        if self.child.is_some() {
            warn!(pid = ?self.pid, "start called on an already running handle");
            return Ok(());
        }
        let program = self.resolve_program()?;
        let mut args = self.spec.args.clone();
        args.extend(extra_args);

        let mut cmdline = vec![program.display().to_string()];
        cmdline.extend(args.iter().cloned());

        let stdout_capture = tempfile::tempfile().map_err(ProcessError::Capture)?;
        let stderr_capture = tempfile::tempfile().map_err(ProcessError::Capture)?;

        let mut command = Command::new(&program);
        command
            .args(&args)
            .envs(&self.spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(
                stdout_capture.try_clone().map_err(ProcessError::Capture)?,
            ))
            .stderr(Stdio::from(
                stderr_capture.try_clone().map_err(ProcessError::Capture)?,
            ));
        if let Some(cwd) = &self.spec.cwd {
            command.current_dir(cwd);
        }

        info!(cmdline = ?cmdline, cwd = ?self.spec.cwd, "starting process");
        let child = command.spawn()?;

        self.pid = child.id();
        self.child = Some(child);
        self.stdout_capture = Some(stdout_capture);
        self.stderr_capture = Some(stderr_capture);
        self.cmdline = Some(cmdline);
        self.result = None;
        self.children.clear();

        sleep(SETTLE_DELAY).await;
        if let Some(pid) = self.pid {
            self.children = terminator::collect_children(pid);
            debug!(pid, children = ?self.children, "initial descendant snapshot");
        }
        Ok(())
    }

    /// Run the process to completion and return its decoded output.
    ///
    /// Polls for completion every 250 ms. On deadline the process tree is
    /// terminated first, then [`ProcessError::Timeout`] is returned carrying
    /// whatever partial output was captured. Extra arguments are appended to
    /// the spec's base arguments.
    pub async fn run<I, S>(&mut self, extra_args: I) -> Result<ShellResult>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let timeout = self.spec.timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        self.start_with_args(extra_args.into_iter().map(Into::into).collect())
            .await?;

        let mut timed_out = false;
        loop {
            if tokio::time::Instant::now() >= deadline {
                timed_out = true;
                break;
            }
            let exited = match self.child.as_mut() {
                Some(child) => child.try_wait().map_err(ProcessError::Spawn)?.is_some(),
                None => true,
            };
            if exited {
                break;
            }
            sleep(RUN_POLL_INTERVAL).await;
        }

        let result = self.terminate().await?;
        if timed_out {
            return Err(ProcessError::Timeout {
                seconds: timeout.as_secs(),
                result,
            });
        }
        Ok(ShellResult::from_process_result(result))
    }

    /// Terminate the process together with its descendant tree.
    ///
    /// Idempotent: a second call returns the cached result and performs no
    /// further kill attempt. A root that already exited still gets its
    /// carried children cleaned up; the parent exiting does not terminate
    /// unparented children.
    pub async fn terminate(&mut self) -> Result<ProcessResult> {
        let Some(mut child) = self.child.take() else {
            return match &self.result {
                Some(result) => Ok(result.clone()),
                None => Err(ProcessError::NotStarted),
            };
        };

        info!(pid = ?self.pid, "stopping process");
        // Let in-flight output land in the capture files.
        sleep(SETTLE_DELAY).await;

        // Refresh the descendant snapshot; workers may have forked since start.
        if let Some(pid) = self.pid {
            for descendant in terminator::collect_children(pid) {
                if !self.children.contains(&descendant) {
                    self.children.push(descendant);
                }
            }
        }

        // Capture the real exit status if the process already exited.
        let pre_status = child.try_wait().ok().flatten();

        if let Some(pid) = self.pid {
            terminator::terminate_process_tree(pid, &self.children, self.spec.slow_stop).await;
        }

        let status = match pre_status {
            Some(status) => status,
            None => child.wait().await.map_err(ProcessError::Spawn)?,
        };
        let exitcode = exit_code(&status);

        let stdout = read_capture(self.stdout_capture.take())?;
        let stderr = read_capture(self.stderr_capture.take())?;

        let result = ProcessResult::new(exitcode, stdout, stderr, self.cmdline.clone());
        info!(pid = ?self.pid, exitcode, output = %result, "terminated process");

        self.result = Some(result.clone());
        self.pid = None;
        self.children.clear();
        Ok(result)
    }

    fn resolve_program(&self) -> Result<PathBuf> {
        let path = Path::new(&self.spec.program);
        if path.is_absolute() {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(ProcessError::ScriptNotFound {
                program: self.spec.program.clone(),
            });
        }
        which::which(&self.spec.program).map_err(|_| ProcessError::ScriptNotFound {
            program: self.spec.program.clone(),
        })
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.child.is_some() {
            if let Some(pid) = self.pid {
                debug!(pid, "handle dropped while running; killing process tree");
                terminator::kill_tree_now(pid, &self.children);
            }
        }
    }
}

fn exit_code(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

fn read_capture(file: Option<std::fs::File>) -> Result<Option<String>> {
    let Some(mut file) = file else {
        return Ok(None);
    };
    file.seek(SeekFrom::Start(0)).map_err(ProcessError::Capture)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).map_err(ProcessError::Capture)?;
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_program_fails_before_spawn() {
        let mut handle = ProcessHandle::new(SpawnSpec::new("saltern-no-such-program"));
        match handle.start().await {
            Err(ProcessError::ScriptNotFound { program }) => {
                assert_eq!(program, "saltern-no-such-program");
            }
            other => panic!("expected ScriptNotFound, got {other:?}"),
        }
        assert!(handle.pid().is_none());
    }

    #[tokio::test]
    async fn missing_absolute_path_fails_before_spawn() {
        let mut handle = ProcessHandle::new(SpawnSpec::new("/no/such/path/anywhere"));
        assert!(matches!(
            handle.start().await,
            Err(ProcessError::ScriptNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn terminate_before_start_errors() {
        let mut handle = ProcessHandle::new(SpawnSpec::new("true"));
        assert!(matches!(
            handle.terminate().await,
            Err(ProcessError::NotStarted)
        ));
    }
}
