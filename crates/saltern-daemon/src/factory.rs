//! Daemon startup with retries and readiness confirmation
//!
//! Starting a daemon is not done when `spawn` returns: the process must
//! prove it is actually serving. Readiness is confirmed by TCP
//! connectability of its check ports and/or by start events arriving at the
//! session's event listener. An attempt that fails its checks is terminated
//! and retried; only exhausted attempts surface as an error, carrying the
//! last captured output for diagnosis.

use std::time::Duration;

use chrono::{DateTime, Utc};
use saltern_events::EventListener;
use saltern_process::{ProcessHandle, ProcessResult, SpawnSpec};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::{DaemonError, Result};

/// Default deadline for one startup attempt
const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30);
/// Default number of startup attempts
const DEFAULT_MAX_ATTEMPTS: usize = 3;
/// Per-port connect deadline while confirming check ports
const PORT_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
/// Pause between check-port sweeps
const PORT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What to start and how to know it is ready.
#[derive(Debug, Clone)]
pub struct DaemonSpec {
    /// Identifier the daemon uses in its events
    pub daemon_id: String,
    /// How to spawn the daemon process
    pub spawn: SpawnSpec,
    /// Local ports that must accept a TCP connection before the daemon
    /// counts as started
    pub check_ports: Vec<u16>,
    /// `(daemon_id, tag_glob)` pairs that must arrive at the event listener
    /// before the daemon counts as started
    pub check_events: Vec<(String, String)>,
    /// Deadline for one startup attempt
    pub start_timeout: Duration,
    /// Startup attempts before giving up
    pub max_attempts: usize,
}

impl DaemonSpec {
    /// Create a spec for the given daemon
    pub fn new(daemon_id: impl Into<String>, spawn: SpawnSpec) -> Self {
        Self {
            daemon_id: daemon_id.into(),
            spawn,
            check_ports: Vec::new(),
            check_events: Vec::new(),
            start_timeout: DEFAULT_START_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Add a port readiness check
    pub fn check_port(mut self, port: u16) -> Self {
        self.check_ports.push(port);
        self
    }

    /// Add an event readiness check
    pub fn check_event(mut self, daemon_id: impl Into<String>, tag: impl Into<String>) -> Self {
        self.check_events.push((daemon_id.into(), tag.into()));
        self
    }

    /// Set the per-attempt startup deadline
    pub fn start_timeout(mut self, start_timeout: Duration) -> Self {
        self.start_timeout = start_timeout;
        self
    }

    /// Set the number of startup attempts
    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

/// A started, readiness-confirmed daemon.
///
/// Terminating the handle also unregisters the daemon's authentication
/// callback from the listener, so no callback outlives its daemon.
pub struct DaemonHandle {
    daemon_id: String,
    handle: ProcessHandle,
    listener: Option<EventListener>,
}

impl DaemonHandle {
    /// Identifier the daemon uses in its events
    pub fn daemon_id(&self) -> &str {
        &self.daemon_id
    }

    /// Pid of the daemon process, while running
    pub fn pid(&self) -> Option<u32> {
        self.handle.pid()
    }

    /// Whether the daemon process is still running
    pub fn is_running(&mut self) -> bool {
        self.handle.is_running()
    }

    /// Terminate the daemon and its process tree
    pub async fn terminate(&mut self) -> Result<ProcessResult> {
        if let Some(listener) = &self.listener {
            listener.unregister_auth_event_handler(&self.daemon_id);
        }
        Ok(self.handle.terminate().await?)
    }
}

/// Start a daemon and confirm its readiness, retrying on failure.
///
/// Each attempt spawns the process and waits up to the spec's start timeout
/// for every check port to accept a connection and every check event to
/// arrive. A failed attempt is terminated before the next one; once
/// attempts are exhausted, [`DaemonError::NotStarted`] carries the output
/// of the last attempt.
pub async fn start_daemon(
    spec: DaemonSpec,
    listener: Option<&EventListener>,
) -> Result<DaemonHandle> {
    if !spec.check_events.is_empty() && listener.is_none() {
        return Err(DaemonError::ListenerRequired {
            daemon_id: spec.daemon_id,
        });
    }

    let mut last_result = None;
    for attempt in 1..=spec.max_attempts.max(1) {
        info!(
            daemon_id = %spec.daemon_id,
            attempt,
            max_attempts = spec.max_attempts,
            "starting daemon"
        );
        let started_at = Utc::now();
        let mut handle = ProcessHandle::new(spec.spawn.clone());
        handle.start().await?;

        if confirm_ready(&spec, &mut handle, listener, started_at).await {
            info!(daemon_id = %spec.daemon_id, pid = ?handle.pid(), "daemon started");
            return Ok(DaemonHandle {
                daemon_id: spec.daemon_id,
                handle,
                listener: listener.cloned(),
            });
        }

        warn!(daemon_id = %spec.daemon_id, attempt, "daemon failed its readiness checks");
        match handle.terminate().await {
            Ok(result) => last_result = Some(result),
            Err(err) => warn!(
                daemon_id = %spec.daemon_id,
                error = %err,
                "failed to terminate unready daemon"
            ),
        }
    }

    Err(DaemonError::NotStarted {
        daemon_id: spec.daemon_id,
        attempts: spec.max_attempts.max(1),
        last_result,
    })
}

async fn confirm_ready(
    spec: &DaemonSpec,
    handle: &mut ProcessHandle,
    listener: Option<&EventListener>,
    started_at: DateTime<Utc>,
) -> bool {
    let deadline = Instant::now() + spec.start_timeout;

    let mut pending = spec.check_ports.clone();
    while !pending.is_empty() {
        if !handle.is_running() {
            debug!(daemon_id = %spec.daemon_id, "daemon exited during port checks");
            return false;
        }
        let mut unreachable = Vec::new();
        for port in pending {
            match timeout(PORT_CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await {
                Ok(Ok(_)) => debug!(daemon_id = %spec.daemon_id, port, "check port connectable"),
                _ => unreachable.push(port),
            }
        }
        pending = unreachable;
        if pending.is_empty() {
            break;
        }
        if Instant::now() >= deadline {
            debug!(daemon_id = %spec.daemon_id, ports = ?pending, "check ports never opened");
            return false;
        }
        sleep(PORT_POLL_INTERVAL).await;
    }

    if !spec.check_events.is_empty() {
        // Presence of a listener was validated before the first attempt.
        let Some(listener) = listener else {
            return false;
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        let matched = listener
            .wait_for_events(spec.check_events.clone(), remaining, Some(started_at))
            .await;
        if !matched.found_all_events() {
            debug!(
                daemon_id = %spec.daemon_id,
                missed = ?matched.missed(),
                "check events never arrived"
            );
            return false;
        }
    }
    true
}
