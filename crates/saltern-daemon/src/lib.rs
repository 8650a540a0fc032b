//! # saltern-daemon
//!
//! Daemon factory with retrying startup and readiness checks.
//!
//! ## Purpose
//!
//! Integration tests need daemons that are actually serving, not merely
//! spawned. This crate layers readiness confirmation over
//! `saltern-process`: a daemon counts as started only once its check ports
//! accept connections and its start events have reached the session's
//! `saltern-events` listener, with failed attempts terminated and retried.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use saltern_daemon::{start_daemon, DaemonSpec};
//! use saltern_events::EventListener;
//! use saltern_process::SpawnSpec;
//!
//! # async fn example() -> saltern_daemon::Result<()> {
//! # let listener = EventListener::new().map_err(|_| saltern_daemon::DaemonError::ListenerRequired { daemon_id: "master-1".into() })?;
//! let spec = DaemonSpec::new("master-1", SpawnSpec::new("salt-master"))
//!     .check_port(4506)
//!     .check_event("master-1", "salt/master/*/start");
//!
//! let mut daemon = start_daemon(spec, Some(&listener)).await?;
//! // ... run tests against the daemon ...
//! daemon.terminate().await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod factory;

pub use error::{DaemonError, Result};
pub use factory::{start_daemon, DaemonHandle, DaemonSpec};
