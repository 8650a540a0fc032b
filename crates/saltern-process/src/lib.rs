//! # saltern-process
//!
//! **Purpose**: Subprocess lifecycle management for daemon integration testing
//!
//! Provides spawning with deadlock-free output capture, run-to-completion
//! invocations with timeout semantics, and reliable termination of whole
//! process trees.
//!
//! ## Features
//!
//! - **Process Spawning**: daemon-style `start` and synchronous `run` with a
//!   shared spec, output captured to unlinked temp files
//! - **Descendant Tracking**: a running child-pid list carried from spawn
//!   time so reparented children are still terminated
//! - **Tree Termination**: graceful-then-hard escalation with bounded waits,
//!   tolerant of processes that exit mid-kill
//! - **Result Values**: immutable [`ProcessResult`]/[`ShellResult`] with
//!   JSON decoding and assertion-friendly equality
//!
//! ## Usage
//!
//! ```rust,no_run
//! use saltern_process::{ProcessHandle, SpawnSpec};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let spec = SpawnSpec::new("echo").args(["hello"]);
//! let mut handle = ProcessHandle::new(spec);
//! let result = handle.run(Vec::<String>::new()).await?;
//! assert_eq!(result.exitcode(), 0);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod handle;
pub mod result;
pub mod terminator;

pub use error::{ProcessError, Result};
pub use handle::{ProcessHandle, SpawnSpec};
pub use result::{ProcessResult, ShellResult};
pub use terminator::{collect_children, terminate_process_tree};
