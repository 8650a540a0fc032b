//! # saltern-events
//!
//! Networked event aggregation for daemon integration testing.
//!
//! ## Purpose
//!
//! Daemons under test emit events; test code asserts on them. This crate
//! provides the session-wide [`EventListener`] that collects pushed events
//! into a bounded, time-bounded store, the [`EventForwarder`] clients use to
//! push them, and the glob-based query/wait API tests drive.
//!
//! ## Features
//!
//! - **Listener service**: TCP receiver on an OS-assigned port with a fixed
//!   address, a janitor expiring stored events, and cooperative sentinel
//!   shutdown with bounded join deadlines
//! - **Pattern waits**: [`EventListener::wait_for_events`] polls the store
//!   until every `(daemon_id, tag_glob)` pair matches or a deadline passes,
//!   returning [`MatchedEvents`] rather than erroring on a partial result
//! - **Auth callbacks**: per-daemon callbacks fired on [`AUTH_EVENT_TAG`]
//!   events, registered and unregistered with the daemon lifecycle
//! - **Wire codec**: self-delimiting MessagePack frames with an incremental
//!   [`codec::FrameDecoder`] and a nil shutdown sentinel
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use saltern_events::EventListener;
//!
//! # async fn example() -> saltern_events::Result<()> {
//! let listener = EventListener::new()?;
//! listener.start().await?;
//!
//! // Hand listener.address() to the daemons under test, then:
//! let matched = listener
//!     .wait_for_events(
//!         [("master-1", "salt/master/*/start")],
//!         Duration::from_secs(30),
//!         None,
//!     )
//!     .await;
//! assert!(matched.found_all_events());
//!
//! listener.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod error;
pub mod event;
pub mod forwarder;
pub mod listener;

pub use error::{EventError, Result};
pub use event::{Event, MatchedEvents, PRIVATE_KEY_PREFIX};
pub use forwarder::EventForwarder;
pub use listener::{EventListener, ListenerConfig, AUTH_EVENT_TAG};
