//! Event listener service
//!
//! A long-lived service receiving events pushed by every daemon started for
//! a test session. A receiver task decodes incoming frames into a bounded,
//! time-bounded store; a janitor task expires old events; test code queries
//! the store or block-waits for pattern matches.
//!
//! Shutdown is cooperative: `stop` pushes a sentinel frame at the
//! listener's own endpoint to unblock the receiver rather than tearing the
//! task down from outside, then joins everything with bounded timeouts so a
//! misbehaving task can never hang session teardown.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, info, warn};

use crate::codec::{encode_sentinel, EventFrame, Frame, FrameDecoder};
use crate::error::{EventError, Result};
use crate::event::{Event, MatchedEvents};

/// Tag identifying authentication events, which trigger registered callbacks
pub const AUTH_EVENT_TAG: &str = "salt/auth";

/// Default time events stay in the store before the janitor removes them
const DEFAULT_TTL: Duration = Duration::from_secs(120);
/// Default maximum number of stored events; oldest evicted first
const DEFAULT_STORE_CAPACITY: usize = 10_000;
/// How often the janitor scans for expired events
const JANITOR_INTERVAL: Duration = Duration::from_secs(30);
/// Poll interval for `wait_for_events`
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// How long `start` waits for the receiver to signal readiness
const READY_TIMEOUT: Duration = Duration::from_secs(5);
/// How long `stop` waits for the receiver to acknowledge the sentinel
const ACK_TIMEOUT: Duration = Duration::from_secs(2);
/// Bounded join deadline per background task at shutdown
const JOIN_TIMEOUT: Duration = Duration::from_secs(7);
/// Backoff before re-establishing a failed receive endpoint
const REBIND_BACKOFF: Duration = Duration::from_millis(500);

// Shared so a callback can be invoked without holding the registry lock.
type AuthCallback = Arc<dyn Fn(&Map<String, Value>) + Send + Sync + 'static>;

/// Tuning knobs for an [`EventListener`]
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Event time-to-live in the store
    pub ttl: Duration,
    /// Maximum number of stored events
    pub store_capacity: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            store_capacity: DEFAULT_STORE_CAPACITY,
        }
    }
}

impl ListenerConfig {
    /// Set the event time-to-live
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the store capacity. A capacity of zero stores nothing; auth
    /// callbacks still fire.
    pub fn store_capacity(mut self, capacity: usize) -> Self {
        self.store_capacity = capacity;
        self
    }
}

/// State shared with the background tasks
struct Shared {
    ttl: Duration,
    capacity: usize,
    store: Mutex<VecDeque<Event>>,
    auth_handlers: Mutex<HashMap<String, AuthCallback>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Created,
    Running,
    Stopped,
}

struct ListenerState {
    phase: Phase,
    std_listener: Option<std::net::TcpListener>,
    receiver: Option<JoinHandle<()>>,
    janitor: Option<JoinHandle<()>>,
}

struct Inner {
    shared: Arc<Shared>,
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    ack: Arc<Notify>,
    state: tokio::sync::Mutex<ListenerState>,
}

/// The event aggregation service for one test session.
///
/// Cheaply cloneable; clones share the endpoint, store and state. The
/// endpoint address is fixed at construction and immutable for the
/// listener's lifetime. States: created → running → stopped (terminal);
/// starting twice and stopping twice are no-ops.
#[derive(Clone)]
pub struct EventListener {
    inner: Arc<Inner>,
}

impl EventListener {
    /// Create a listener with default TTL and store capacity.
    ///
    /// Binds the receive endpoint on an OS-assigned local port immediately.
    pub fn new() -> Result<Self> {
        Self::with_config(ListenerConfig::default())
    }

    /// Create a listener with explicit tuning knobs
    pub fn with_config(config: ListenerConfig) -> Result<Self> {
        let std_listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
        std_listener.set_nonblocking(true)?;
        let addr = std_listener.local_addr()?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                shared: Arc::new(Shared {
                    ttl: config.ttl,
                    capacity: config.store_capacity,
                    store: Mutex::new(VecDeque::with_capacity(config.store_capacity.min(1024))),
                    auth_handlers: Mutex::new(HashMap::new()),
                }),
                addr,
                shutdown_tx,
                ack: Arc::new(Notify::new()),
                state: tokio::sync::Mutex::new(ListenerState {
                    phase: Phase::Created,
                    std_listener: Some(std_listener),
                    receiver: None,
                    janitor: None,
                }),
            }),
        })
    }

    /// The push endpoint daemons forward events to, `tcp://127.0.0.1:<port>`
    pub fn address(&self) -> String {
        format!("tcp://{}", self.inner.addr)
    }

    /// The OS-assigned local port of the receive endpoint
    pub fn port(&self) -> u16 {
        self.inner.addr.port()
    }

    /// Number of events currently held in the store
    pub fn store_size(&self) -> usize {
        lock(&self.inner.shared.store).len()
    }

    /// Launch the receiver and janitor tasks.
    ///
    /// No-op when already running. Waits (bounded) for the receiver to
    /// signal readiness and fails with [`EventError::NotStarted`] if it does
    /// not.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        match state.phase {
            Phase::Running => return Ok(()),
            Phase::Stopped => return Err(EventError::Stopped),
            Phase::Created => {}
        }
        info!(address = %self.address(), "event listener starting");

        let std_listener = state.std_listener.take().ok_or(EventError::Stopped)?;
        let listener = TcpListener::from_std(std_listener)?;

        let (ready_tx, mut ready_rx) = watch::channel(false);
        let receiver = tokio::spawn(receive_loop(
            self.inner.shared.clone(),
            self.inner.addr,
            listener,
            ready_tx,
            self.inner.shutdown_tx.clone(),
            self.inner.ack.clone(),
        ));

        let ready = timeout(READY_TIMEOUT, ready_rx.wait_for(|ready| *ready)).await;
        if !matches!(ready, Ok(Ok(_))) {
            receiver.abort();
            return Err(EventError::NotStarted(READY_TIMEOUT));
        }

        let janitor = tokio::spawn(janitor_loop(
            self.inner.shared.clone(),
            self.inner.shutdown_tx.subscribe(),
        ));

        state.receiver = Some(receiver);
        state.janitor = Some(janitor);
        state.phase = Phase::Running;
        info!(address = %self.address(), "event listener started");
        Ok(())
    }

    /// Stop the listener. Terminal; idempotent.
    ///
    /// Clears the store and callback registry eagerly so concurrent readers
    /// see an empty state immediately, nudges the receiver with the
    /// sentinel, then joins both tasks with bounded timeouts — shutdown
    /// never hangs the session, a straggling task is logged and detached.
    pub async fn stop(&self) {
        let mut state = self.inner.state.lock().await;
        match state.phase {
            Phase::Stopped => return,
            Phase::Created => {
                state.phase = Phase::Stopped;
                return;
            }
            Phase::Running => {}
        }
        info!(address = %self.address(), "event listener stopping");
        state.phase = Phase::Stopped;

        lock(&self.inner.shared.store).clear();
        lock(&self.inner.shared.auth_handlers).clear();

        match TcpStream::connect(self.inner.addr).await {
            Ok(mut stream) => {
                if let Err(err) = stream.write_all(&encode_sentinel()).await {
                    debug!(error = %err, "failed to push the shutdown sentinel");
                }
                let _ = stream.shutdown().await;
            }
            Err(err) => debug!(error = %err, "failed to connect for the shutdown sentinel"),
        }

        if timeout(ACK_TIMEOUT, self.inner.ack.notified()).await.is_err() {
            debug!("receiver did not acknowledge the sentinel in time");
        }
        // The watch flag stops the janitor, and the receiver too if the
        // sentinel never reached it.
        let _ = self.inner.shutdown_tx.send(true);

        for (name, task) in [
            ("receiver", state.receiver.take()),
            ("janitor", state.janitor.take()),
        ] {
            let Some(task) = task else { continue };
            let abort = task.abort_handle();
            if timeout(JOIN_TIMEOUT, task).await.is_err() {
                warn!(task = name, "task did not exit in time; aborting it");
                abort.abort();
            }
        }
        info!("event listener stopped");
    }

    /// Non-blocking snapshot query.
    ///
    /// A pattern is a `(daemon_id, tag_glob)` pair. An event matches when
    /// its daemon id equals the pattern's, its tag matches the glob, it is
    /// not expired and its stamp is at or after `after_time` (default: now,
    /// so only future events are considered unless explicitly backdated).
    pub fn get_events<I, S, P>(
        &self,
        patterns: I,
        after_time: Option<DateTime<Utc>>,
    ) -> HashSet<Event>
    where
        I: IntoIterator<Item = (S, P)>,
        S: Into<String>,
        P: Into<String>,
    {
        let after_time = after_time.unwrap_or_else(Utc::now);
        let patterns = compile_patterns(patterns);
        debug!(%after_time, patterns = patterns.len(), "checking for event patterns");

        let snapshot: Vec<Event> = lock(&self.inner.shared.store).iter().cloned().collect();
        let mut found = HashSet::new();
        for event in &snapshot {
            if event.expired() || event.stamp() < after_time {
                continue;
            }
            for pattern in &patterns {
                if pattern.matches(event) {
                    found.insert(event.clone());
                }
            }
        }
        found
    }

    /// Block-wait until every pattern has matched or `wait` elapses.
    ///
    /// Rescans the store every 500 ms, retiring patterns as they match.
    /// Never errors on a partial result: the returned [`MatchedEvents`]
    /// carries both the matches and whatever patterns remain, and callers
    /// check [`MatchedEvents::found_all_events`].
    pub async fn wait_for_events<I, S, P>(
        &self,
        patterns: I,
        wait: Duration,
        after_time: Option<DateTime<Utc>>,
    ) -> MatchedEvents
    where
        I: IntoIterator<Item = (S, P)>,
        S: Into<String>,
        P: Into<String>,
    {
        let after_time = after_time.unwrap_or_else(Utc::now);
        let mut outstanding = compile_patterns(patterns);
        info!(
            timeout = ?wait,
            %after_time,
            patterns = outstanding.len(),
            "waiting for event patterns"
        );

        let deadline = tokio::time::Instant::now() + wait;
        let mut matches: HashSet<Event> = HashSet::new();
        loop {
            let snapshot: Vec<Event> = lock(&self.inner.shared.store).iter().cloned().collect();
            outstanding.retain(|pattern| {
                for event in &snapshot {
                    if event.expired() || event.stamp() < after_time {
                        continue;
                    }
                    if pattern.matches(event) {
                        debug!(daemon_id = %pattern.daemon_id, pattern = %pattern.raw, "pattern matched");
                        matches.insert(event.clone());
                        return false;
                    }
                }
                true
            });
            if outstanding.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                debug!(unmatched = outstanding.len(), "timed out waiting for event patterns");
                break;
            }
            sleep(WAIT_POLL_INTERVAL).await;
        }

        let missed = outstanding
            .into_iter()
            .map(|pattern| (pattern.daemon_id, pattern.raw))
            .collect();
        MatchedEvents::new(matches, missed)
    }

    /// Register the authentication-event callback for a daemon id.
    ///
    /// One callback per daemon id; registering again replaces the previous
    /// one. Callbacks are explicitly unregistered at daemon teardown rather
    /// than held weakly.
    pub fn register_auth_event_handler<F>(&self, daemon_id: impl Into<String>, callback: F)
    where
        F: Fn(&Map<String, Value>) + Send + Sync + 'static,
    {
        lock(&self.inner.shared.auth_handlers).insert(daemon_id.into(), Arc::new(callback));
    }

    /// Remove the authentication-event callback for a daemon id, if any
    pub fn unregister_auth_event_handler(&self, daemon_id: &str) {
        lock(&self.inner.shared.auth_handlers).remove(daemon_id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct CompiledPattern {
    daemon_id: String,
    raw: String,
    glob: Option<glob::Pattern>,
}

impl CompiledPattern {
    fn matches(&self, event: &Event) -> bool {
        if event.daemon_id() != self.daemon_id {
            return false;
        }
        match &self.glob {
            Some(glob) => glob.matches(event.tag()),
            None => false,
        }
    }
}

fn compile_patterns<I, S, P>(patterns: I) -> Vec<CompiledPattern>
where
    I: IntoIterator<Item = (S, P)>,
    S: Into<String>,
    P: Into<String>,
{
    patterns
        .into_iter()
        .map(|(daemon_id, pattern)| {
            let raw = pattern.into();
            let glob = match glob::Pattern::new(&raw) {
                Ok(glob) => Some(glob),
                Err(err) => {
                    warn!(pattern = %raw, error = %err, "invalid tag pattern never matches");
                    None
                }
            };
            CompiledPattern {
                daemon_id: daemon_id.into(),
                raw,
                glob,
            }
        })
        .collect()
}

async fn receive_loop(
    shared: Arc<Shared>,
    addr: SocketAddr,
    mut listener: TcpListener,
    ready_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
    ack: Arc<Notify>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let _ = ready_tx.send(true);
    debug!(%addr, "receiver ready");
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "connection established");
                    tokio::spawn(connection_loop(
                        stream,
                        shared.clone(),
                        shutdown_tx.clone(),
                        ack.clone(),
                    ));
                }
                Err(err) => {
                    // Availability over strict crash semantics: keep the
                    // stored events and re-establish the endpoint in place.
                    warn!(%addr, error = %err, "receive endpoint failure; re-establishing");
                    sleep(REBIND_BACKOFF).await;
                    match TcpListener::bind(addr).await {
                        Ok(rebound) => listener = rebound,
                        Err(err) => {
                            warn!(%addr, error = %err, "failed to re-establish endpoint; retrying");
                        }
                    }
                }
            }
        }
    }
    debug!(%addr, "receiver exited");
}

async fn connection_loop(
    mut stream: TcpStream,
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    ack: Arc<Notify>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    if *shutdown_rx.borrow() {
        return;
    }
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 8192];
    loop {
        // A stopped listener must not store anything more, even from
        // connections established before the stop.
        let read = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("connection closed by listener shutdown");
                    return;
                }
                continue;
            }
            read = stream.read(&mut chunk) => read,
        };
        let read = match read {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                debug!(error = %err, "connection read failed");
                break;
            }
        };
        decoder.feed(&chunk[..read]);
        loop {
            match decoder.next_frame() {
                Ok(Some(Frame::Sentinel)) => {
                    debug!("sentinel received; acknowledging shutdown");
                    ack.notify_one();
                    let _ = shutdown_tx.send(true);
                    return;
                }
                Ok(Some(Frame::Event(frame))) => process_frame(&shared, frame),
                Ok(None) => break,
                Err(err) => {
                    // One bad message must never take down the pipeline.
                    warn!(error = %err, "dropping malformed event frame");
                    break;
                }
            }
        }
    }
}

fn process_frame(shared: &Shared, frame: EventFrame) {
    let stamp = frame
        .data
        .get("_stamp")
        .and_then(Value::as_str)
        .and_then(parse_stamp)
        .unwrap_or_else(Utc::now);
    let event = Event::new(frame.daemon_id, frame.tag, stamp, frame.data, shared.ttl);
    info!(daemon_id = %event.daemon_id(), tag = %event.tag(), "received event");

    if shared.capacity > 0 {
        let mut store = lock(&shared.store);
        while store.len() >= shared.capacity {
            store.pop_front();
        }
        store.push_back(event.clone());
        debug!(store_size = store.len(), "store size after event received");
    }

    if event.tag() == AUTH_EVENT_TAG {
        // Clone the callback out and release the registry lock before
        // invoking: the callback may itself register or unregister handlers.
        let callback = lock(&shared.auth_handlers).get(event.daemon_id()).cloned();
        if let Some(callback) = callback {
            // Callback failures never propagate into the receiver.
            let outcome =
                std::panic::catch_unwind(AssertUnwindSafe(|| callback(event.data())));
            if outcome.is_err() {
                warn!(daemon_id = %event.daemon_id(), "auth event callback panicked");
            }
        }
    }
}

async fn janitor_loop(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = interval(JANITOR_INTERVAL);
    // The first tick of a tokio interval fires immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let mut store = lock(&shared.store);
                let before = store.len();
                store.retain(|event| !event.expired());
                debug!(
                    removed = before - store.len(),
                    store_size = store.len(),
                    "store size after cleanup"
                );
            }
        }
    }
    debug!("janitor exited");
}

fn parse_stamp(stamp: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(stamp) {
        return Some(parsed.with_timezone(&Utc));
    }
    // Naive ISO-8601 stamps are implicitly UTC.
    chrono::NaiveDateTime::parse_from_str(stamp, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_stamp_accepts_naive_and_rfc3339() {
        assert!(parse_stamp("2026-08-25T10:00:00.123456").is_some());
        assert!(parse_stamp("2026-08-25T10:00:00.123456+00:00").is_some());
        assert!(parse_stamp("not a stamp").is_none());
    }

    #[test]
    fn tag_globs_match_across_separators() {
        let compiled = compile_patterns([("m1", "salt/master/*/start")]);
        let event = Event::new(
            "m1",
            "salt/master/m1/start",
            Utc::now(),
            Map::new(),
            Duration::from_secs(60),
        );
        assert!(compiled[0].matches(&event));

        let other_daemon = Event::new(
            "m2",
            "salt/master/m1/start",
            Utc::now(),
            Map::new(),
            Duration::from_secs(60),
        );
        assert!(!compiled[0].matches(&other_daemon));
    }

    #[test]
    fn invalid_glob_never_matches() {
        let compiled = compile_patterns([("m1", "salt/[")]);
        let event = Event::new("m1", "salt/[", Utc::now(), Map::new(), Duration::from_secs(60));
        assert!(!compiled[0].matches(&event));
    }
}
