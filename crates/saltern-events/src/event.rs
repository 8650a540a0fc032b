//! Event and wait-result value types

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Reserved payload keys carry this prefix and are stripped from the clean
/// payload so they cannot get in the way of direct assertions.
pub const PRIVATE_KEY_PREFIX: char = '_';

/// One event received from a daemon, as stored by the listener.
///
/// `data` is the payload with reserved (underscore-prefixed) keys stripped;
/// `full_data` is the payload exactly as received. Identity is
/// `(daemon_id, tag, stamp)`; payloads do not participate in equality or
/// hashing.
#[derive(Debug, Clone)]
pub struct Event {
    daemon_id: String,
    tag: String,
    stamp: DateTime<Utc>,
    data: Map<String, Value>,
    full_data: Map<String, Value>,
    expire_at: DateTime<Utc>,
}

impl Event {
    /// Create an event expiring `ttl` after its stamp
    pub fn new(
        daemon_id: impl Into<String>,
        tag: impl Into<String>,
        stamp: DateTime<Utc>,
        full_data: Map<String, Value>,
        ttl: Duration,
    ) -> Self {
        let data = full_data
            .iter()
            .filter(|(key, _)| !key.starts_with(PRIVATE_KEY_PREFIX))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let expire_at = chrono::TimeDelta::from_std(ttl)
            .ok()
            .and_then(|ttl| stamp.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            daemon_id: daemon_id.into(),
            tag: tag.into(),
            stamp,
            data,
            full_data,
            expire_at,
        }
    }

    /// Identifier of the daemon that emitted the event
    pub fn daemon_id(&self) -> &str {
        &self.daemon_id
    }

    /// Event tag
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// When the event occurred
    pub fn stamp(&self) -> DateTime<Utc> {
        self.stamp
    }

    /// Payload with reserved keys stripped
    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    /// Payload exactly as received, reserved keys included
    pub fn full_data(&self) -> &Map<String, Value> {
        &self.full_data
    }

    /// Whether the event has outlived its expiry horizon.
    ///
    /// Pure function of wall-clock time against the stored horizon.
    pub fn expired(&self) -> bool {
        Utc::now() >= self.expire_at
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.daemon_id == other.daemon_id && self.tag == other.tag && self.stamp == other.stamp
    }
}

impl Eq for Event {}

impl Hash for Event {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.daemon_id.hash(state);
        self.tag.hash(state);
        self.stamp.hash(state);
    }
}

/// Result of a `wait_for_events` call: the events that matched and the
/// `(daemon_id, tag_pattern)` pairs that did not.
///
/// A partial timeout is not an error; callers assert on
/// [`found_all_events`](Self::found_all_events) explicitly so tests can also
/// assert on partial failures.
#[derive(Debug)]
pub struct MatchedEvents {
    matches: HashSet<Event>,
    missed: HashSet<(String, String)>,
}

impl MatchedEvents {
    pub(crate) fn new(matches: HashSet<Event>, missed: HashSet<(String, String)>) -> Self {
        Self { matches, missed }
    }

    /// Events that matched a requested pattern
    pub fn matches(&self) -> &HashSet<Event> {
        &self.matches
    }

    /// Requested patterns that remained unmatched
    pub fn missed(&self) -> &HashSet<(String, String)> {
        &self.missed
    }

    /// `true` iff every requested pattern was matched
    pub fn found_all_events(&self) -> bool {
        self.missed.is_empty()
    }
}

impl<'a> IntoIterator for &'a MatchedEvents {
    type Item = &'a Event;
    type IntoIter = std::collections::hash_set::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.matches.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("_stamp".into(), json!("2026-08-25T10:00:00.000000"));
        map.insert("cmd".into(), json!("_minion_event"));
        map
    }

    #[test]
    fn private_keys_are_stripped_from_clean_data() {
        let event = Event::new(
            "m1",
            "salt/job/1/ret",
            Utc::now(),
            payload(),
            Duration::from_secs(60),
        );
        assert!(event.data().get("_stamp").is_none());
        assert_eq!(event.data().get("cmd"), Some(&json!("_minion_event")));
        assert!(event.full_data().get("_stamp").is_some());
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let event = Event::new("m1", "tag", Utc::now(), Map::new(), Duration::ZERO);
        assert!(event.expired());
    }

    #[test]
    fn long_ttl_does_not_expire() {
        let event = Event::new("m1", "tag", Utc::now(), Map::new(), Duration::from_secs(3600));
        assert!(!event.expired());
    }

    #[test]
    fn identity_ignores_payload() {
        let stamp = Utc::now();
        let a = Event::new("m1", "tag", stamp, payload(), Duration::from_secs(60));
        let b = Event::new("m1", "tag", stamp, Map::new(), Duration::from_secs(60));
        assert_eq!(a, b);
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn found_all_events_tracks_missed_set() {
        let all = MatchedEvents::new(HashSet::new(), HashSet::new());
        assert!(all.found_all_events());

        let mut missed = HashSet::new();
        missed.insert(("m1".to_string(), "nonexistent/*".to_string()));
        let partial = MatchedEvents::new(HashSet::new(), missed);
        assert!(!partial.found_all_events());
    }
}
