//! Event types and the content-hash chain.
//!
//! Events are modeled as an immutable tagged sum: one variant per
//! namespaced event type, each carrying its own typed payload. `apply`
//! in [`crate::graph`] becomes an exhaustive match over this sum rather
//! than inspecting an opaque map.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The closed set of event types recognized by the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    TargetRegistered,
    TaskCreated,
    TaskUpdated,
    TaskCompleted,
    TaskBlocked,
    AttemptCreated,
    AttemptStarted,
    AttemptSucceeded,
    AttemptFailed,
    AttemptInvalidated,
    ArtifactCreated,
    PrCreated,
    PrMerged,
    PrClosed,
    TestsStarted,
    TestsPassed,
    TestsFailed,
    ModelCallStarted,
    ModelCallCompleted,
    BootstrapStarted,
    BootstrapCompleted,
    RepoIndexed,
    FileDiscovered,
    WorkflowDiscovered,
    ApiRouteDiscovered,
    RetryScheduled,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TargetRegistered => "target.registered",
            Self::TaskCreated => "task.created",
            Self::TaskUpdated => "task.updated",
            Self::TaskCompleted => "task.completed",
            Self::TaskBlocked => "task.blocked",
            Self::AttemptCreated => "attempt.created",
            Self::AttemptStarted => "attempt.started",
            Self::AttemptSucceeded => "attempt.succeeded",
            Self::AttemptFailed => "attempt.failed",
            Self::AttemptInvalidated => "attempt.invalidated",
            Self::ArtifactCreated => "artifact.created",
            Self::PrCreated => "pr.created",
            Self::PrMerged => "pr.merged",
            Self::PrClosed => "pr.closed",
            Self::TestsStarted => "tests.started",
            Self::TestsPassed => "tests.passed",
            Self::TestsFailed => "tests.failed",
            Self::ModelCallStarted => "model.call_started",
            Self::ModelCallCompleted => "model.call_completed",
            Self::BootstrapStarted => "bootstrap.started",
            Self::BootstrapCompleted => "bootstrap.completed",
            Self::RepoIndexed => "repo.indexed",
            Self::FileDiscovered => "file.discovered",
            Self::WorkflowDiscovered => "workflow.discovered",
            Self::ApiRouteDiscovered => "api.route.discovered",
            Self::RetryScheduled => "retry.scheduled",
        };
        f.write_str(s)
    }
}

/// Error returned when parsing an unrecognized [`EventType`] string.
#[derive(Debug, Clone)]
pub struct EventTypeParseError(pub String);

impl fmt::Display for EventTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized event type: {:?}", self.0)
    }
}

impl std::error::Error for EventTypeParseError {}

impl FromStr for EventType {
    type Err = EventTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "target.registered" => Self::TargetRegistered,
            "task.created" => Self::TaskCreated,
            "task.updated" => Self::TaskUpdated,
            "task.completed" => Self::TaskCompleted,
            "task.blocked" => Self::TaskBlocked,
            "attempt.created" => Self::AttemptCreated,
            "attempt.started" => Self::AttemptStarted,
            "attempt.succeeded" => Self::AttemptSucceeded,
            "attempt.failed" => Self::AttemptFailed,
            "attempt.invalidated" => Self::AttemptInvalidated,
            "artifact.created" => Self::ArtifactCreated,
            "pr.created" => Self::PrCreated,
            "pr.merged" => Self::PrMerged,
            "pr.closed" => Self::PrClosed,
            "tests.started" => Self::TestsStarted,
            "tests.passed" => Self::TestsPassed,
            "tests.failed" => Self::TestsFailed,
            "model.call_started" => Self::ModelCallStarted,
            "model.call_completed" => Self::ModelCallCompleted,
            "bootstrap.started" => Self::BootstrapStarted,
            "bootstrap.completed" => Self::BootstrapCompleted,
            "repo.indexed" => Self::RepoIndexed,
            "file.discovered" => Self::FileDiscovered,
            "workflow.discovered" => Self::WorkflowDiscovered,
            "api.route.discovered" => Self::ApiRouteDiscovered,
            "retry.scheduled" => Self::RetryScheduled,
            other => return Err(EventTypeParseError(other.to_owned())),
        })
    }
}

impl Serialize for EventType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An event payload, before `prev_hash`/`hash` have been assigned.
///
/// This is what callers construct and hand to [`crate::journal::Journal::append`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub actor_id: String,
    /// Opaque ordered map of primitive fields. Stored as a JSON object so
    /// canonicalization (sorted keys) is well defined.
    pub payload: serde_json::Value,
}

/// A fully hash-chained event, as persisted in the journal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub event_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub actor_id: String,
    pub payload: serde_json::Value,
    pub prev_hash: Option<String>,
    pub hash: String,
}

impl Event {
    /// Compute H1: chain the new event onto `prev_hash` and derive its hash.
    pub fn chain(new: NewEvent, prev_hash: Option<String>) -> Self {
        let hash = compute_hash(
            &new.event_id,
            new.event_type,
            new.timestamp,
            &new.actor_id,
            &new.payload,
            prev_hash.as_deref(),
        );
        Self {
            event_id: new.event_id,
            event_type: new.event_type,
            timestamp: new.timestamp,
            actor_id: new.actor_id,
            payload: new.payload,
            prev_hash,
            hash,
        }
    }

    /// Recompute the hash this event *should* have, to check H1.
    pub fn expected_hash(&self) -> String {
        compute_hash(
            &self.event_id,
            self.event_type,
            self.timestamp,
            &self.actor_id,
            &self.payload,
            self.prev_hash.as_deref(),
        )
    }
}

/// Canonical serialization: a deterministic byte string with sorted map
/// keys and stable separators, per invariant H1. `serde_json::Value`
/// already sorts object keys when the `preserve_order` feature is off
/// (the default), so `to_string` on a re-parsed value is canonical.
fn canonicalize(payload: &serde_json::Value) -> String {
    // Round-trip through BTreeMap-backed Value to guarantee key order
    // even if the caller constructed the value with out-of-order keys
    // under a build that enables `preserve_order`.
    fn sort(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let sorted: std::collections::BTreeMap<String, serde_json::Value> =
                    map.iter().map(|(k, v)| (k.clone(), sort(v))).collect();
                serde_json::to_value(sorted).expect("BTreeMap<String, Value> always serializes")
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sort).collect())
            }
            other => other.clone(),
        }
    }
    serde_json::to_string(&sort(payload)).expect("Value always serializes")
}

fn compute_hash(
    event_id: &str,
    event_type: EventType,
    timestamp: DateTime<Utc>,
    actor_id: &str,
    payload: &serde_json::Value,
    prev_hash: Option<&str>,
) -> String {
    let canonical = format!(
        "{event_id}|{event_type}|{}|{actor_id}|{}|{}",
        timestamp.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
        canonicalize(payload),
        prev_hash.unwrap_or(""),
    );
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(payload: serde_json::Value) -> NewEvent {
        NewEvent {
            event_id: "evt-1".to_owned(),
            event_type: EventType::TaskCreated,
            timestamp: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            actor_id: "scheduler".to_owned(),
            payload,
        }
    }

    #[test]
    fn event_type_round_trips_through_display_and_from_str() {
        for ty in [
            EventType::TargetRegistered,
            EventType::TaskBlocked,
            EventType::AttemptInvalidated,
            EventType::ModelCallCompleted,
            EventType::ApiRouteDiscovered,
        ] {
            let s = ty.to_string();
            assert_eq!(s.parse::<EventType>().unwrap(), ty);
        }
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        assert!("not.a.real.type".parse::<EventType>().is_err());
    }

    #[test]
    fn first_event_has_no_prev_hash() {
        let e = Event::chain(sample(serde_json::json!({"id": "t1"})), None);
        assert!(e.prev_hash.is_none());
        assert_eq!(e.hash, e.expected_hash());
    }

    #[test]
    fn chained_event_carries_predecessor_hash() {
        let first = Event::chain(sample(serde_json::json!({"id": "t1"})), None);
        let second = Event::chain(sample(serde_json::json!({"id": "t2"})), Some(first.hash.clone()));
        assert_eq!(second.prev_hash, Some(first.hash));
    }

    #[test]
    fn hash_is_stable_regardless_of_key_order_in_payload() {
        let a = sample(serde_json::json!({"id": "t1", "scope": "docs"}));
        let b = sample(serde_json::json!({"scope": "docs", "id": "t1"}));
        let ea = Event::chain(a, None);
        let eb = Event::chain(b, None);
        assert_eq!(ea.hash, eb.hash);
    }

    #[test]
    fn tampering_with_payload_invalidates_hash() {
        let mut e = Event::chain(sample(serde_json::json!({"id": "t1"})), None);
        e.payload = serde_json::json!({"id": "t1-tampered"});
        assert_ne!(e.hash, e.expected_hash());
    }
}
