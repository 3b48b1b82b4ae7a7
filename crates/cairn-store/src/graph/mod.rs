//! Deterministic graph projection of the event journal.
//!
//! `apply(event)` is a pure fold: replaying the same event prefix from an
//! empty graph always yields the same node and edge set (invariant G1).

pub mod memory;
pub mod postgres;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::event::{Event, EventType};

/// The closed set of node types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Target,
    Task,
    Attempt,
    Workspace,
    Artifact,
    ModelCall,
    TestRun,
    Commit,
    PullRequest,
    PolicySnapshot,
    Actor,
    Delegation,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Target => "target",
            Self::Task => "task",
            Self::Attempt => "attempt",
            Self::Workspace => "workspace",
            Self::Artifact => "artifact",
            Self::ModelCall => "model_call",
            Self::TestRun => "test_run",
            Self::Commit => "commit",
            Self::PullRequest => "pull_request",
            Self::PolicySnapshot => "policy_snapshot",
            Self::Actor => "actor",
            Self::Delegation => "delegation",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct NodeTypeParseError(pub String);

impl fmt::Display for NodeTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized node type: {:?}", self.0)
    }
}

impl std::error::Error for NodeTypeParseError {}

impl FromStr for NodeType {
    type Err = NodeTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "target" => Self::Target,
            "task" => Self::Task,
            "attempt" => Self::Attempt,
            "workspace" => Self::Workspace,
            "artifact" => Self::Artifact,
            "model_call" => Self::ModelCall,
            "test_run" => Self::TestRun,
            "commit" => Self::Commit,
            "pull_request" => Self::PullRequest,
            "policy_snapshot" => Self::PolicySnapshot,
            "actor" => Self::Actor,
            "delegation" => Self::Delegation,
            other => return Err(NodeTypeParseError(other.to_owned())),
        })
    }
}

impl Serialize for NodeType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The closed set of edge types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeType {
    DependsOn,
    Produced,
    RunsIn,
    AuthorizedBy,
    Delegates,
    Invalidates,
    Supports,
    Contests,
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DependsOn => "DEPENDS_ON",
            Self::Produced => "PRODUCED",
            Self::RunsIn => "RUNS_IN",
            Self::AuthorizedBy => "AUTHORIZED_BY",
            Self::Delegates => "DELEGATES",
            Self::Invalidates => "INVALIDATES",
            Self::Supports => "SUPPORTS",
            Self::Contests => "CONTESTS",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct EdgeTypeParseError(pub String);

impl fmt::Display for EdgeTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized edge type: {:?}", self.0)
    }
}

impl std::error::Error for EdgeTypeParseError {}

impl FromStr for EdgeType {
    type Err = EdgeTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "DEPENDS_ON" => Self::DependsOn,
            "PRODUCED" => Self::Produced,
            "RUNS_IN" => Self::RunsIn,
            "AUTHORIZED_BY" => Self::AuthorizedBy,
            "DELEGATES" => Self::Delegates,
            "INVALIDATES" => Self::Invalidates,
            "SUPPORTS" => Self::Supports,
            "CONTESTS" => Self::Contests,
            other => return Err(EdgeTypeParseError(other.to_owned())),
        })
    }
}

impl Serialize for EdgeType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EdgeType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A node, as stored by a [`Graph`] back-end.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub node_id: String,
    pub node_type: NodeType,
    /// Merged JSON record; required fields depend on `node_type`.
    pub properties: serde_json::Value,
}

/// An edge, keyed by the deterministic triple `from_node:edge_type:to_node`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Edge {
    pub from_node: String,
    pub edge_type: EdgeType,
    pub to_node: String,
}

impl Edge {
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.from_node, self.edge_type, self.to_node)
    }
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GraphError>;

/// Filter for [`Graph::query_nodes`]: an exact match against one property.
#[derive(Debug, Clone)]
pub struct PropertyFilter {
    pub key: String,
    pub value: serde_json::Value,
}

#[async_trait]
pub trait Graph: Send + Sync {
    async fn upsert_node(&self, node: Node) -> Result<()>;
    async fn insert_edge(&self, edge: Edge) -> Result<()>;
    async fn get_node(&self, node_id: &str) -> Result<Option<Node>>;
    async fn query_nodes(
        &self,
        node_type: Option<NodeType>,
        filters: &[PropertyFilter],
    ) -> Result<Vec<Node>>;
    async fn query_edges(
        &self,
        from: Option<&str>,
        to: Option<&str>,
        edge_type: Option<EdgeType>,
    ) -> Result<Vec<Edge>>;

    /// Drop every node and edge. Used only as the first step of [`rebuild`].
    async fn clear(&self) -> Result<()>;

    /// Apply one journal event to the projection.
    async fn apply(&self, event: &Event) -> Result<()> {
        match event.event_type {
            EventType::TargetRegistered => {
                self.upsert_node(Node {
                    node_id: node_id_from_payload(event, "target_id"),
                    node_type: NodeType::Target,
                    properties: event.payload.clone(),
                })
                .await?;
            }
            EventType::TaskCreated => {
                let task_id = node_id_from_payload(event, "task_id");
                self.upsert_node(Node {
                    node_id: task_id.clone(),
                    node_type: NodeType::Task,
                    properties: event.payload.clone(),
                })
                .await?;
                if let Some(target_id) = event.payload.get("target_id").and_then(|v| v.as_str()) {
                    self.insert_edge(Edge {
                        from_node: task_id,
                        edge_type: EdgeType::DependsOn,
                        to_node: target_id.to_owned(),
                    })
                    .await?;
                }
            }
            EventType::TaskUpdated | EventType::TaskCompleted | EventType::TaskBlocked => {
                self.merge_node(node_id_from_payload(event, "task_id"), NodeType::Task, event)
                    .await?;
            }
            EventType::AttemptCreated => {
                let attempt_id = node_id_from_payload(event, "attempt_id");
                self.upsert_node(Node {
                    node_id: attempt_id.clone(),
                    node_type: NodeType::Attempt,
                    properties: event.payload.clone(),
                })
                .await?;
                if let Some(task_id) = event.payload.get("task_id").and_then(|v| v.as_str()) {
                    self.insert_edge(Edge {
                        from_node: attempt_id,
                        edge_type: EdgeType::DependsOn,
                        to_node: task_id.to_owned(),
                    })
                    .await?;
                }
            }
            EventType::AttemptStarted
            | EventType::AttemptSucceeded
            | EventType::AttemptFailed
            | EventType::AttemptInvalidated => {
                self.merge_node(
                    node_id_from_payload(event, "attempt_id"),
                    NodeType::Attempt,
                    event,
                )
                .await?;
            }
            EventType::ArtifactCreated => {
                let artifact_id = node_id_from_payload(event, "artifact_id");
                self.upsert_node(Node {
                    node_id: artifact_id.clone(),
                    node_type: NodeType::Artifact,
                    properties: event.payload.clone(),
                })
                .await?;
                if let Some(attempt_id) = event.payload.get("attempt_id").and_then(|v| v.as_str()) {
                    self.insert_edge(Edge {
                        from_node: attempt_id.to_owned(),
                        edge_type: EdgeType::Produced,
                        to_node: artifact_id,
                    })
                    .await?;
                }
            }
            EventType::PrCreated => {
                let pr_id = pr_node_id(event);
                self.upsert_node(Node {
                    node_id: pr_id.clone(),
                    node_type: NodeType::PullRequest,
                    properties: event.payload.clone(),
                })
                .await?;
                if let Some(attempt_id) = event.payload.get("attempt_id").and_then(|v| v.as_str()) {
                    self.insert_edge(Edge {
                        from_node: attempt_id.to_owned(),
                        edge_type: EdgeType::Produced,
                        to_node: pr_id,
                    })
                    .await?;
                }
            }
            // All other event types (pr.merged, pr.closed, tests.*, model.*,
            // bootstrap.*, repo.indexed, file.discovered, workflow.discovered,
            // api.route.discovered, retry.scheduled) are pure journal events
            // with no graph projection.
            _ => {}
        }
        Ok(())
    }

    /// Merge an event's payload into an existing node, creating it from the
    /// payload if absent.
    async fn merge_node(&self, node_id: String, node_type: NodeType, event: &Event) -> Result<()> {
        let mut merged = match self.get_node(&node_id).await? {
            Some(existing) => merge_json(existing.properties, event.payload.clone()),
            None => event.payload.clone(),
        };
        // Every merge stamps the triggering event's own timestamp, so a
        // node's `"timestamp"` property always reflects the last event
        // that touched it rather than whatever the payload happened to
        // carry (most payloads carry none at all).
        if let Some(map) = merged.as_object_mut() {
            map.insert("timestamp".to_owned(), serde_json::Value::String(event.timestamp.to_rfc3339()));
        }
        self.upsert_node(Node {
            node_id,
            node_type,
            properties: merged,
        })
        .await
    }

    /// Clear and replay every event in order.
    async fn rebuild(&self, events: &[Event]) -> Result<()> {
        self.clear().await?;
        for event in events {
            self.apply(event).await?;
        }
        Ok(())
    }
}

fn node_id_from_payload(event: &Event, key: &str) -> String {
    event
        .payload
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .unwrap_or_else(|| event.event_id.clone())
}

/// PR node-id selection.3: numeric id, else URL hash, else event id.
fn pr_node_id(event: &Event) -> String {
    if let Some(number) = event.payload.get("pr_number").and_then(|v| v.as_i64()) {
        return format!("pr-{number}");
    }
    if let Some(url) = event.payload.get("pr_url").and_then(|v| v.as_str()) {
        if !url.is_empty() {
            let digest = Sha256::digest(url.as_bytes());
            let hex = hex::encode(digest);
            return format!("pr-{}", &hex[..12]);
        }
    }
    format!("pr-{}", &event.event_id[..event.event_id.len().min(12)])
}

/// Shallow merge: keys in `update` overwrite keys in `base`; `base` keys not
/// present in `update` are kept.
fn merge_json(base: serde_json::Value, update: serde_json::Value) -> serde_json::Value {
    match (base, update) {
        (serde_json::Value::Object(mut base_map), serde_json::Value::Object(update_map)) => {
            for (k, v) in update_map {
                base_map.insert(k, v);
            }
            serde_json::Value::Object(base_map)
        }
        (_, update) => update,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_type_round_trips() {
        for ty in [NodeType::PullRequest, NodeType::PolicySnapshot, NodeType::Delegation] {
            assert_eq!(ty.to_string().parse::<NodeType>().unwrap(), ty);
        }
    }

    #[test]
    fn edge_type_round_trips() {
        for ty in [EdgeType::DependsOn, EdgeType::Invalidates, EdgeType::Contests] {
            assert_eq!(ty.to_string().parse::<EdgeType>().unwrap(), ty);
        }
    }

    #[test]
    fn edge_key_is_the_deterministic_triple() {
        let edge = Edge {
            from_node: "t1".to_owned(),
            edge_type: EdgeType::DependsOn,
            to_node: "radix".to_owned(),
        };
        assert_eq!(edge.key(), "t1:DEPENDS_ON:radix");
    }

    #[test]
    fn pr_node_id_prefers_numeric_id() {
        let event = sample_event(
            EventType::PrCreated,
            serde_json::json!({"pr_number": 42, "pr_url": "https://host/repo/pull/42"}),
        );
        assert_eq!(pr_node_id(&event), "pr-42");
    }

    #[test]
    fn pr_node_id_falls_back_to_url_hash() {
        let event = sample_event(
            EventType::PrCreated,
            serde_json::json!({"pr_url": "https://host/repo/pull/placeholder"}),
        );
        let expected_hash = hex::encode(Sha256::digest(
            b"https://host/repo/pull/placeholder",
        ));
        assert_eq!(pr_node_id(&event), format!("pr-{}", &expected_hash[..12]));
    }

    #[test]
    fn pr_node_id_falls_back_to_event_id() {
        let event = sample_event(EventType::PrCreated, serde_json::json!({}));
        let want = format!("pr-{}", &event.event_id[..event.event_id.len().min(12)]);
        assert_eq!(pr_node_id(&event), want);
    }

    #[test]
    fn merge_json_overwrites_only_update_keys() {
        let base = serde_json::json!({"status": "created", "title": "fix bug"});
        let update = serde_json::json!({"status": "running"});
        let merged = merge_json(base, update);
        assert_eq!(merged["status"], "running");
        assert_eq!(merged["title"], "fix bug");
    }

    fn sample_event(event_type: EventType, payload: serde_json::Value) -> Event {
        Event {
            event_id: "0123456789abcdef".to_owned(),
            event_type,
            timestamp: chrono::Utc::now(),
            actor_id: "scheduler".to_owned(),
            payload,
            prev_hash: None,
            hash: "deadbeef".to_owned(),
        }
    }
}
