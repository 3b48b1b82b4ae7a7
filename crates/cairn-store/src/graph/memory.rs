//! In-memory graph back-end. Default for single-process deployments;
//! rebuilt from the journal on start when configured.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::graph::{Edge, Graph, Node, NodeType, PropertyFilter, Result};

#[derive(Default)]
struct State {
    nodes: HashMap<String, Node>,
    edges: HashMap<String, Edge>,
}

#[derive(Default)]
pub struct MemoryGraph {
    state: RwLock<State>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Graph for MemoryGraph {
    async fn upsert_node(&self, node: Node) -> Result<()> {
        self.state.write().unwrap().nodes.insert(node.node_id.clone(), node);
        Ok(())
    }

    async fn insert_edge(&self, edge: Edge) -> Result<()> {
        self.state.write().unwrap().edges.insert(edge.key(), edge);
        Ok(())
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<Node>> {
        Ok(self.state.read().unwrap().nodes.get(node_id).cloned())
    }

    async fn query_nodes(
        &self,
        node_type: Option<NodeType>,
        filters: &[PropertyFilter],
    ) -> Result<Vec<Node>> {
        let state = self.state.read().unwrap();
        Ok(state
            .nodes
            .values()
            .filter(|n| node_type.is_none_or(|t| n.node_type == t))
            .filter(|n| {
                filters
                    .iter()
                    .all(|f| n.properties.get(&f.key) == Some(&f.value))
            })
            .cloned()
            .collect())
    }

    async fn query_edges(
        &self,
        from: Option<&str>,
        to: Option<&str>,
        edge_type: Option<crate::graph::EdgeType>,
    ) -> Result<Vec<Edge>> {
        let state = self.state.read().unwrap();
        Ok(state
            .edges
            .values()
            .filter(|e| from.is_none_or(|f| e.from_node == f))
            .filter(|e| to.is_none_or(|t| e.to_node == t))
            .filter(|e| edge_type.is_none_or(|t| e.edge_type == t))
            .cloned()
            .collect())
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.write().unwrap();
        state.nodes.clear();
        state.edges.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventType};
    use crate::graph::EdgeType;

    fn event(id: &str, event_type: EventType, payload: serde_json::Value) -> Event {
        Event {
            event_id: id.to_owned(),
            event_type,
            timestamp: chrono::Utc::now(),
            actor_id: "scheduler".to_owned(),
            payload,
            prev_hash: None,
            hash: format!("hash-{id}"),
        }
    }

    #[tokio::test]
    async fn rebuild_is_deterministic() {
        let graph = MemoryGraph::new();
        let events = vec![
            event(
                "e1",
                EventType::TargetRegistered,
                serde_json::json!({"target_id": "radix", "name": "radix"}),
            ),
            event(
                "e2",
                EventType::TaskCreated,
                serde_json::json!({"task_id": "t1", "target_id": "radix"}),
            ),
            event(
                "e3",
                EventType::AttemptCreated,
                serde_json::json!({"attempt_id": "a1", "task_id": "t1"}),
            ),
        ];

        graph.rebuild(&events).await.unwrap();
        assert_eq!(graph.query_nodes(None, &[]).await.unwrap().len(), 3);
        assert_eq!(
            graph
                .query_edges(None, None, Some(EdgeType::DependsOn))
                .await
                .unwrap()
                .len(),
            2
        );

        graph.rebuild(&events).await.unwrap();
        assert_eq!(graph.query_nodes(None, &[]).await.unwrap().len(), 3);
        assert_eq!(
            graph
                .query_edges(None, None, Some(EdgeType::DependsOn))
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn task_updated_merges_into_existing_node() {
        let graph = MemoryGraph::new();
        graph
            .apply(&event(
                "e1",
                EventType::TaskCreated,
                serde_json::json!({"task_id": "t1", "status": "pending", "title": "fix bug"}),
            ))
            .await
            .unwrap();
        graph
            .apply(&event(
                "e2",
                EventType::TaskCompleted,
                serde_json::json!({"task_id": "t1", "status": "completed"}),
            ))
            .await
            .unwrap();

        let node = graph.get_node("t1").await.unwrap().unwrap();
        assert_eq!(node.properties["status"], "completed");
        assert_eq!(node.properties["title"], "fix bug");
    }

    #[tokio::test]
    async fn pr_created_without_attempt_id_adds_no_edge() {
        let graph = MemoryGraph::new();
        graph
            .apply(&event(
                "e1",
                EventType::PrCreated,
                serde_json::json!({"pr_number": 7}),
            ))
            .await
            .unwrap();
        assert_eq!(graph.query_edges(None, None, None).await.unwrap().len(), 0);
        assert!(graph.get_node("pr-7").await.unwrap().is_some());
    }
}
