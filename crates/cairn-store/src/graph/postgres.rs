//! Relational graph back-end, for multi-process deployments where the
//! scheduler and ingest API each need a shared view of the projection.

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::graph::{Edge, EdgeType, Graph, GraphError, Node, NodeType, PropertyFilter, Result};

pub struct PostgresGraph {
    pool: PgPool,
}

impl PostgresGraph {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Graph for PostgresGraph {
    async fn upsert_node(&self, node: Node) -> Result<()> {
        sqlx::query(
            "INSERT INTO nodes (node_id, node_type, properties, updated_at) \
             VALUES ($1, $2, $3, now()) \
             ON CONFLICT (node_id) DO UPDATE \
             SET node_type = EXCLUDED.node_type, properties = EXCLUDED.properties, updated_at = now()",
        )
        .bind(&node.node_id)
        .bind(node.node_type.to_string())
        .bind(&node.properties)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_edge(&self, edge: Edge) -> Result<()> {
        sqlx::query(
            "INSERT INTO edges (from_node, edge_type, to_node) VALUES ($1, $2, $3) \
             ON CONFLICT (from_node, edge_type, to_node) DO NOTHING",
        )
        .bind(&edge.from_node)
        .bind(edge.edge_type.to_string())
        .bind(&edge.to_node)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<Node>> {
        let row = sqlx::query("SELECT node_id, node_type, properties FROM nodes WHERE node_id = $1")
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_node).transpose()
    }

    async fn query_nodes(
        &self,
        node_type: Option<NodeType>,
        filters: &[PropertyFilter],
    ) -> Result<Vec<Node>> {
        let rows = sqlx::query(
            "SELECT node_id, node_type, properties FROM nodes \
             WHERE $1::text IS NULL OR node_type = $1 \
             ORDER BY node_id",
        )
        .bind(node_type.map(|t| t.to_string()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(row_to_node)
            .filter(|node| match node {
                Ok(node) => filters
                    .iter()
                    .all(|f| node.properties.get(&f.key) == Some(&f.value)),
                Err(_) => true,
            })
            .collect()
    }

    async fn query_edges(
        &self,
        from: Option<&str>,
        to: Option<&str>,
        edge_type: Option<EdgeType>,
    ) -> Result<Vec<Edge>> {
        let rows = sqlx::query(
            "SELECT from_node, edge_type, to_node FROM edges \
             WHERE ($1::text IS NULL OR from_node = $1) \
               AND ($2::text IS NULL OR to_node = $2) \
               AND ($3::text IS NULL OR edge_type = $3) \
             ORDER BY from_node, edge_type, to_node",
        )
        .bind(from)
        .bind(to)
        .bind(edge_type.map(|t| t.to_string()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let edge_type: String = row.try_get("edge_type")?;
                let edge_type: EdgeType = edge_type
                    .parse()
                    .map_err(|e: crate::graph::EdgeTypeParseError| {
                        GraphError::Database(sqlx::Error::Decode(Box::new(e)))
                    })?;
                Ok(Edge {
                    from_node: row.try_get("from_node")?,
                    edge_type,
                    to_node: row.try_get("to_node")?,
                })
            })
            .collect()
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("TRUNCATE edges, nodes").execute(&self.pool).await?;
        Ok(())
    }
}

fn row_to_node(row: sqlx::postgres::PgRow) -> Result<Node> {
    let node_type: String = row.try_get("node_type")?;
    let node_type: NodeType = node_type
        .parse()
        .map_err(|e: crate::graph::NodeTypeParseError| {
            GraphError::Database(sqlx::Error::Decode(Box::new(e)))
        })?;
    Ok(Node {
        node_id: row.try_get("node_id")?,
        node_type,
        properties: row.try_get("properties")?,
    })
}
