//! The Ingest & Query API: the HTTP surface workers post
//! attempt bundles to, and operators/dashboards read the graph through.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path as AxPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use cairn_store::event::{Event, EventType, NewEvent};
use cairn_store::graph::{EdgeType, Graph, Node, NodeType, PropertyFilter};
use cairn_store::journal::Journal;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::config::CairnConfig;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, message: msg.into() }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: err.to_string() }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
pub struct AutonomyStatus {
    pub enabled: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub journal: Arc<dyn Journal>,
    pub graph: Arc<dyn Graph>,
    pub control_plane_token: String,
    pub http: reqwest::Client,
    pub observability_url: Option<String>,
    pub observability_enabled: bool,
    pub autonomy_enabled: bool,
    pub autonomy_source: String,
}

impl AppState {
    pub fn new(journal: Arc<dyn Journal>, graph: Arc<dyn Graph>, config: &CairnConfig, autonomy_enabled: bool, autonomy_source: String) -> Self {
        Self {
            journal,
            graph,
            control_plane_token: config.control_plane_token.clone(),
            http: reqwest::Client::new(),
            observability_url: config.observability_url.clone(),
            observability_enabled: config.observability_enabled,
            autonomy_enabled,
            autonomy_source,
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/events/ingest", post(ingest))
        .route("/v1/graph/summary", get(graph_summary))
        .route("/v1/attempts", get(list_attempts))
        .route("/v1/attempts/{id}", get(get_attempt))
        .route("/v1/failures", get(list_failures))
        .route("/v1/attempts/{id}/invalidate", post(invalidate_attempt))
        .route("/v1/autonomy/status", get(autonomy_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer_token));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(protected)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_serve(state: AppState, bind: &str, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("cairn serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    tracing::info!("cairn serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Auth middleware
// ---------------------------------------------------------------------------

async fn require_bearer_token(State(state): State<AppState>, headers: HeaderMap, request: axum::extract::Request, next: Next) -> axum::response::Response {
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == state.control_plane_token => next.run(request).await,
        _ => AppError { status: StatusCode::UNAUTHORIZED, message: "missing or invalid bearer token".to_owned() }.into_response(),
    }
}

// ---------------------------------------------------------------------------
// healthz
// ---------------------------------------------------------------------------

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// ingest
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct IngestBundle {
    target: String,
    bundle_id: String,
    events: Vec<NewEvent>,
    artifacts: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    ingested: usize,
    bundle_id: String,
    status: &'static str,
}

async fn ingest(State(state): State<AppState>, Json(bundle): Json<IngestBundle>) -> Result<Json<IngestResponse>, AppError> {
    tracing::debug!(target = %bundle.target, bundle_id = %bundle.bundle_id, artifact_count = bundle.artifacts.len(), "ingesting bundle");
    let mut ingested = 0usize;
    let mut chained = Vec::with_capacity(bundle.events.len());

    for mut event in bundle.events {
        // Every event in a bundle belongs to the bundle's target; inject it
        // into the payload so attempt/task nodes carry a `target_id` the
        // query endpoints can filter on, without requiring every worker
        // call site to thread it through by hand.
        if let serde_json::Value::Object(ref mut map) = event.payload {
            map.entry("target_id").or_insert_with(|| serde_json::Value::String(bundle.target.clone()));
        }

        match state.journal.append(event).await {
            Ok(appended) => {
                if let Err(e) = state.graph.apply(&appended).await {
                    tracing::warn!(error = %e, "failed to apply event to graph projection");
                }
                chained.push(appended);
                ingested += 1;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to append event, skipping");
            }
        }
    }

    forward_to_observability(&state, &bundle.target, &bundle.bundle_id, &chained).await;

    Ok(Json(IngestResponse { ingested, bundle_id: bundle.bundle_id, status: "ok" }))
}

/// Best-effort fan-out to the optional observability sink. Never allowed
/// to fail the ingest response.
async fn forward_to_observability(state: &AppState, target: &str, bundle_id: &str, events: &[Event]) {
    if !state.observability_enabled {
        return;
    }
    let Some(url) = &state.observability_url else { return };

    let payload = serde_json::json!({ "target": target, "bundle_id": bundle_id, "events": events });
    let send = state.http.post(url).json(&payload).send();
    if tokio::time::timeout(Duration::from_secs(1), send).await.is_err() {
        tracing::warn!("observability forward timed out");
    }
}

// ---------------------------------------------------------------------------
// graph summary
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct GraphSummaryResponse {
    node_counts: serde_json::Value,
    edge_counts: serde_json::Value,
    recent_events: Vec<Event>,
}

const NODE_TYPES: &[NodeType] = &[
    NodeType::Target,
    NodeType::Task,
    NodeType::Attempt,
    NodeType::Workspace,
    NodeType::Artifact,
    NodeType::ModelCall,
    NodeType::TestRun,
    NodeType::Commit,
    NodeType::PullRequest,
    NodeType::PolicySnapshot,
    NodeType::Actor,
    NodeType::Delegation,
];

const EDGE_TYPES: &[EdgeType] = &[
    EdgeType::DependsOn,
    EdgeType::Produced,
    EdgeType::RunsIn,
    EdgeType::AuthorizedBy,
    EdgeType::Delegates,
    EdgeType::Invalidates,
    EdgeType::Supports,
    EdgeType::Contests,
];

async fn graph_summary(State(state): State<AppState>) -> Result<Json<GraphSummaryResponse>, AppError> {
    let mut node_counts = serde_json::Map::new();
    for node_type in NODE_TYPES {
        let count = state.graph.query_nodes(Some(*node_type), &[]).await.map_err(AppError::internal)?.len();
        node_counts.insert(node_type.to_string(), serde_json::json!(count));
    }

    let mut edge_counts = serde_json::Map::new();
    for edge_type in EDGE_TYPES {
        let count = state.graph.query_edges(None, None, Some(*edge_type)).await.map_err(AppError::internal)?.len();
        edge_counts.insert(edge_type.to_string(), serde_json::json!(count));
    }

    let mut events = state.journal.scan(None, None).await.map_err(AppError::internal)?;
    events.reverse();
    events.truncate(20);

    Ok(Json(GraphSummaryResponse {
        node_counts: serde_json::Value::Object(node_counts),
        edge_counts: serde_json::Value::Object(edge_counts),
        recent_events: events,
    }))
}

// ---------------------------------------------------------------------------
// attempts
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AttemptsQuery {
    target: Option<String>,
    limit: Option<usize>,
}

async fn list_attempts(State(state): State<AppState>, Query(query): Query<AttemptsQuery>) -> Result<Json<Vec<Node>>, AppError> {
    let filters = match &query.target {
        Some(target) => vec![PropertyFilter { key: "target_id".to_owned(), value: serde_json::Value::String(target.clone()) }],
        None => Vec::new(),
    };

    let mut attempts = state.graph.query_nodes(Some(NodeType::Attempt), &filters).await.map_err(AppError::internal)?;
    attempts.sort_by(|a, b| timestamp_of(b).cmp(&timestamp_of(a)));
    if let Some(limit) = query.limit {
        attempts.truncate(limit);
    }
    Ok(Json(attempts))
}

fn timestamp_of(node: &Node) -> String {
    node.properties.get("timestamp").and_then(|v| v.as_str()).unwrap_or_default().to_owned()
}

#[derive(Debug, Serialize)]
struct AttemptDetailResponse {
    attempt: Node,
    events: Vec<Event>,
    artifacts: Vec<Node>,
}

async fn get_attempt(State(state): State<AppState>, AxPath(id): AxPath<String>) -> Result<Json<AttemptDetailResponse>, AppError> {
    let attempt = state.graph.get_node(&id).await.map_err(AppError::internal)?.ok_or_else(|| AppError::not_found(format!("attempt {id} not found")))?;

    let all_events = state.journal.scan(None, None).await.map_err(AppError::internal)?;
    let events: Vec<Event> = all_events
        .into_iter()
        .filter(|e| e.payload.get("attempt_id").and_then(|v| v.as_str()) == Some(id.as_str()))
        .collect();

    let produced = state.graph.query_edges(Some(&id), None, Some(EdgeType::Produced)).await.map_err(AppError::internal)?;
    let mut artifacts = Vec::with_capacity(produced.len());
    for edge in produced {
        if let Some(node) = state.graph.get_node(&edge.to_node).await.map_err(AppError::internal)? {
            artifacts.push(node);
        }
    }

    Ok(Json(AttemptDetailResponse { attempt, events, artifacts }))
}

// ---------------------------------------------------------------------------
// failures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FailuresQuery {
    target: Option<String>,
    limit: Option<usize>,
}

async fn list_failures(State(state): State<AppState>, Query(query): Query<FailuresQuery>) -> Result<Json<Vec<Event>>, AppError> {
    let mut events = state.journal.scan(None, None).await.map_err(AppError::internal)?;
    events.retain(|e| {
        matches!(e.event_type, EventType::AttemptFailed | EventType::TaskBlocked)
            || (e.event_type == EventType::TaskCompleted
                && e.payload.get("status").and_then(|v| v.as_str()) == Some("failed"))
    });
    if let Some(target) = &query.target {
        events.retain(|e| e.payload.get("target_id").and_then(|v| v.as_str()) == Some(target.as_str()));
    }
    events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    if let Some(limit) = query.limit {
        events.truncate(limit);
    }
    Ok(Json(events))
}

// ---------------------------------------------------------------------------
// invalidate
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct InvalidateRequest {
    reason: String,
}

async fn invalidate_attempt(
    State(state): State<AppState>,
    AxPath(id): AxPath<String>,
    Json(body): Json<InvalidateRequest>,
) -> Result<Json<Node>, AppError> {
    let existing = state.graph.get_node(&id).await.map_err(AppError::internal)?.ok_or_else(|| AppError::not_found(format!("attempt {id} not found")))?;

    let event = NewEvent {
        event_id: uuid::Uuid::new_v4().to_string(),
        event_type: EventType::AttemptInvalidated,
        timestamp: chrono::Utc::now(),
        actor_id: "operator".to_owned(),
        payload: serde_json::json!({ "attempt_id": id, "status": "invalidated", "reason": body.reason }),
    };

    let appended = state.journal.append(event).await.map_err(AppError::internal)?;
    state.graph.apply(&appended).await.map_err(AppError::internal)?;

    let mut properties = existing.properties;
    if let serde_json::Value::Object(ref mut map) = properties {
        map.insert("status".to_owned(), serde_json::Value::String("invalidated".to_owned()));
        map.insert("invalidated_reason".to_owned(), serde_json::Value::String(body.reason));
    }

    Ok(Json(Node { node_id: id, node_type: NodeType::Attempt, properties }))
}

// ---------------------------------------------------------------------------
// autonomy status
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct AutonomyStatusResponse {
    autonomy_enabled: bool,
    source: String,
}

async fn autonomy_status(State(state): State<AppState>) -> Json<AutonomyStatusResponse> {
    Json(AutonomyStatusResponse { autonomy_enabled: state.autonomy_enabled, source: state.autonomy_source.clone() })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use cairn_store::graph::memory::MemoryGraph;
    use cairn_store::journal::ndjson::NdjsonJournal;
    use tower::ServiceExt;

    use super::*;

    async fn test_state() -> AppState {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let journal = Arc::new(NdjsonJournal::open(tmp.path()).await.unwrap());
        let graph = Arc::new(MemoryGraph::new());
        AppState {
            journal,
            graph,
            control_plane_token: "test-token".to_owned(),
            http: reqwest::Client::new(),
            observability_url: None,
            observability_enabled: false,
            autonomy_enabled: true,
            autonomy_source: "test".to_owned(),
        }
    }

    fn auth_request(uri: &str, method: &str, body: Body) -> Request<Body> {
        Request::builder().uri(uri).method(method).header("authorization", "Bearer test-token").body(body).unwrap()
    }

    #[tokio::test]
    async fn healthz_requires_no_token() {
        let app = build_router(test_state().await);
        let resp = app.oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn protected_route_rejects_missing_token() {
        let app = build_router(test_state().await);
        let resp = app
            .oneshot(Request::builder().uri("/v1/graph/summary").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn ingest_then_attempts_round_trip() {
        let app = build_router(test_state().await);

        let bundle = serde_json::json!({
            "target": "radix",
            "bundle_id": "bundle-1",
            "events": [
                {
                    "event_id": "e1",
                    "event_type": "attempt.started",
                    "timestamp": "2026-01-01T00:00:00Z",
                    "actor_id": "worker",
                    "payload": {"attempt_id": "a1", "task_id": "t1"}
                }
            ],
            "artifacts": []
        });

        let resp = app
            .clone()
            .oneshot(auth_request("/v1/events/ingest", "POST", Body::from(bundle.to_string())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(auth_request("/v1/attempts?target=radix", "GET", Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), 1_048_576).await.unwrap();
        let attempts: Vec<Node> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].node_id, "a1");
    }

    #[tokio::test]
    async fn invalidate_unknown_attempt_is_404() {
        let app = build_router(test_state().await);
        let body = serde_json::json!({ "reason": "duplicate" });
        let resp = app
            .oneshot(auth_request("/v1/attempts/unknown/invalidate", "POST", Body::from(body.to_string())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn autonomy_status_reports_configured_value() {
        let app = build_router(test_state().await);
        let resp = app.oneshot(auth_request("/v1/autonomy/status", "GET", Body::empty())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), 1_048_576).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["autonomy_enabled"], true);
    }
}
