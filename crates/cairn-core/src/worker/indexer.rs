//! Built-in executors for the `bootstrap` and `topology` scopes (spec
//! §4.6 step 4). Neither calls the oracle: both walk the checked-out
//! tree directly and emit discovery events plus a manifest artifact.
//! Grounded in the system-scope fallback and no-PR behavior observed in
//! the original worker's bootstrap test suite.

use std::path::Path;

use cairn_store::event::{EventType, NewEvent};
use chrono::Utc;
use uuid::Uuid;
use walkdir::WalkDir;

use super::ResolvedTask;

/// One named artifact produced by an indexing pass, paired with its
/// bytes so the caller can hand it to the artifact store uniformly.
pub struct IndexArtifact {
    pub name: String,
    pub bytes: Vec<u8>,
}

pub struct IndexResult {
    pub events: Vec<NewEvent>,
    pub artifacts: Vec<IndexArtifact>,
}

fn new_event(actor_id: &str, event_type: EventType, payload: serde_json::Value) -> NewEvent {
    NewEvent {
        event_id: Uuid::new_v4().to_string(),
        event_type,
        timestamp: Utc::now(),
        actor_id: actor_id.to_owned(),
        payload,
    }
}

/// Relative, `/`-separated paths of every tracked file under `root`,
/// excluding `.git`. Sorted for deterministic output.
fn list_repo_files(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let rel = entry.path().strip_prefix(root).ok()?;
            if rel.components().next().is_some_and(|c| c.as_os_str() == ".git") {
                return None;
            }
            Some(rel.to_string_lossy().replace('\\', "/"))
        })
        .collect();
    files.sort();
    files
}

/// `bootstrap` scope: index the repo tree and emit one `file.discovered`
/// event per tracked file, bracketed by `bootstrap.started`/
/// `bootstrap.completed`. Produces `repo_tree.txt` and
/// `repo_manifest.json` artifacts. Never opens a PR — the caller skips
/// apply/test/commit/push entirely for this scope.
pub fn run_bootstrap(workspace: &Path, task: &ResolvedTask, actor_id: &str) -> IndexResult {
    let files = list_repo_files(workspace);
    let mut events = Vec::with_capacity(files.len() + 3);

    events.push(new_event(
        actor_id,
        EventType::BootstrapStarted,
        serde_json::json!({ "task_id": task.id }),
    ));
    events.push(new_event(
        actor_id,
        EventType::RepoIndexed,
        serde_json::json!({ "task_id": task.id, "file_count": files.len() }),
    ));
    for path in &files {
        events.push(new_event(
            actor_id,
            EventType::FileDiscovered,
            serde_json::json!({ "task_id": task.id, "path": path }),
        ));
    }
    events.push(new_event(
        actor_id,
        EventType::BootstrapCompleted,
        serde_json::json!({ "task_id": task.id, "file_count": files.len() }),
    ));

    let tree_text = files.join("\n") + "\n";
    let manifest = serde_json::json!({
        "target": task.id,
        "file_count": files.len(),
        "files": files,
    });

    IndexResult {
        events,
        artifacts: vec![
            IndexArtifact {
                name: "repo_tree.txt".to_owned(),
                bytes: tree_text.into_bytes(),
            },
            IndexArtifact {
                name: "repo_manifest.json".to_owned(),
                bytes: serde_json::to_vec_pretty(&manifest).unwrap_or_default(),
            },
        ],
    }
}

/// Workflow files this indexer recognizes as CI/CD entry points.
fn is_workflow_file(rel_path: &str) -> bool {
    rel_path.starts_with(".github/workflows/") && (rel_path.ends_with(".yml") || rel_path.ends_with(".yaml"))
}

/// A conservative, language-agnostic scan for route-registration call
/// sites. False negatives are expected; this is a discovery aid, not a
/// router.
fn find_route_declarations(contents: &str) -> Vec<String> {
    const MARKERS: &[&str] = &[
        "@app.route(",
        "@router.get(",
        "@router.post(",
        ".route(\"",
        "router.get(",
        "router.post(",
        "#[get(\"",
        "#[post(\"",
    ];
    contents
        .lines()
        .filter(|line| MARKERS.iter().any(|marker| line.contains(marker)))
        .map(|line| line.trim().to_owned())
        .collect()
}

/// `topology` scope: discover CI workflow entry points and API route
/// declarations across the tree. Reuses the generic attempt lifecycle
/// events (no dedicated topology start/complete event type exists);
/// findings land in a `topology_manifest.json` artifact. Never opens a
/// PR, same as `bootstrap`.
pub fn run_topology(workspace: &Path, task: &ResolvedTask, actor_id: &str) -> IndexResult {
    let files = list_repo_files(workspace);
    let mut events = Vec::new();
    let mut workflows = Vec::new();
    let mut routes = Vec::new();

    for rel_path in &files {
        if is_workflow_file(rel_path) {
            workflows.push(rel_path.clone());
            events.push(new_event(
                actor_id,
                EventType::WorkflowDiscovered,
                serde_json::json!({ "task_id": task.id, "path": rel_path }),
            ));
            continue;
        }
        let Ok(contents) = std::fs::read_to_string(workspace.join(rel_path)) else {
            continue;
        };
        for declaration in find_route_declarations(&contents) {
            events.push(new_event(
                actor_id,
                EventType::ApiRouteDiscovered,
                serde_json::json!({ "task_id": task.id, "path": rel_path, "declaration": declaration }),
            ));
            routes.push(serde_json::json!({ "path": rel_path, "declaration": declaration }));
        }
    }

    let manifest = serde_json::json!({
        "target": task.id,
        "workflows": workflows,
        "routes": routes,
    });

    IndexResult {
        events,
        artifacts: vec![IndexArtifact {
            name: "topology_manifest.json".to_owned(),
            bytes: serde_json::to_vec_pretty(&manifest).unwrap_or_default(),
        }],
    }
}
