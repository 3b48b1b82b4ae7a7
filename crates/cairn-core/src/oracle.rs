//! Code-generation oracle client: a request/response exchange
//! with the model that proposes a file set for a task. Named by
//! contract — the oracle is an external collaborator, not something
//! this crate implements.

use std::collections::{BTreeMap, BTreeSet};

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A file as it currently exists in the task's allowed paths, for
/// inclusion in the oracle request. Truncated past a byte limit so a
/// single huge file doesn't blow out the request.
#[derive(Debug, Clone, Serialize)]
pub struct FileContext {
    pub path: String,
    pub content: String,
    pub truncated: bool,
}

pub const DEFAULT_MAX_FILE_BYTES: usize = 200 * 1024;

/// Truncate `content` to `max_bytes`, returning whether truncation occurred.
/// Mirrors the original system's behavior of keeping a readable prefix
/// plus an explicit marker rather than cutting mid-byte.
pub fn truncate_file_content(content: &str, max_bytes: usize) -> (String, bool) {
    if content.len() <= max_bytes {
        return (content.to_string(), false);
    }
    let mut end = max_bytes;
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = content[..end].to_string();
    truncated.push_str(&format!(
        "\n\n[... TRUNCATED: file is {} bytes, showing first {} ...]",
        content.len(),
        end
    ));
    (truncated, true)
}

/// Context carried on a retry after a failed test/validation step, so the
/// oracle can see what went wrong last time.
#[derive(Debug, Clone, Serialize)]
pub struct RetryContext {
    pub test_output: String,
    pub failure_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OracleRequest {
    pub task_id: String,
    pub title: String,
    pub scope: String,
    pub priority: String,
    pub estimated_size: String,
    pub allowed_paths: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    pub files: Vec<FileContext>,
    pub retry_context: Option<RetryContext>,
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("oracle response was not valid JSON and could not be salvaged: {0}")]
    Unparseable(String),

    #[error("oracle response missing required paths: {0:?}")]
    MissingPaths(Vec<String>),

    #[error("oracle response included paths outside allowed_paths: {0:?}")]
    ExtraPaths(Vec<String>),

    #[error("oracle response had duplicate path: {0}")]
    DuplicatePath(String),

    #[error("item for path {path} failed base64 decode: {source}")]
    Base64 { path: String, source: base64::DecodeError },

    #[error("item for path {path} decoded bytes were not valid UTF-8")]
    Utf8 { path: String },
}

pub type Result<T> = std::result::Result<T, OracleError>;

/// A successfully parsed and validated oracle response: the complete
/// file set the task is allowed to write, and the repairs (if any)
/// applied to recover it from a malformed raw response.
#[derive(Debug, Clone)]
pub struct OracleFileSet {
    pub files: BTreeMap<String, String>,
    pub repairs_applied: Vec<String>,
}

#[async_trait::async_trait]
pub trait OracleClient: Send + Sync {
    async fn generate(&self, request: &OracleRequest) -> Result<String>;
}

/// HTTP oracle client: POSTs the request as JSON, returns the raw
/// response body text for [`parse_oracle_response`] to interpret. The
/// body is treated as opaque text rather than typed JSON because the
/// model may return any of the shapes repair needs to tolerate.
pub struct HttpOracleClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpOracleClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: None,
        }
    }

    /// Attach a bearer token to every request.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

#[async_trait::async_trait]
impl OracleClient for HttpOracleClient {
    async fn generate(&self, request: &OracleRequest) -> Result<String> {
        let mut req = self.client.post(&self.endpoint).json(request);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }
        let body = req.send().await?.error_for_status()?.text().await?;
        Ok(body)
    }
}

#[derive(Debug, Deserialize)]
struct ArrayItem {
    path: String,
    content_b64: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ResponseShape {
    Array(Vec<ArrayItem>),
    LegacyDict(BTreeMap<String, String>),
}

/// Strip a markdown code fence or leading/trailing prose around a JSON
/// array, returning the candidate JSON text plus a human-readable note
/// of what was done (recorded in the model_output artifact).
fn extract_json_candidate(output: &str) -> (String, Vec<String>) {
    let mut repairs = Vec::new();
    let trimmed = output.trim();

    let fence = Regex::new(r"(?s)```(?:json)?\s*\n?(.*?)\n?```").unwrap();
    if let Some(caps) = fence.captures(trimmed) {
        repairs.push("stripped markdown code fence".to_string());
        return (caps[1].trim().to_string(), repairs);
    }

    if let Some(start) = trimmed.find(['[', '{']) {
        if let Some(end) = trimmed.rfind([']', '}']) {
            if end > start {
                repairs.push("extracted JSON array from surrounding text".to_string());
                return (trimmed[start..=end].to_string(), repairs);
            }
        }
    }

    (trimmed.to_string(), repairs)
}

/// Remove whitespace from inside `content_b64` string values only;
/// `path` and any other fields are left untouched.
fn repair_base64_whitespace(json_text: &str) -> (String, usize) {
    let field = Regex::new(r#""content_b64"\s*:\s*"((?:[^"\\]|\\.)*)""#).unwrap();
    let mut removed = 0;
    let repaired = field
        .replace_all(json_text, |caps: &regex_lite::Captures| {
            let value = &caps[1];
            let stripped: String = value.chars().filter(|c| !c.is_whitespace()).collect();
            removed += value.chars().filter(|c| c.is_whitespace()).count();
            format!(r#""content_b64": "{stripped}""#)
        })
        .into_owned();
    (repaired, removed)
}

/// Extract complete `{"path": ..., "content_b64": ...}` objects from
/// text that may be truncated mid-array or mid-object. Incomplete
/// trailing entries are discarded rather than treated as an error;
/// callers still enforce path-set equality afterward.
fn salvage_partial_json(text: &str) -> Vec<ArrayItem> {
    let entry = Regex::new(
        r#"\{\s*"path"\s*:\s*"((?:[^"\\]|\\.)*)"\s*,\s*"content_b64"\s*:\s*"((?:[^"\\]|\\.)*)"\s*\}"#,
    )
    .unwrap();

    entry
        .captures_iter(text)
        .map(|caps| ArrayItem {
            path: caps[1].to_string(),
            content_b64: caps[2].chars().filter(|c| !c.is_whitespace()).collect(),
        })
        .collect()
}

fn decode_items(items: Vec<ArrayItem>) -> Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    for item in items {
        if files.contains_key(&item.path) {
            return Err(OracleError::DuplicatePath(item.path));
        }
        let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &item.content_b64)
            .map_err(|source| OracleError::Base64 { path: item.path.clone(), source })?;
        let content = String::from_utf8(bytes).map_err(|_| OracleError::Utf8 { path: item.path.clone() })?;
        files.insert(item.path, content);
    }
    Ok(files)
}

fn check_path_completeness(files: &BTreeMap<String, String>, allowed_paths: &[String]) -> Result<()> {
    let allowed: BTreeSet<&str> = allowed_paths.iter().map(String::as_str).collect();
    let got: BTreeSet<&str> = files.keys().map(String::as_str).collect();

    let missing: Vec<String> = allowed.difference(&got).map(|s| s.to_string()).collect();
    if !missing.is_empty() {
        return Err(OracleError::MissingPaths(missing));
    }

    let extra: Vec<String> = got.difference(&allowed).map(|s| s.to_string()).collect();
    if !extra.is_empty() {
        return Err(OracleError::ExtraPaths(extra));
    }

    Ok(())
}

/// Parse and validate a raw oracle response: tolerates
/// markdown fences and whitespace inside base64 fields, salvages
/// complete pairs from a truncated tail, and enforces that the
/// returned path set equals `allowed_paths` exactly.
pub fn parse_oracle_response(raw: &str, allowed_paths: &[String]) -> Result<OracleFileSet> {
    let mut repairs_applied = Vec::new();

    let (candidate, fence_repairs) = extract_json_candidate(raw);
    repairs_applied.extend(fence_repairs);

    let (candidate, whitespace_removed) = repair_base64_whitespace(&candidate);
    if whitespace_removed > 0 {
        repairs_applied.push(format!("removed {whitespace_removed} whitespace char(s) from base64 fields"));
    }

    let files = match serde_json::from_str::<ResponseShape>(&candidate) {
        Ok(ResponseShape::Array(items)) => decode_items(items)?,
        Ok(ResponseShape::LegacyDict(map)) => {
            repairs_applied.push("used legacy path-to-content mapping".to_string());
            map
        }
        Err(_) => {
            let salvaged = salvage_partial_json(&candidate);
            if salvaged.is_empty() {
                return Err(OracleError::Unparseable(format!(
                    "no complete {{path, content_b64}} pairs could be salvaged from response of {} byte(s)",
                    raw.len()
                )));
            }
            repairs_applied.push(format!("salvaged {} complete entries from a malformed tail", salvaged.len()));
            decode_items(salvaged)?
        }
    };

    check_path_completeness(&files, allowed_paths)?;

    Ok(OracleFileSet { files, repairs_applied })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(s: &str) -> String {
        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, s.as_bytes())
    }

    #[test]
    fn parses_clean_array_response() {
        let raw = format!(r#"[{{"path": "a.py", "content_b64": "{}"}}]"#, b64("hello"));
        let result = parse_oracle_response(&raw, &["a.py".to_string()]).unwrap();
        assert_eq!(result.files["a.py"], "hello");
        assert!(result.repairs_applied.is_empty());
    }

    #[test]
    fn rejects_envelope_shape() {
        // `{"files": [...]}` is not one of the two accepted shapes (bare
        // array, or legacy path->content dict).
        let raw = format!(r#"{{"files": [{{"path": "a.py", "content_b64": "{}"}}]}}"#, b64("hi"));
        assert!(parse_oracle_response(&raw, &["a.py".to_string()]).is_err());
    }

    #[test]
    fn parses_legacy_dict_shape() {
        let raw = r#"{"a.py": "raw content"}"#;
        let result = parse_oracle_response(raw, &["a.py".to_string()]).unwrap();
        assert_eq!(result.files["a.py"], "raw content");
        assert!(result.repairs_applied.iter().any(|r| r.contains("legacy")));
    }

    #[test]
    fn strips_markdown_fence() {
        let raw = format!("```json\n[{{\"path\": \"a.py\", \"content_b64\": \"{}\"}}]\n```", b64("x"));
        let result = parse_oracle_response(&raw, &["a.py".to_string()]).unwrap();
        assert_eq!(result.files["a.py"], "x");
        assert!(result.repairs_applied.iter().any(|r| r.contains("fence")));
    }

    #[test]
    fn repairs_whitespace_inside_base64() {
        let content_b64 = b64("import os\nimport sys\n");
        let wrapped = format!("{}\n  {}", &content_b64[..10], &content_b64[10..]);
        let raw = format!(r#"[{{"path": "a.py", "content_b64": "{wrapped}"}}]"#);
        let result = parse_oracle_response(&raw, &["a.py".to_string()]).unwrap();
        assert_eq!(result.files["a.py"], "import os\nimport sys\n");
    }

    #[test]
    fn salvages_complete_pairs_from_truncated_tail() {
        let raw = format!(
            r#"[{{"path": "a.py", "content_b64": "{}"}}, {{"path": "b.py", "content_b64": "{}"}}, {{"path": "c.py", "content_b64": "trun"#,
            b64("one"),
            b64("two")
        );
        let result = parse_oracle_response(&raw, &["a.py".to_string(), "b.py".to_string()]).unwrap();
        assert_eq!(result.files.len(), 2);
        assert_eq!(result.files["a.py"], "one");
        assert_eq!(result.files["b.py"], "two");
    }

    #[test]
    fn missing_allowed_path_is_rejected() {
        let raw = format!(r#"[{{"path": "a.py", "content_b64": "{}"}}]"#, b64("x"));
        let err = parse_oracle_response(&raw, &["a.py".to_string(), "b.py".to_string()]).unwrap_err();
        assert!(matches!(err, OracleError::MissingPaths(_)));
    }

    #[test]
    fn extra_path_is_rejected() {
        let raw = format!(
            r#"[{{"path": "a.py", "content_b64": "{}"}}, {{"path": "forbidden.py", "content_b64": "{}"}}]"#,
            b64("x"),
            b64("y")
        );
        let err = parse_oracle_response(&raw, &["a.py".to_string()]).unwrap_err();
        assert!(matches!(err, OracleError::ExtraPaths(_)));
    }

    #[test]
    fn duplicate_path_is_rejected() {
        let item = b64("x");
        let raw = format!(r#"[{{"path": "a.py", "content_b64": "{item}"}}, {{"path": "a.py", "content_b64": "{item}"}}]"#);
        let err = parse_oracle_response(&raw, &["a.py".to_string()]).unwrap_err();
        assert!(matches!(err, OracleError::DuplicatePath(_)));
    }

    #[test]
    fn completely_unparseable_response_fails() {
        let err = parse_oracle_response("not json at all", &["a.py".to_string()]).unwrap_err();
        assert!(matches!(err, OracleError::Unparseable(_)));
    }

    #[test]
    fn truncate_file_content_marks_large_files() {
        let big = "x".repeat(1000);
        let (content, truncated) = truncate_file_content(&big, 100);
        assert!(truncated);
        assert!(content.contains("TRUNCATED"));
        assert!(content.len() < big.len());
    }

    #[test]
    fn truncate_file_content_leaves_small_files_alone() {
        let (content, truncated) = truncate_file_content("small", 100);
        assert!(!truncated);
        assert_eq!(content, "small");
    }
}
