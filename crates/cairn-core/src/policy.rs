//! Policy & path guard. Pure, side-effect-free: no I/O, no
//! clock reads. Two checks, both prefix matching with segment boundaries
//! honored so `docs` never matches `docs-internal/`.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("path {path:?} matches deny pattern {pattern:?}")]
    Denied { path: String, pattern: String },

    #[error("path {path:?} matches no allow pattern")]
    NotAllowed { path: String },

    #[error("path {path:?} is outside the task's allowed_paths")]
    PathViolation { path: String },
}

/// A single prefix pattern, optionally ending in `*` to mean "this prefix
/// and everything under it" (the default interpretation of a bare prefix
/// anyway; the trailing `*` is accepted for readability in config files).
fn pattern_prefix(pattern: &str) -> &str {
    pattern.strip_suffix('*').unwrap_or(pattern)
}

/// True if `path` falls under `prefix`, honoring segment boundaries: a
/// prefix `docs` matches `docs/readme.md` and `docs` itself, but not
/// `docs-internal/readme.md`.
fn matches_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn matches_pattern(path: &str, pattern: &str) -> bool {
    matches_prefix(path, pattern_prefix(pattern))
}

/// Scope permitted?: every path in `allowed_paths` must not
/// match any deny pattern, and if `allow` is non-empty must match at
/// least one allow pattern.
pub fn scope_permitted(
    allowed_paths: &[String],
    allow: &[String],
    deny: &[String],
) -> Result<(), PolicyError> {
    for path in allowed_paths {
        if let Some(pattern) = deny.iter().find(|p| matches_pattern(path, p)) {
            return Err(PolicyError::Denied {
                path: path.clone(),
                pattern: pattern.clone(),
            });
        }
        if !allow.is_empty() && !allow.iter().any(|p| matches_pattern(path, p)) {
            return Err(PolicyError::NotAllowed { path: path.clone() });
        }
    }
    Ok(())
}

/// Write permitted?: `path` must fall under at least one of
/// the task's `allowed_paths`.
pub fn write_permitted(path: &str, allowed_paths: &[String]) -> Result<(), PolicyError> {
    if allowed_paths.iter().any(|p| matches_pattern(path, p)) {
        Ok(())
    } else {
        Err(PolicyError::PathViolation { path: path.to_owned() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn scope_permitted_passes_with_empty_allow_and_deny() {
        assert!(scope_permitted(&strings(&["docs/"]), &[], &[]).is_ok());
    }

    #[test]
    fn scope_permitted_fails_on_deny_match() {
        let result = scope_permitted(&strings(&["infra/terraform"]), &[], &strings(&["infra"]));
        assert!(matches!(result, Err(PolicyError::Denied { .. })));
    }

    #[test]
    fn scope_permitted_requires_allow_match_when_allow_nonempty() {
        let result = scope_permitted(&strings(&["src/main.rs"]), &strings(&["docs"]), &[]);
        assert!(matches!(result, Err(PolicyError::NotAllowed { .. })));
    }

    #[test]
    fn scope_permitted_passes_when_allow_matches() {
        assert!(scope_permitted(&strings(&["docs/readme.md"]), &strings(&["docs"]), &[]).is_ok());
    }

    #[test]
    fn segment_boundary_is_honored() {
        // "docs" must not match "docs-internal/file.md".
        assert!(!matches_pattern("docs-internal/file.md", "docs"));
        assert!(matches_pattern("docs/file.md", "docs"));
        assert!(matches_pattern("docs", "docs"));
    }

    #[test]
    fn trailing_star_is_accepted_as_a_prefix_marker() {
        assert!(matches_pattern("docs/readme.md", "docs/*"));
    }

    #[test]
    fn write_permitted_checks_against_allowed_paths() {
        let allowed = strings(&["docs/"]);
        assert!(write_permitted("docs/readme.md", &allowed).is_ok());
        assert!(matches!(
            write_permitted("src/main.rs", &allowed),
            Err(PolicyError::PathViolation { .. })
        ));
    }

    #[test]
    fn deny_takes_priority_over_allow() {
        let result = scope_permitted(
            &strings(&["docs/secrets.md"]),
            &strings(&["docs"]),
            &strings(&["docs/secrets.md"]),
        );
        assert!(matches!(result, Err(PolicyError::Denied { .. })));
    }
}
