//! Content-addressed artifact store.
//!
//! Two interchangeable back-ends, selected once at process start:
//! [`file::FileArtifactStore`] (sharded local filesystem) and
//! [`object::ObjectArtifactStore`] (HTTP object storage).

pub mod file;
pub mod object;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// The closed set of artifact kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Log,
    TestOutput,
    Diff,
    ModelOutput,
    Patch,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Log => "log",
            Self::TestOutput => "test_output",
            Self::Diff => "diff",
            Self::ModelOutput => "model_output",
            Self::Patch => "patch",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactKindParseError(pub String);

impl fmt::Display for ArtifactKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unrecognized artifact kind: {:?}", self.0)
    }
}

impl std::error::Error for ArtifactKindParseError {}

impl FromStr for ArtifactKind {
    type Err = ArtifactKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "log" => Self::Log,
            "test_output" => Self::TestOutput,
            "diff" => Self::Diff,
            "model_output" => Self::ModelOutput,
            "patch" => Self::Patch,
            other => return Err(ArtifactKindParseError(other.to_owned())),
        })
    }
}

impl Serialize for ArtifactKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ArtifactKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Coordinates returned by [`ArtifactStore::put`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub hash: String,
    pub uri: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("artifact {hash} not found")]
    NotFound { hash: String },

    #[error("back-end failure: {0}")]
    BackendFailure(String),
}

pub type Result<T> = std::result::Result<T, ArtifactError>;

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` under its SHA-256 hash. Returns existing coordinates
    /// without rewriting if the content is already present (invariant A1).
    async fn put(&self, bytes: &[u8], kind: ArtifactKind) -> Result<ArtifactRef>;

    /// Fetch the full contents previously `put` under `hash`.
    async fn get(&self, hash: &str) -> Result<Vec<u8>>;

    async fn exists(&self, hash: &str) -> Result<bool>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Shard key per invariant A2: `<hash[0:2]>/<hash>`.
pub fn shard_path(hash: &str) -> String {
    format!("{}/{hash}", &hash[..2.min(hash.len())])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_kind_round_trips() {
        for kind in [
            ArtifactKind::Log,
            ArtifactKind::TestOutput,
            ArtifactKind::Diff,
            ArtifactKind::ModelOutput,
            ArtifactKind::Patch,
        ] {
            assert_eq!(kind.to_string().parse::<ArtifactKind>().unwrap(), kind);
        }
    }

    #[test]
    fn shard_path_uses_first_two_hex_chars() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(shard_path(&hash), format!("{}/{}", &hash[..2], hash));
    }

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(sha256_hex(b"abc"), sha256_hex(b"abc"));
        assert_ne!(sha256_hex(b"abc"), sha256_hex(b"abd"));
    }
}
