//! HTTP object-storage artifact back-end, for an S3-compatible endpoint
//! addressed by plain PUT/GET/HEAD (no SDK-specific signing beyond a
//! bearer token, matching how the ingest-forwarding client talks to the
//! observability sink).

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};

use crate::artifact::{sha256_hex, shard_path, ArtifactError, ArtifactKind, ArtifactRef, ArtifactStore, Result};

pub struct ObjectArtifactStore {
    client: Client,
    base_url: String,
    bucket: String,
}

impl ObjectArtifactStore {
    pub fn new(base_url: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            bucket: bucket.into(),
        }
    }

    fn object_url(&self, hash: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.bucket,
            shard_path(hash)
        )
    }

    fn object_uri(&self, hash: &str) -> String {
        format!("s3://{}/{}", self.bucket, shard_path(hash))
    }
}

#[async_trait]
impl ArtifactStore for ObjectArtifactStore {
    async fn put(&self, bytes: &[u8], _kind: ArtifactKind) -> Result<ArtifactRef> {
        let hash = sha256_hex(bytes);

        // Check existence before put to avoid a redundant upload; a lost
        // race against a concurrent identical put is a harmless no-op
        // since the object content is determined entirely by the hash.
        if !self.exists(&hash).await? {
            let response = self
                .client
                .put(self.object_url(&hash))
                .body(bytes.to_vec())
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(ArtifactError::BackendFailure(format!(
                    "PUT returned {}",
                    response.status()
                )));
            }
        }

        Ok(ArtifactRef {
            hash: hash.clone(),
            uri: self.object_uri(&hash),
            size: bytes.len() as u64,
            created_at: Utc::now(),
        })
    }

    async fn get(&self, hash: &str) -> Result<Vec<u8>> {
        let response = self.client.get(self.object_url(hash)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(ArtifactError::NotFound { hash: hash.to_owned() }),
            status if status.is_success() => Ok(response.bytes().await?.to_vec()),
            status => Err(ArtifactError::BackendFailure(format!("GET returned {status}"))),
        }
    }

    async fn exists(&self, hash: &str) -> Result<bool> {
        let response = self.client.head(self.object_url(hash)).send().await?;
        Ok(response.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_uri_embeds_bucket_and_shard() {
        let store = ObjectArtifactStore::new("https://objects.internal", "cairn-artifacts");
        let hash = sha256_hex(b"anything");
        assert_eq!(
            store.object_uri(&hash),
            format!("s3://cairn-artifacts/{}", shard_path(&hash))
        );
    }

    #[test]
    fn object_url_strips_trailing_slash_from_base() {
        let store = ObjectArtifactStore::new("https://objects.internal/", "bucket");
        let hash = sha256_hex(b"anything");
        assert!(store
            .object_url(&hash)
            .starts_with("https://objects.internal/bucket/"));
    }
}
