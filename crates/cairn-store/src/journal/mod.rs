//! Append-only event journal.
//!
//! Two interchangeable back-ends: [`ndjson`] (newline-delimited file,
//! single-process) and [`postgres`] (relational, trigger-enforced
//! append-only). Both implement the same [`Journal`] trait so the
//! scheduler, worker, and ingest API are written against the trait only.

pub mod ndjson;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use crate::event::{Event, NewEvent};

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("hash chain violated at event {event_id}: {reason}")]
    ChainViolation { event_id: String, reason: String },
}

pub type Result<T> = std::result::Result<T, JournalError>;

/// The result of [`Journal::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Ok,
    Tampered { event_id: String, reason: String },
}

/// Append-only, hash-chained event log. See
///
/// Implementations must serialize concurrent `append` calls: the chain
/// observed by any successful return is the one durably persisted
/// (single-appender-per-process invariant).
#[async_trait]
pub trait Journal: Send + Sync {
    /// Append one event, deriving `prev_hash`/`hash` from the current
    /// tail, and return the fully hash-chained event. Acknowledged only
    /// once the event is durable.
    async fn append(&self, event: NewEvent) -> Result<Event>;

    /// Return events in original append order, optionally starting after
    /// a given event id and bounded by `limit`.
    async fn scan(&self, since: Option<&str>, limit: Option<usize>) -> Result<Vec<Event>>;

    /// The hash of the most recently appended event, or `None` if empty.
    async fn last_hash(&self) -> Result<Option<String>>;

    /// Walk the entire log and check H1 (per-event hash) and H2 (chain
    /// linkage) for every event, and that the first event carries no
    /// `prev_hash`.
    async fn verify(&self) -> Result<VerifyOutcome> {
        let events = self.scan(None, None).await?;
        let mut prev: Option<&str> = None;
        for (i, event) in events.iter().enumerate() {
            if event.hash != event.expected_hash() {
                return Ok(VerifyOutcome::Tampered {
                    event_id: event.event_id.clone(),
                    reason: "hash does not match canonical serialization (H1)".to_owned(),
                });
            }
            if i == 0 {
                if event.prev_hash.is_some() {
                    return Ok(VerifyOutcome::Tampered {
                        event_id: event.event_id.clone(),
                        reason: "first event must not carry a prev_hash".to_owned(),
                    });
                }
            } else if event.prev_hash.as_deref() != prev {
                return Ok(VerifyOutcome::Tampered {
                    event_id: event.event_id.clone(),
                    reason: "prev_hash does not match predecessor's hash (H2)".to_owned(),
                });
            }
            prev = Some(&event.hash);
        }
        Ok(VerifyOutcome::Ok)
    }
}
