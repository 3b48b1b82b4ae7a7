//! Postgres-backed journal. Append-only-ness is enforced twice: at the
//! storage level by the `events_no_update`/`events_no_delete` triggers
//! (§0001_init.sql), and by this type never issuing `UPDATE`/`DELETE`.

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::event::{Event, EventType, NewEvent};
use crate::journal::{Journal, JournalError, Result};

pub struct PostgresJournal {
    pool: PgPool,
}

impl PostgresJournal {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Journal for PostgresJournal {
    async fn append(&self, new: NewEvent) -> Result<Event> {
        let mut tx = self.pool.begin().await?;

        // SELECT ... FOR UPDATE on the tail row serializes concurrent
        // appenders within this database so each sees the true last hash.
        let prev_hash: Option<String> = sqlx::query_scalar(
            "SELECT hash FROM events ORDER BY seq DESC LIMIT 1 FOR UPDATE",
        )
        .fetch_optional(&mut *tx)
        .await?;

        let event = Event::chain(new, prev_hash);

        sqlx::query(
            "INSERT INTO events (event_id, event_type, occurred_at, actor_id, payload, prev_hash, hash) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&event.event_id)
        .bind(event.event_type.to_string())
        .bind(event.timestamp)
        .bind(&event.actor_id)
        .bind(&event.payload)
        .bind(&event.prev_hash)
        .bind(&event.hash)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(event)
    }

    async fn scan(&self, since: Option<&str>, limit: Option<usize>) -> Result<Vec<Event>> {
        let since_seq: Option<i64> = match since {
            Some(event_id) => {
                let seq: i64 = sqlx::query_scalar("SELECT seq FROM events WHERE event_id = $1")
                    .bind(event_id)
                    .fetch_one(&self.pool)
                    .await?;
                Some(seq)
            }
            None => None,
        };

        let rows = sqlx::query(
            "SELECT event_id, event_type, occurred_at, actor_id, payload, prev_hash, hash \
             FROM events \
             WHERE $1::bigint IS NULL OR seq > $1 \
             ORDER BY seq ASC \
             LIMIT $2",
        )
        .bind(since_seq)
        .bind(limit.map(|l| l as i64).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let event_type: String = row.try_get("event_type")?;
                let event_type: EventType = event_type
                    .parse()
                    .map_err(|e: crate::event::EventTypeParseError| JournalError::ChainViolation {
                        event_id: row.try_get::<String, _>("event_id").unwrap_or_default(),
                        reason: e.to_string(),
                    })?;
                Ok(Event {
                    event_id: row.try_get("event_id")?,
                    event_type,
                    timestamp: row.try_get("occurred_at")?,
                    actor_id: row.try_get("actor_id")?,
                    payload: row.try_get("payload")?,
                    prev_hash: row.try_get("prev_hash")?,
                    hash: row.try_get("hash")?,
                })
            })
            .collect()
    }

    async fn last_hash(&self) -> Result<Option<String>> {
        let hash: Option<String> =
            sqlx::query_scalar("SELECT hash FROM events ORDER BY seq DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn new_event(id: &str) -> NewEvent {
        NewEvent {
            event_id: id.to_owned(),
            event_type: EventType::TaskCreated,
            timestamp: Utc::now(),
            actor_id: "scheduler".to_owned(),
            payload: serde_json::json!({"id": id}),
        }
    }

    #[tokio::test]
    async fn append_and_scan_round_trip() {
        let (pool, db_name) = cairn_test_utils::create_test_db().await;
        crate::pool::run_migrations(&pool).await.unwrap();
        let journal = PostgresJournal::new(pool);

        let e1 = journal.append(new_event("e1")).await.unwrap();
        let e2 = journal.append(new_event("e2")).await.unwrap();
        assert!(e1.prev_hash.is_none());
        assert_eq!(e2.prev_hash, Some(e1.hash));

        let scanned = journal.scan(None, None).await.unwrap();
        assert_eq!(scanned.len(), 2);

        cairn_test_utils::drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn append_only_trigger_rejects_update() {
        let (pool, db_name) = cairn_test_utils::create_test_db().await;
        crate::pool::run_migrations(&pool).await.unwrap();
        let journal = PostgresJournal::new(pool.clone());
        journal.append(new_event("e1")).await.unwrap();

        let result = sqlx::query("UPDATE events SET actor_id = 'tampered' WHERE event_id = 'e1'")
            .execute(&pool)
            .await;
        assert!(result.is_err());

        cairn_test_utils::drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn verify_succeeds_on_untampered_journal() {
        let (pool, db_name) = cairn_test_utils::create_test_db().await;
        crate::pool::run_migrations(&pool).await.unwrap();
        let journal = PostgresJournal::new(pool);
        for i in 0..4 {
            journal.append(new_event(&format!("e{i}"))).await.unwrap();
        }
        assert_eq!(
            journal.verify().await.unwrap(),
            crate::journal::VerifyOutcome::Ok
        );
        cairn_test_utils::drop_test_db(&db_name).await;
    }
}
