//! Networked Postgres transcript store.
//!
//! Multi-process backend: every mutation is a single transaction guarded
//! by a transaction-scoped advisory lock, so no external lock file is
//! needed and concurrent writers from different processes serialize in
//! the database. Ids come from a `BIGSERIAL`, so they may be sparse but
//! are always increasing in commit order.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use colloquy_core::error::TranscriptError;
use colloquy_core::message::Message;
use colloquy_core::sanitize::fingerprint;
use colloquy_core::transcript::{HealthReport, TranscriptSnapshot, TranscriptStore};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::meta;
use crate::sqlite::metadata_from_bag;
use crate::validate::{metadata_object, metadata_tokens, validate_message};

/// Transaction-scoped advisory lock key ("colloquy" as big-endian bytes).
const ADVISORY_LOCK_KEY: i64 = 0x636f_6c6c_6f71_7579;

#[derive(Clone)]
pub struct PostgresTranscriptStore {
    pool: PgPool,
    max_message_length: usize,
}

impl PostgresTranscriptStore {
    /// Connect to `url` and ensure the transcript tables exist.
    pub async fn connect(url: &str, max_message_length: usize) -> Result<Self, TranscriptError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|err| TranscriptError::Unavailable(err.to_string()))?;

        let store = Self {
            pool,
            max_message_length,
        };
        store.ensure_tables().await?;
        store.init_metadata().await?;

        tracing::info!(backend = "postgres", "store_initialized");
        Ok(store)
    }

    /// Idempotent schema setup.
    async fn ensure_tables(&self) -> Result<(), TranscriptError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS transcript_metadata (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS transcript_messages (
                id          BIGSERIAL PRIMARY KEY,
                sender      TEXT NOT NULL,
                content     TEXT NOT NULL,
                timestamp   TIMESTAMPTZ NOT NULL,
                fingerprint TEXT NOT NULL,
                metadata    JSONB NOT NULL DEFAULT '{}'::jsonb
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_transcript_messages_sender
                ON transcript_messages (sender)
            "#,
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(sql_err)?;
        }
        Ok(())
    }

    async fn init_metadata(&self) -> Result<(), TranscriptError> {
        let defaults = [
            (meta::CREATED_AT, Utc::now().to_rfc3339()),
            (meta::TOTAL_TURNS, "0".to_string()),
            (meta::TOTAL_TOKENS, "0".to_string()),
            (meta::TERMINATED, "0".to_string()),
        ];
        for (key, value) in defaults {
            sqlx::query(
                "INSERT INTO transcript_metadata (key, value) VALUES ($1, $2) \
                 ON CONFLICT (key) DO NOTHING",
            )
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        }
        Ok(())
    }

    async fn meta_value(&self, key: &str) -> Result<Option<String>, TranscriptError> {
        let row = sqlx::query("SELECT value FROM transcript_metadata WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }
}

async fn bump_counter(
    tx: &mut sqlx::PgConnection,
    key: &str,
    delta: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO transcript_metadata (key, value) VALUES ($1, $2::text)
        ON CONFLICT (key) DO UPDATE
            SET value = ((transcript_metadata.value)::bigint + $2)::text
        "#,
    )
    .bind(key)
    .bind(delta)
    .execute(tx)
    .await?;
    Ok(())
}

fn row_to_message(row: &sqlx::postgres::PgRow) -> Message {
    let id: i64 = row.get("id");
    let metadata = match row.try_get::<serde_json::Value, _>("metadata") {
        Ok(value @ serde_json::Value::Object(_)) => value,
        Ok(_) | Err(_) => {
            tracing::warn!(message_id = id, "message_metadata_corrupt");
            serde_json::json!({})
        }
    };

    Message {
        id,
        sender: row.get("sender"),
        content: row.get("content"),
        timestamp: row.get::<DateTime<Utc>, _>("timestamp"),
        fingerprint: row.get("fingerprint"),
        metadata,
    }
}

fn sql_err(err: sqlx::Error) -> TranscriptError {
    match &err {
        sqlx::Error::PoolClosed | sqlx::Error::Configuration(_) => {
            TranscriptError::Unavailable(err.to_string())
        }
        sqlx::Error::Io(_) => TranscriptError::Transient(err.to_string()),
        _ => TranscriptError::Transient(err.to_string()),
    }
}

#[async_trait::async_trait]
impl TranscriptStore for PostgresTranscriptStore {
    async fn append_guarded(
        &self,
        sender: &str,
        content: &str,
        metadata: serde_json::Value,
        expect_last_sender: Option<Option<&str>>,
    ) -> Result<Message, TranscriptError> {
        let (sender, content) = validate_message(sender, content, self.max_message_length)?;
        let metadata = metadata_object(metadata);
        let tokens = metadata_tokens(&metadata);
        let timestamp = Utc::now();
        let content_fingerprint = fingerprint(&content);

        let mut tx = self.pool.begin().await.map_err(sql_err)?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(ADVISORY_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(sql_err)?;

        if let Some(expected) = expect_last_sender {
            let observed: Option<String> = sqlx::query(
                "SELECT sender FROM transcript_messages ORDER BY id DESC LIMIT 1",
            )
            .fetch_optional(&mut *tx)
            .await
            .map_err(sql_err)?
            .map(|r| r.get("sender"));
            if observed.as_deref() != expected {
                return Err(TranscriptError::TurnViolation { sender, observed });
            }
        }

        let id: i64 = sqlx::query(
            r#"
            INSERT INTO transcript_messages (sender, content, timestamp, fingerprint, metadata)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&sender)
        .bind(&content)
        .bind(timestamp)
        .bind(&content_fingerprint)
        .bind(&metadata)
        .fetch_one(&mut *tx)
        .await
        .map_err(sql_err)?
        .get("id");

        bump_counter(&mut tx, meta::TOTAL_TURNS, 1)
            .await
            .map_err(sql_err)?;
        bump_counter(
            &mut tx,
            &format!("{}{}", meta::SENDER_TURNS_PREFIX, sender),
            1,
        )
        .await
        .map_err(sql_err)?;
        if tokens > 0 {
            bump_counter(&mut tx, meta::TOTAL_TOKENS, tokens as i64)
                .await
                .map_err(sql_err)?;
        }

        tx.commit().await.map_err(sql_err)?;

        tracing::info!(
            message_id = id,
            sender = %sender,
            length = content.len(),
            "message_appended"
        );

        Ok(Message {
            id,
            sender,
            content,
            timestamp,
            fingerprint: content_fingerprint,
            metadata,
        })
    }

    async fn context(&self, limit: usize) -> Result<Vec<Message>, TranscriptError> {
        let limit = limit.max(1);
        let rows = sqlx::query("SELECT * FROM transcript_messages ORDER BY id DESC LIMIT $1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(rows.iter().rev().map(row_to_message).collect())
    }

    async fn last_sender(&self) -> Result<Option<String>, TranscriptError> {
        let row = sqlx::query("SELECT sender FROM transcript_messages ORDER BY id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(row.map(|r| r.get::<String, _>("sender")))
    }

    async fn mark_terminated(&self, reason: &str) -> Result<(), TranscriptError> {
        let mut tx = self.pool.begin().await.map_err(sql_err)?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(ADVISORY_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(sql_err)?;

        let already: Option<String> =
            sqlx::query("SELECT value FROM transcript_metadata WHERE key = $1")
                .bind(meta::TERMINATED)
                .fetch_optional(&mut *tx)
                .await
                .map_err(sql_err)?
                .map(|r| r.get("value"));
        if already.as_deref() == Some("1") {
            return Ok(());
        }

        let now = Utc::now().to_rfc3339();
        let updates = [
            (meta::TERMINATED, "1".to_string()),
            (meta::TERMINATION_REASON, reason.to_string()),
            (meta::TERMINATION_TIMESTAMP, now.clone()),
            (meta::FINISHED_AT, now),
        ];
        for (key, value) in updates {
            sqlx::query(
                "INSERT INTO transcript_metadata (key, value) VALUES ($1, $2) \
                 ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(sql_err)?;
        }
        tx.commit().await.map_err(sql_err)?;

        tracing::info!(reason = %reason, "conversation_terminated");
        Ok(())
    }

    async fn terminated(&self) -> Result<bool, TranscriptError> {
        Ok(self.meta_value(meta::TERMINATED).await?.as_deref() == Some("1"))
    }

    async fn termination_reason(&self) -> Result<Option<String>, TranscriptError> {
        self.meta_value(meta::TERMINATION_REASON).await
    }

    async fn health(&self) -> HealthReport {
        let mut report = HealthReport::new();
        let backend = sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|_| ())
            .map_err(|err| err.to_string());
        report.record("backend", backend);
        report
    }

    async fn snapshot(&self) -> Result<TranscriptSnapshot, TranscriptError> {
        let rows = sqlx::query("SELECT * FROM transcript_messages ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(sql_err)?;
        let messages: Vec<Message> = rows.iter().map(row_to_message).collect();

        let meta_rows = sqlx::query("SELECT key, value FROM transcript_metadata")
            .fetch_all(&self.pool)
            .await
            .map_err(sql_err)?;
        let bag: BTreeMap<String, String> = meta_rows
            .iter()
            .map(|r| (r.get::<String, _>("key"), r.get::<String, _>("value")))
            .collect();

        Ok(TranscriptSnapshot {
            messages,
            metadata: metadata_from_bag(&bag),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Full round-trip against a live server; skipped unless
    /// COLLOQUY_TEST_POSTGRES_URL points at one.
    #[tokio::test]
    async fn live_round_trip_when_server_available() {
        let Ok(url) = std::env::var("COLLOQUY_TEST_POSTGRES_URL") else {
            eprintln!("COLLOQUY_TEST_POSTGRES_URL unset; skipping live postgres test");
            return;
        };

        let store = PostgresTranscriptStore::connect(&url, 100_000)
            .await
            .expect("connect");

        let msg = store
            .append("claude", "networked hello", serde_json::json!({ "tokens": 3 }))
            .await
            .expect("append");
        assert!(msg.id >= 1);
        assert_eq!(msg.sender, "Claude");

        let context = store.context(1).await.expect("context");
        assert_eq!(context.last().expect("latest").content, "networked hello");

        store.mark_terminated("max_turns_reached").await.expect("terminate");
        store.mark_terminated("timeout").await.expect("idempotent");
        assert_eq!(
            store.termination_reason().await.expect("reason").as_deref(),
            Some("max_turns_reached")
        );
    }
}
