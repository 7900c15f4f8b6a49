//! File-backed SQLite transcript store.
//!
//! Single-process embedded backend: WAL-journaled SQLite with an
//! advisory lock file serializing every mutation. An append becomes
//! visible only after the message row and all derived counters commit
//! in one transaction.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use colloquy_core::error::TranscriptError;
use colloquy_core::message::Message;
use colloquy_core::sanitize::fingerprint;
use colloquy_core::transcript::{
    HealthReport, TranscriptMetadata, TranscriptSnapshot, TranscriptStore,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::lock::LockFile;
use crate::meta;
use crate::validate::{metadata_object, metadata_tokens, validate_message};

const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct SqliteTranscriptStore {
    pool: SqlitePool,
    lock: LockFile,
    max_message_length: usize,
}

impl SqliteTranscriptStore {
    /// Open (creating if missing) the store at `path`.
    pub async fn open(path: &Path, max_message_length: usize) -> Result<Self, TranscriptError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|err| TranscriptError::Unavailable(err.to_string()))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|err| TranscriptError::Unavailable(err.to_string()))?;

        let store = Self {
            pool,
            lock: LockFile::for_data_file(path),
            max_message_length,
        };
        store.migrate().await?;
        store.init_metadata().await?;

        tracing::info!(path = %path.display(), backend = "sqlite", "store_initialized");
        Ok(store)
    }

    /// In-memory store for tests and offline runs; the advisory lock
    /// lives in the system temp directory.
    pub async fn in_memory(max_message_length: usize) -> Result<Self, TranscriptError> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT: AtomicU64 = AtomicU64::new(0);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|err| TranscriptError::Unavailable(err.to_string()))?;

        let lock_data = std::env::temp_dir().join(format!(
            "colloquy_mem_{}_{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));

        let store = Self {
            pool,
            lock: LockFile::for_data_file(&lock_data),
            max_message_length,
        };
        store.migrate().await?;
        store.init_metadata().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), TranscriptError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sender TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender)")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

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
            sqlx::query("INSERT OR IGNORE INTO metadata (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(value)
                .execute(&self.pool)
                .await
                .map_err(store_err)?;
        }
        Ok(())
    }

    async fn meta_value(&self, key: &str) -> Result<Option<String>, TranscriptError> {
        let row = sqlx::query("SELECT value FROM metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }
}

/// Add `delta` to a TEXT-encoded integer counter, creating it at the
/// delta when absent.
async fn bump_counter(
    tx: &mut sqlx::SqliteConnection,
    key: &str,
    delta: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO metadata (key, value) VALUES (?1, CAST(?2 AS TEXT))
        ON CONFLICT(key) DO UPDATE
            SET value = CAST(CAST(metadata.value AS INTEGER) + ?2 AS TEXT)
        "#,
    )
    .bind(key)
    .bind(delta)
    .execute(tx)
    .await?;
    Ok(())
}

async fn last_sender_tx(
    tx: &mut sqlx::SqliteConnection,
) -> Result<Option<String>, sqlx::Error> {
    let row = sqlx::query("SELECT sender FROM messages ORDER BY id DESC LIMIT 1")
        .fetch_optional(tx)
        .await?;
    Ok(row.map(|r| r.get::<String, _>("sender")))
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Message {
    let id: i64 = row.get("id");
    let raw_meta: String = row.get("metadata");
    let metadata = match serde_json::from_str(&raw_meta) {
        Ok(value @ serde_json::Value::Object(_)) => value,
        Ok(_) | Err(_) => {
            tracing::warn!(message_id = id, "message_metadata_corrupt");
            serde_json::json!({})
        }
    };

    let raw_ts: String = row.get("timestamp");
    let timestamp = DateTime::parse_from_rfc3339(&raw_ts)
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            tracing::warn!(message_id = id, "message_timestamp_corrupt");
            DateTime::<Utc>::UNIX_EPOCH
        });

    Message {
        id,
        sender: row.get("sender"),
        content: row.get("content"),
        timestamp,
        fingerprint: row.get("fingerprint"),
        metadata,
    }
}

fn store_err(err: sqlx::Error) -> TranscriptError {
    match &err {
        sqlx::Error::PoolClosed | sqlx::Error::Configuration(_) => {
            TranscriptError::Unavailable(err.to_string())
        }
        _ => TranscriptError::Transient(err.to_string()),
    }
}

#[async_trait::async_trait]
impl TranscriptStore for SqliteTranscriptStore {
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

        let _guard = self.lock.acquire(LOCK_TIMEOUT).await?;
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        if let Some(expected) = expect_last_sender {
            let observed = last_sender_tx(&mut tx).await.map_err(store_err)?;
            if observed.as_deref() != expected {
                return Err(TranscriptError::TurnViolation { sender, observed });
            }
        }

        let result = sqlx::query(
            r#"
            INSERT INTO messages (sender, content, timestamp, fingerprint, metadata)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&sender)
        .bind(&content)
        .bind(timestamp.to_rfc3339())
        .bind(&content_fingerprint)
        .bind(metadata.to_string())
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;
        let id = result.last_insert_rowid();

        bump_counter(&mut tx, meta::TOTAL_TURNS, 1)
            .await
            .map_err(store_err)?;
        bump_counter(
            &mut tx,
            &format!("{}{}", meta::SENDER_TURNS_PREFIX, sender),
            1,
        )
        .await
        .map_err(store_err)?;
        if tokens > 0 {
            bump_counter(&mut tx, meta::TOTAL_TOKENS, tokens as i64)
                .await
                .map_err(store_err)?;
        }

        tx.commit().await.map_err(store_err)?;

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
        let rows = sqlx::query("SELECT * FROM messages ORDER BY id DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;

        Ok(rows.iter().rev().map(row_to_message).collect())
    }

    async fn last_sender(&self) -> Result<Option<String>, TranscriptError> {
        let row = sqlx::query("SELECT sender FROM messages ORDER BY id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(row.map(|r| r.get::<String, _>("sender")))
    }

    async fn mark_terminated(&self, reason: &str) -> Result<(), TranscriptError> {
        let _guard = self.lock.acquire(LOCK_TIMEOUT).await?;
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let already: Option<String> =
            sqlx::query("SELECT value FROM metadata WHERE key = ?")
                .bind(meta::TERMINATED)
                .fetch_optional(&mut *tx)
                .await
                .map_err(store_err)?
                .map(|r| r.get("value"));
        if already.as_deref() == Some("1") {
            // First reason wins.
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
                "INSERT INTO metadata (key, value) VALUES (?, ?) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }
        tx.commit().await.map_err(store_err)?;

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

        report.record("lock", self.lock.probe().await);
        report
    }

    async fn snapshot(&self) -> Result<TranscriptSnapshot, TranscriptError> {
        let rows = sqlx::query("SELECT * FROM messages ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        let messages: Vec<Message> = rows.iter().map(row_to_message).collect();

        let meta_rows = sqlx::query("SELECT key, value FROM metadata")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
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

pub(crate) fn metadata_from_bag(bag: &BTreeMap<String, String>) -> TranscriptMetadata {
    let parse_ts = |key: &str| {
        bag.get(key)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|ts| ts.with_timezone(&Utc))
    };
    let parse_int = |key: &str| {
        bag.get(key)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
    };

    let per_sender_turns = bag
        .iter()
        .filter_map(|(key, value)| {
            let sender = key.strip_prefix(meta::SENDER_TURNS_PREFIX)?;
            Some((sender.to_string(), value.parse().ok()?))
        })
        .collect();

    TranscriptMetadata {
        created_at: parse_ts(meta::CREATED_AT),
        finished_at: parse_ts(meta::FINISHED_AT),
        total_turns: parse_int(meta::TOTAL_TURNS),
        per_sender_turns,
        total_tokens: parse_int(meta::TOTAL_TOKENS),
        terminated: bag.get(meta::TERMINATED).map(String::as_str) == Some("1"),
        termination_reason: bag.get(meta::TERMINATION_REASON).cloned(),
        termination_timestamp: parse_ts(meta::TERMINATION_TIMESTAMP),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn store() -> SqliteTranscriptStore {
        SqliteTranscriptStore::in_memory(100_000)
            .await
            .expect("in-memory store")
    }

    #[tokio::test]
    async fn append_assigns_increasing_ids_and_updates_counters() {
        let store = store().await;

        let first = store
            .append("claude", "hello there", serde_json::json!({ "tokens": 10 }))
            .await
            .expect("first append");
        let second = store
            .append("chatgpt", "hi back", serde_json::json!({ "tokens": 5 }))
            .await
            .expect("second append");
        assert!(second.id > first.id);

        let snapshot = store.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.metadata.total_turns, 2);
        assert_eq!(snapshot.metadata.total_tokens, 15);
        assert_eq!(snapshot.metadata.per_sender_turns.get("Claude"), Some(&1));
        assert_eq!(snapshot.metadata.per_sender_turns.get("ChatGPT"), Some(&1));
        assert_eq!(snapshot.metadata.total_turns, snapshot.messages.len() as u64);
        assert!(snapshot.metadata.created_at.is_some());
    }

    #[tokio::test]
    async fn context_returns_most_recent_oldest_first() {
        let store = store().await;
        for i in 1..=5 {
            let sender = if i % 2 == 0 { "chatgpt" } else { "claude" };
            store
                .append(sender, &format!("message number {i}"), serde_json::json!({}))
                .await
                .expect("append");
        }

        let last_two = store.context(2).await.expect("context");
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].content, "message number 4");
        assert_eq!(last_two[1].content, "message number 5");

        let only_latest = store.context(1).await.expect("context");
        assert_eq!(only_latest.len(), 1);
        assert_eq!(only_latest[0].content, "message number 5");
    }

    #[tokio::test]
    async fn last_sender_tracks_latest_append() {
        let store = store().await;
        assert_eq!(store.last_sender().await.expect("empty"), None);

        store
            .append("claude", "first", serde_json::json!({}))
            .await
            .expect("append");
        assert_eq!(store.last_sender().await.expect("one").as_deref(), Some("Claude"));

        store
            .append("chatgpt", "second", serde_json::json!({}))
            .await
            .expect("append");
        assert_eq!(
            store.last_sender().await.expect("two").as_deref(),
            Some("ChatGPT")
        );
    }

    #[tokio::test]
    async fn rejects_invalid_input() {
        let store = store().await;
        assert!(matches!(
            store.append("claude", "", serde_json::json!({})).await,
            Err(TranscriptError::InvalidInput(_))
        ));
        assert!(matches!(
            store.append("", "hello", serde_json::json!({})).await,
            Err(TranscriptError::InvalidInput(_))
        ));

        let store = SqliteTranscriptStore::in_memory(10).await.expect("store");
        assert!(store.append("claude", "exactly10c", serde_json::json!({})).await.is_ok());
        assert!(matches!(
            store.append("claude", "elevenchars", serde_json::json!({})).await,
            Err(TranscriptError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn termination_is_sticky_and_first_reason_wins() {
        let store = store().await;
        assert!(!store.terminated().await.expect("fresh"));

        store.mark_terminated("max_turns_reached").await.expect("first");
        store.mark_terminated("timeout").await.expect("second");

        assert!(store.terminated().await.expect("terminated"));
        assert_eq!(
            store.termination_reason().await.expect("reason").as_deref(),
            Some("max_turns_reached")
        );

        let snapshot = store.snapshot().await.expect("snapshot");
        assert!(snapshot.metadata.termination_timestamp.is_some());
        assert!(snapshot.metadata.finished_at.is_some());
    }

    #[tokio::test]
    async fn guarded_append_rejects_stale_expectation() {
        let store = store().await;

        // Empty transcript: expecting empty succeeds.
        store
            .append_guarded("claude", "opening", serde_json::json!({}), Some(None))
            .await
            .expect("guarded opener");

        // A second writer that still believes the transcript is empty loses.
        let err = store
            .append_guarded("chatgpt", "also opening", serde_json::json!({}), Some(None))
            .await
            .expect_err("stale expectation");
        match err {
            TranscriptError::TurnViolation { observed, .. } => {
                assert_eq!(observed.as_deref(), Some("Claude"));
            }
            other => panic!("expected TurnViolation, got {other:?}"),
        }

        // Retrying with the observed sender succeeds.
        store
            .append_guarded(
                "chatgpt",
                "now my turn",
                serde_json::json!({}),
                Some(Some("Claude")),
            )
            .await
            .expect("guarded reply");
    }

    #[tokio::test]
    async fn corrupt_metadata_rows_are_tolerated_on_read() {
        let store = store().await;
        store
            .append("claude", "good row", serde_json::json!({ "tokens": 3 }))
            .await
            .expect("append");

        sqlx::query(
            "INSERT INTO messages (sender, content, timestamp, fingerprint, metadata) \
             VALUES ('Gremlin', 'bad row', 'not-a-timestamp', 'feedbeeffeedbeef', '{not json')",
        )
        .execute(&store.pool)
        .await
        .expect("raw insert");

        let context = store.context(10).await.expect("context tolerates corruption");
        assert_eq!(context.len(), 2);
        let bad = &context[1];
        assert_eq!(bad.sender, "Gremlin");
        assert_eq!(bad.content, "bad row");
        assert_eq!(bad.metadata, serde_json::json!({}));
    }

    #[tokio::test]
    async fn health_reports_backend_and_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteTranscriptStore::open(&dir.path().join("conv.db"), 100_000)
            .await
            .expect("open");

        let report = store.health().await;
        assert!(report.healthy);
        assert_eq!(report.checks.get("backend").map(String::as_str), Some("ok"));
        assert_eq!(report.checks.get("lock").map(String::as_str), Some("ok"));
    }

    #[tokio::test]
    async fn concurrent_appends_serialize_into_a_total_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(
            SqliteTranscriptStore::open(&dir.path().join("conv.db"), 100_000)
                .await
                .expect("open"),
        );

        let a = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .append("claude", "claude claims the floor", serde_json::json!({}))
                    .await
            })
        };
        let b = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .append("chatgpt", "chatgpt claims the floor", serde_json::json!({}))
                    .await
            })
        };
        let first = a.await.expect("join").expect("append a");
        let second = b.await.expect("join").expect("append b");

        let mut ids = [first.id, second.id];
        ids.sort_unstable();
        assert_eq!(ids, [1, 2]);

        let winner = if first.id == 2 { &first } else { &second };
        assert_eq!(
            store.last_sender().await.expect("last").as_deref(),
            Some(winner.sender.as_str())
        );
    }

    #[tokio::test]
    async fn reopening_preserves_messages_and_metadata() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("conv.db");

        {
            let store = SqliteTranscriptStore::open(&path, 100_000).await.expect("open");
            store
                .append("claude", "persist me", serde_json::json!({ "tokens": 4 }))
                .await
                .expect("append");
            store.mark_terminated("max_turns_reached").await.expect("terminate");
        }

        let store = SqliteTranscriptStore::open(&path, 100_000).await.expect("reopen");
        let snapshot = store.snapshot().await.expect("snapshot");
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].content, "persist me");
        assert!(snapshot.metadata.terminated);
        assert_eq!(
            snapshot.metadata.termination_reason.as_deref(),
            Some("max_turns_reached")
        );
    }
}
