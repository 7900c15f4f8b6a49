//! Transcript store backends.
//!
//! Two interchangeable implementations of
//! [`colloquy_core::transcript::TranscriptStore`]: an embedded
//! file-backed SQLite store (single process, exclusive writer via an
//! advisory lock file) and a networked Postgres store (multi-process,
//! the database serializes). The runner selects one at startup.

mod lock;
mod postgres;
mod sqlite;
mod validate;

use std::path::Path;
use std::sync::Arc;

use colloquy_core::error::TranscriptError;
use colloquy_core::transcript::TranscriptStore;

pub use lock::LockFile;
pub use postgres::PostgresTranscriptStore;
pub use sqlite::SqliteTranscriptStore;

/// Metadata-bag keys shared by both backends.
pub(crate) mod meta {
    pub const CREATED_AT: &str = "created_at";
    pub const FINISHED_AT: &str = "finished_at";
    pub const TOTAL_TURNS: &str = "total_turns";
    pub const TOTAL_TOKENS: &str = "total_tokens";
    pub const TERMINATED: &str = "terminated";
    pub const TERMINATION_REASON: &str = "termination_reason";
    pub const TERMINATION_TIMESTAMP: &str = "termination_timestamp";
    /// Per-sender turn counters live under `turns:<sender>`.
    pub const SENDER_TURNS_PREFIX: &str = "turns:";
}

/// Open the backend selected by `location`: a `postgres://` URL yields
/// the networked store, anything else is treated as a SQLite file path.
pub async fn open_store(
    location: &str,
    max_message_length: usize,
) -> Result<Arc<dyn TranscriptStore>, TranscriptError> {
    if location.starts_with("postgres://") || location.starts_with("postgresql://") {
        let store = PostgresTranscriptStore::connect(location, max_message_length).await?;
        Ok(Arc::new(store))
    } else {
        let store = SqliteTranscriptStore::open(Path::new(location), max_message_length).await?;
        Ok(Arc::new(store))
    }
}
