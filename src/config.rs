//! Connection, transaction and copy tuning.
//!
//! Every field has a default, so a TOML file only needs to name what it
//! changes:
//!
//! ```toml
//! synchronous = "normal"
//! busy_timeout_ms = 10000
//!
//! [retry]
//! max_retries = 8
//!
//! [copy]
//! chunk_size = 500
//! strategy = "server"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::copy::CopyOptions;
use crate::error::Result;

/// SQLite `synchronous` pragma.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// No fsync; fastest, unsafe on power loss.
    Off,
    /// fsync at checkpoints only (safe with WAL).
    Normal,
    /// fsync every commit.
    #[default]
    Full,
    /// `full` plus directory syncs.
    Extra,
}

impl SyncMode {
    pub(crate) fn as_pragma(self) -> &'static str {
        match self {
            SyncMode::Off => "OFF",
            SyncMode::Normal => "NORMAL",
            SyncMode::Full => "FULL",
            SyncMode::Extra => "EXTRA",
        }
    }
}

/// SQLite `journal_mode` pragma.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    /// Write-ahead log; readers do not block the writer.
    #[default]
    Wal,
    /// Rollback journal, deleted after each transaction.
    Delete,
    /// Rollback journal, truncated after each transaction.
    Truncate,
}

impl JournalMode {
    pub(crate) fn as_pragma(self) -> &'static str {
        match self {
            JournalMode::Wal => "WAL",
            JournalMode::Delete => "DELETE",
            JournalMode::Truncate => "TRUNCATE",
        }
    }
}

/// Locking mode used by `BEGIN` for write sessions.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxBehavior {
    /// Take locks lazily on first read/write.
    Deferred,
    /// Take the write lock at `BEGIN`.
    #[default]
    Immediate,
    /// Take an exclusive lock at `BEGIN`.
    Exclusive,
}

impl TxBehavior {
    pub(crate) fn begin_sql(self) -> &'static str {
        match self {
            TxBehavior::Deferred => "BEGIN DEFERRED",
            TxBehavior::Immediate => "BEGIN IMMEDIATE",
            TxBehavior::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

/// Retry budget for unique-constraint races in [`crate::Graph::transact`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Upper bound of the first backoff sleep; later sleeps shrink.
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 50,
        }
    }
}

/// Graph-wide settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct GraphConfig {
    /// `PRAGMA synchronous`.
    pub synchronous: SyncMode,
    /// `PRAGMA journal_mode`.
    pub journal_mode: JournalMode,
    /// How long a connection waits on a locked database.
    pub busy_timeout_ms: u64,
    /// `BEGIN` flavor for write sessions.
    pub tx_behavior: TxBehavior,
    /// Take each flush's timestamp from the database clock instead of the
    /// local one.
    pub db_clock: bool,
    /// Create an expression index per declared property.
    pub index_properties: bool,
    /// Unique-violation retry budget.
    pub retry: RetryPolicy,
    /// Defaults for bulk copies started from this graph.
    pub copy: CopyOptions,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            synchronous: SyncMode::Full,
            journal_mode: JournalMode::Wal,
            busy_timeout_ms: 5_000,
            tx_behavior: TxBehavior::Immediate,
            db_clock: true,
            index_properties: false,
            retry: RetryPolicy::default(),
            copy: CopyOptions::default(),
        }
    }
}

impl GraphConfig {
    /// WAL with `synchronous = NORMAL`, property indexes and a longer busy
    /// timeout for multi-writer deployments.
    pub fn production() -> Self {
        Self {
            synchronous: SyncMode::Normal,
            busy_timeout_ms: 30_000,
            index_properties: true,
            retry: RetryPolicy {
                max_retries: 10,
                base_delay_ms: 100,
            },
            ..Self::default()
        }
    }

    /// Every commit reaches disk before returning.
    pub fn fully_durable() -> Self {
        Self {
            synchronous: SyncMode::Extra,
            tx_behavior: TxBehavior::Exclusive,
            ..Self::default()
        }
    }

    /// Durability off, large copy chunks, local clock.
    pub fn benchmark() -> Self {
        Self {
            synchronous: SyncMode::Off,
            db_clock: false,
            copy: CopyOptions {
                chunk_size: 5_000,
                ..CopyOptions::default()
            },
            ..Self::default()
        }
    }

    /// Parses a TOML document; absent keys keep their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }
}
