//! Crate-wide error type and `Result` alias.

use std::io;

use rusqlite::ffi;
use thiserror::Error;
use tracing::error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GraphError>;

/// Every failure the graph layer can surface.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A value violates its declared type/enum, or a required property is null.
    #[error("validation failed for {entity} '{id}'{}: {message}", key_suffix(.key))]
    Validation {
        /// Concrete type name (node label or edge type name).
        entity: String,
        /// Entity identity, rendered as text.
        id: String,
        /// Offending property key, when one applies.
        key: Option<String>,
        /// Human readable description of the violation.
        message: String,
    },
    /// A single-result lookup matched the wrong number of rows.
    #[error("expected {expected} {entity} row(s) for {id}, found {actual}")]
    Lookup {
        /// Concrete type name, or `node`/`edge` for polymorphic lookups.
        entity: String,
        /// Identity or query description.
        id: String,
        /// Number of rows the caller required.
        expected: usize,
        /// Number of rows actually found.
        actual: usize,
    },
    /// A racing transaction inserted the same identity first. Retryable.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    /// The store rejected a write because an edge endpoint does not exist.
    #[error("foreign key constraint violated: {0}")]
    ForeignKey(String),
    /// An edge references an endpoint that is not present.
    #[error("edge {edge_type} ({src_id} -> {dst_id}) references missing {side} node '{missing}'")]
    MissingEndpoint {
        /// Edge type name.
        edge_type: String,
        /// Source node id.
        src_id: String,
        /// Destination node id.
        dst_id: String,
        /// `source` or `destination`.
        side: &'static str,
        /// Id that could not be found.
        missing: String,
    },
    /// No declared type matches the label.
    #[error("unknown {kind} type '{label}'")]
    UnknownType {
        /// `node` or `edge`.
        kind: &'static str,
        /// Label that failed to resolve.
        label: String,
    },
    /// Several declared edge types match and the caller did not disambiguate.
    #[error("edge label '{label}' is ambiguous between {candidates:?}")]
    AmbiguousEdge {
        /// Label (or endpoint pair) that matched more than one edge type.
        label: String,
        /// Names of every matching edge type.
        candidates: Vec<String>,
    },
    /// The retry budget for unique-constraint races ran out.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made, including the first.
        attempts: u32,
        /// Error raised by the final attempt.
        #[source]
        last: Box<GraphError>,
    },
    /// Dictionary or schema definition problem.
    #[error("invalid schema: {0}")]
    Schema(String),
    /// Caller supplied an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Session used after commit/rollback.
    #[error("session is no longer active")]
    Inactive,
    /// Other SQL failure.
    #[error("sql error: {0}")]
    Sql(rusqlite::Error),
    /// JSON encode/decode failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Stored timestamp could not be parsed or formatted.
    #[error("timestamp error: {0}")]
    Timestamp(String),
    /// Configuration file could not be parsed.
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn key_suffix(key: &Option<String>) -> String {
    match key {
        Some(key) => format!(" (key '{key}')"),
        None => String::new(),
    }
}

impl GraphError {
    /// Returns `true` for the one failure class sessions retry automatically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GraphError::UniqueViolation(_))
    }

    pub(crate) fn validation(
        entity: impl Into<String>,
        id: impl Into<String>,
        key: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        GraphError::Validation {
            entity: entity.into(),
            id: id.into(),
            key: key.map(str::to_owned),
            message: message.into(),
        }
    }

    pub(crate) fn lookup(
        entity: impl Into<String>,
        id: impl Into<String>,
        expected: usize,
        actual: usize,
    ) -> Self {
        GraphError::Lookup {
            entity: entity.into(),
            id: id.into(),
            expected,
            actual,
        }
    }
}

impl From<rusqlite::Error> for GraphError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(code, message) = &err {
            let detail = message.clone().unwrap_or_else(|| code.to_string());
            match code.extended_code {
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                    return GraphError::UniqueViolation(detail);
                }
                ffi::SQLITE_CONSTRAINT_FOREIGNKEY => return GraphError::ForeignKey(detail),
                ffi::SQLITE_CORRUPT | ffi::SQLITE_NOTADB => {
                    error!(%detail, "database file is corrupt");
                }
                _ => {}
            }
        }
        GraphError::Sql(err)
    }
}

impl From<time::error::Parse> for GraphError {
    fn from(err: time::error::Parse) -> Self {
        GraphError::Timestamp(err.to_string())
    }
}

impl From<time::error::Format> for GraphError {
    fn from(err: time::error::Format) -> Self {
        GraphError::Timestamp(err.to_string())
    }
}
