//! SQLite binding: table layout, row codecs, query compilation and the
//! [`Graph`] handle that owns the connection pool.

mod ddl;
mod query;
pub(crate) mod rows;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{debug, info};

use crate::config::GraphConfig;
use crate::error::Result;
use crate::schema::Schema;

pub use query::{EdgeQuery, NodeQuery};

pub(crate) use query::SqlFilter;

const MAX_IDLE_CONNECTIONS: usize = 8;

/// A graph stored in one SQLite database file.
///
/// `Graph` is `Sync`: threads share one handle and each opens its own
/// [`Session`](crate::Session), which checks a connection out of the
/// handle's idle pool for its lifetime.
pub struct Graph {
    path: PathBuf,
    schema: Arc<Schema>,
    config: GraphConfig,
    idle: Mutex<Vec<Connection>>,
    next_session: AtomicU64,
}

impl Graph {
    /// Opens (creating when needed) the graph at `path` with default
    /// settings.
    pub fn open(path: impl AsRef<Path>, schema: Arc<Schema>) -> Result<Self> {
        Self::open_with_config(path, schema, GraphConfig::default())
    }

    /// Opens the graph at `path`, creating any missing tables.
    pub fn open_with_config(
        path: impl AsRef<Path>,
        schema: Arc<Schema>,
        config: GraphConfig,
    ) -> Result<Self> {
        let graph = Self {
            path: path.as_ref().to_path_buf(),
            schema,
            config,
            idle: Mutex::new(Vec::new()),
            next_session: AtomicU64::new(1),
        };
        let conn = graph.connect()?;
        ddl::create_all(&conn, &graph.schema, graph.config.index_properties)?;
        graph.checkin(conn);
        info!(
            path = %graph.path.display(),
            node_types = graph.schema.node_types().count(),
            edge_types = graph.schema.edge_types().count(),
            "graph opened"
        );
        Ok(graph)
    }

    /// Registry the graph was opened with.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Active settings.
    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_millis(self.config.busy_timeout_ms))?;
        conn.pragma_update_and_check(
            None,
            "journal_mode",
            self.config.journal_mode.as_pragma(),
            |row| row.get::<_, String>(0),
        )?;
        conn.pragma_update(None, "synchronous", self.config.synchronous.as_pragma())?;
        conn.pragma_update(None, "foreign_keys", true)?;
        debug!(path = %self.path.display(), "connection opened");
        Ok(conn)
    }

    pub(crate) fn checkout(&self) -> Result<Connection> {
        if let Some(conn) = self.idle.lock().pop() {
            return Ok(conn);
        }
        self.connect()
    }

    pub(crate) fn checkin(&self, conn: Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(conn);
        }
    }

    pub(crate) fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("path", &self.path)
            .field("config", &self.config)
            .field("idle_connections", &self.idle.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::NodeTypeDef;

    #[test]
    fn connections_are_pooled() {
        let dir = tempfile::tempdir().unwrap();
        let schema = Schema::builder()
            .node(NodeTypeDef::new("file"))
            .build()
            .unwrap();
        let graph = Graph::open(dir.path().join("g.db"), schema).unwrap();
        let a = graph.checkout().unwrap();
        let b = graph.checkout().unwrap();
        graph.checkin(a);
        graph.checkin(b);
        assert_eq!(graph.idle.lock().len(), 2);

        let fk: i64 = graph
            .checkout()
            .unwrap()
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn reopening_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.db");
        let schema = Schema::builder()
            .node(NodeTypeDef::new("file"))
            .build()
            .unwrap();
        Graph::open(&path, schema.clone()).unwrap();
        let graph = Graph::open(&path, schema).unwrap();
        assert_eq!(graph.path(), path.as_path());
    }
}
