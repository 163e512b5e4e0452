//! Sessions: one SQLite transaction, its queued writes and its reads.

mod flush;
mod scope;

use std::time::Instant;

use rusqlite::{params_from_iter, Connection};
use tracing::{debug, info, warn};

use crate::config::TxBehavior;
use crate::error::{GraphError, Result};
use crate::model::{Edge, Node, VoidedEdge, VoidedNode};
use crate::schema::{EdgeSide, EdgeType, NodeType};
use crate::store::rows::{self, column_list, EdgeRecord, NodeRecord, EDGE_COLUMNS, NODE_COLUMNS};
use crate::store::{EdgeQuery, Graph, NodeQuery, SqlFilter};
use crate::traversal::{Dir, Subgraph};

use flush::{flush_timestamp, Flush, Pending, WriteOp};

pub use flush::FlushStats;
pub use scope::ScopeOptions;

/// The state of a session's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Open; accepts reads and writes.
    Active,
    /// Committed; the connection went back to the pool.
    Committed,
    /// Rolled back; the connection went back to the pool.
    RolledBack,
}

/// One transaction against a [`Graph`].
///
/// Writes are queued and reach the database at the next flush, which
/// happens before every read and at commit. Each flush snapshots the
/// prior state of every updated or deleted entity into history.
///
/// ```no_run
/// use relgraph::{Graph, Node, Schema, NodeTypeDef, PropertyDef};
///
/// let schema = Schema::builder()
///     .node(NodeTypeDef::new("file").property(PropertyDef::string("name")))
///     .build()?;
/// let graph = Graph::open("graph.db", schema)?;
/// let mut session = graph.session()?;
/// let mut file = Node::new(graph.schema(), "file", "f1")?;
/// file.set("name", "x.txt")?;
/// session.add_node(file)?;
/// session.commit()?;
/// # Ok::<(), relgraph::GraphError>(())
/// ```
///
/// A session dropped while active is rolled back.
pub struct Session<'g> {
    graph: &'g Graph,
    conn: Option<Connection>,
    id: u64,
    state: TxState,
    read_only: bool,
    pending: Vec<Pending>,
    stats: FlushStats,
}

impl Graph {
    /// Opens a write session using the configured `BEGIN` behavior.
    pub fn session(&self) -> Result<Session<'_>> {
        Session::begin(self, self.config().tx_behavior, false)
    }

    /// Opens a read-only session on a consistent snapshot.
    pub fn read_session(&self) -> Result<Session<'_>> {
        Session::begin(self, TxBehavior::Deferred, true)
    }

    pub(crate) fn session_with(&self, behavior: TxBehavior) -> Result<Session<'_>> {
        Session::begin(self, behavior, false)
    }
}

impl<'g> Session<'g> {
    fn begin(graph: &'g Graph, behavior: TxBehavior, read_only: bool) -> Result<Self> {
        let conn = graph.checkout()?;
        if let Err(err) = conn.execute_batch(behavior.begin_sql()) {
            graph.checkin(conn);
            return Err(err.into());
        }
        let id = graph.next_session_id();
        debug!(session_id = id, read_only, begin = behavior.begin_sql(), "session started");
        Ok(Self {
            graph,
            conn: Some(conn),
            id,
            state: TxState::Active,
            read_only,
            pending: Vec::new(),
            stats: FlushStats::default(),
        })
    }

    /// Session identifier used in log events.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current transaction state.
    pub fn state(&self) -> TxState {
        self.state
    }

    /// `true` for sessions opened with [`Graph::read_session`].
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Graph the session belongs to.
    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    /// Totals over every flush so far.
    pub fn stats(&self) -> FlushStats {
        self.stats
    }

    /// Writes queued since the last flush.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state != TxState::Active {
            return Err(GraphError::Inactive);
        }
        Ok(())
    }

    pub(crate) fn connection(&self) -> Result<&Connection> {
        self.ensure_active()?;
        self.conn.as_ref().ok_or(GraphError::Inactive)
    }

    fn queue(&mut self, write: Pending) -> Result<()> {
        self.ensure_active()?;
        if self.read_only {
            return Err(GraphError::InvalidArgument(format!(
                "session {} is read-only",
                self.id
            )));
        }
        self.pending.push(write);
        Ok(())
    }

    // -- writes -----------------------------------------------------------

    /// Queues a new node. Flushing fails with a unique violation if a
    /// node with the same id already exists.
    pub fn add_node(&mut self, node: Node) -> Result<()> {
        self.queue(Pending::Node(WriteOp::Insert, node))
    }

    /// Queues an update of a stored node, or an insert when none exists.
    pub fn merge_node(&mut self, node: Node) -> Result<()> {
        self.queue(Pending::Node(WriteOp::Merge, node))
    }

    /// Queues the removal of a node and of every edge touching it.
    pub fn delete_node(&mut self, node: Node) -> Result<()> {
        self.queue(Pending::Node(WriteOp::Delete, node))
    }

    /// Queues a new edge. Both endpoints must exist when it is flushed.
    pub fn add_edge(&mut self, edge: Edge) -> Result<()> {
        self.queue(Pending::Edge(WriteOp::Insert, edge))
    }

    /// Queues an update of a stored edge, or an insert when none exists.
    pub fn merge_edge(&mut self, edge: Edge) -> Result<()> {
        self.queue(Pending::Edge(WriteOp::Merge, edge))
    }

    /// Queues the removal of an edge.
    pub fn delete_edge(&mut self, edge: Edge) -> Result<()> {
        self.queue(Pending::Edge(WriteOp::Delete, edge))
    }

    /// Writes every queued change. A failing flush leaves the transaction
    /// as it was before the flush started; the queued writes are dropped.
    pub fn flush(&mut self) -> Result<FlushStats> {
        self.ensure_active()?;
        if self.pending.is_empty() {
            return Ok(FlushStats::default());
        }
        let pending = std::mem::take(&mut self.pending);
        let conn = self.conn.as_ref().ok_or(GraphError::Inactive)?;
        let stamp = flush_timestamp(conn, self.graph.config().db_clock)?;
        conn.execute_batch("SAVEPOINT relgraph_flush")?;
        match Flush::new(conn, self.graph.schema(), self.id, stamp).run(pending) {
            Ok(stats) => {
                conn.execute_batch("RELEASE relgraph_flush")?;
                self.stats.absorb(stats);
                Ok(stats)
            }
            Err(err) => {
                if let Err(undo) =
                    conn.execute_batch("ROLLBACK TO relgraph_flush; RELEASE relgraph_flush")
                {
                    warn!(session_id = self.id, error = %undo, "flush savepoint rollback failed");
                }
                debug!(session_id = self.id, error = %err, "flush failed");
                Err(err)
            }
        }
    }

    /// Flushes and commits. On failure the transaction is rolled back
    /// before the error is returned.
    pub fn commit(mut self) -> Result<()> {
        self.ensure_active()?;
        let start = Instant::now();
        match self.flush_and_commit() {
            Ok(()) => {
                self.state = TxState::Committed;
                self.release();
                info!(
                    session_id = self.id,
                    inserted = self.stats.inserted,
                    updated = self.stats.updated,
                    deleted = self.stats.deleted,
                    snapshots = self.stats.snapshots,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "session committed"
                );
                Ok(())
            }
            Err(err) => {
                self.abort();
                Err(err)
            }
        }
    }

    fn flush_and_commit(&mut self) -> Result<()> {
        self.flush()?;
        self.connection()?.execute_batch("COMMIT")?;
        Ok(())
    }

    /// Discards the transaction and every queued write.
    pub fn rollback(mut self) -> Result<()> {
        self.ensure_active()?;
        let result = match &self.conn {
            Some(conn) => conn.execute_batch("ROLLBACK").map_err(GraphError::from),
            None => Ok(()),
        };
        self.pending.clear();
        self.state = TxState::RolledBack;
        self.release();
        warn!(session_id = self.id, "session rolled back");
        result
    }

    fn abort(&mut self) {
        if let Some(conn) = &self.conn {
            if let Err(err) = conn.execute_batch("ROLLBACK") {
                warn!(session_id = self.id, error = %err, "rollback failed");
            }
        }
        self.pending.clear();
        self.state = TxState::RolledBack;
        self.release();
        if self.read_only {
            debug!(session_id = self.id, "read session closed");
        } else {
            warn!(session_id = self.id, "session rolled back");
        }
    }

    fn release(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.graph.checkin(conn);
        }
    }

    // -- reads ------------------------------------------------------------

    /// Node of `label` with `node_id`, if stored.
    pub fn node(&mut self, label: &str, node_id: &str) -> Result<Option<Node>> {
        self.flush()?;
        let ty = self.graph.schema().resolve_node(label)?;
        rows::fetch_node(self.connection()?, &ty, node_id)?
            .map(|record| record.into_node(ty))
            .transpose()
    }

    /// Node with `node_id` under whichever label stores it.
    pub fn find_node(&mut self, node_id: &str) -> Result<Option<Node>> {
        self.flush()?;
        let conn = self.connection()?;
        let mut found = Vec::new();
        for ty in self.graph.schema().node_types() {
            if let Some(record) = rows::fetch_node(conn, ty, node_id)? {
                found.push(record.into_node(ty.clone())?);
            }
        }
        if found.len() > 1 {
            return Err(GraphError::lookup("node", node_id, 1, found.len()));
        }
        Ok(found.pop())
    }

    /// Nodes matching `query`, ordered by label then id.
    pub fn nodes(&mut self, query: &NodeQuery) -> Result<Vec<Node>> {
        self.flush()?;
        let mut out = Vec::new();
        for ty in query.node_types(self.graph.schema())? {
            let remaining = match query.row_limit() {
                Some(limit) if out.len() >= limit => break,
                Some(limit) => Some(limit - out.len()),
                None => None,
            };
            for record in self.select_nodes(&ty, query, remaining)? {
                out.push(record.into_node(ty.clone())?);
            }
        }
        Ok(out)
    }

    /// The single node matching `query`; a lookup error for zero or
    /// several matches.
    pub fn one_node(&mut self, query: &NodeQuery) -> Result<Node> {
        let found = self.nodes(&query.clone().limit(2))?;
        match <[Node; 1]>::try_from(found) {
            Ok([node]) => Ok(node),
            Err(found) => {
                let entity = query.label().unwrap_or("node");
                Err(GraphError::lookup(entity, query.describe(), 1, found.len()))
            }
        }
    }

    /// Number of nodes matching `query`; a row limit is ignored.
    pub fn count_nodes(&mut self, query: &NodeQuery) -> Result<usize> {
        self.flush()?;
        let mut total = 0;
        for ty in query.node_types(self.graph.schema())? {
            if let Some(filter) = query.compile(&ty, None)? {
                total += self.count(ty.table(), &filter)?;
            }
        }
        Ok(total)
    }

    /// Edges matching `query`, ordered by type then `(src_id, dst_id)`.
    pub fn edges(&mut self, query: &EdgeQuery) -> Result<Vec<Edge>> {
        self.flush()?;
        let mut out = Vec::new();
        for ty in query.edge_types(self.graph.schema())? {
            let remaining = match query.row_limit() {
                Some(limit) if out.len() >= limit => break,
                Some(limit) => Some(limit - out.len()),
                None => None,
            };
            for record in self.select_edges(&ty, query, remaining)? {
                out.push(record.into_edge(ty.clone())?);
            }
        }
        Ok(out)
    }

    /// Number of edges matching `query`; a row limit is ignored.
    pub fn count_edges(&mut self, query: &EdgeQuery) -> Result<usize> {
        self.flush()?;
        let mut total = 0;
        for ty in query.edge_types(self.graph.schema())? {
            if let Some(filter) = query.compile(&ty)? {
                total += self.count(ty.table(), &filter)?;
            }
        }
        Ok(total)
    }

    /// Nodes reached from `node` through the association named `assoc`.
    pub fn related(&mut self, node: &Node, assoc: &str) -> Result<Vec<Node>> {
        self.flush()?;
        let schema = self.graph.schema();
        let assoc = schema.association(node.label(), assoc)?;
        let target = schema.resolve_node(assoc.target_label())?;
        let (near, far) = match assoc.side {
            EdgeSide::Source => ("src_id", "dst_id"),
            EdgeSide::Destination => ("dst_id", "src_id"),
        };
        let sql = format!(
            "SELECT {} FROM {} AS n JOIN {} AS e ON n.node_id = e.{far} \
             WHERE e.{near} = ?1 ORDER BY n.node_id",
            column_list(NODE_COLUMNS, Some("n")),
            target.table(),
            assoc.edge_type.table()
        );
        let conn = self.connection()?;
        let mut stmt = conn.prepare_cached(&sql)?;
        let records = stmt
            .query_map([node.node_id()], NodeRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        records
            .into_iter()
            .map(|record| record.into_node(target.clone()))
            .collect()
    }

    /// Snapshots of the node `(label, node_id)`, newest first.
    pub fn node_history(&mut self, label: &str, node_id: &str) -> Result<Vec<VoidedNode>> {
        self.flush()?;
        let ty = self.graph.schema().resolve_node(label)?;
        rows::node_history(self.connection()?, ty.label(), node_id)
    }

    /// Snapshots of the edge `(src_id, dst_id, label)`, newest first.
    pub fn edge_history(&mut self, src_id: &str, dst_id: &str, label: &str) -> Result<Vec<VoidedEdge>> {
        self.flush()?;
        rows::edge_history(self.connection()?, src_id, dst_id, label)
    }

    /// Loads the neighborhood of `root` reachable along `direction`, at
    /// most `max_depth` hops out, for in-memory traversal.
    pub fn subgraph(&mut self, root: &Node, direction: Dir, max_depth: Option<usize>) -> Result<Subgraph> {
        self.flush()?;
        let schema = self.graph.schema();
        let conn = self.connection()?;
        let root = rows::fetch_node(conn, root.node_type(), root.node_id())?
            .ok_or_else(|| GraphError::lookup(root.label(), root.node_id(), 1, 0))?
            .into_node(root.node_type().clone())?;

        let mut graph = Subgraph::new();
        let mut frontier = vec![root.clone()];
        graph.add_node(root);
        let mut depth = 0;
        while !frontier.is_empty() && max_depth.map_or(true, |max| depth < max) {
            let mut next = Vec::new();
            for node in &frontier {
                for (edge_ty, side) in schema.edges_touching(node.label()) {
                    let (near, far_label) = match (direction, side) {
                        (Dir::Out, EdgeSide::Source) => ("src_id", edge_ty.dst_label()),
                        (Dir::In, EdgeSide::Destination) => ("dst_id", edge_ty.src_label()),
                        _ => continue,
                    };
                    let far_ty = schema.resolve_node(far_label)?;
                    for record in rows::edges_at(conn, &edge_ty, near, node.node_id())? {
                        let far_id = if near == "src_id" {
                            record.dst_id.clone()
                        } else {
                            record.src_id.clone()
                        };
                        if graph.node(far_label, &far_id).is_none() {
                            let Some(found) = rows::fetch_node(conn, &far_ty, &far_id)? else {
                                continue;
                            };
                            let found = found.into_node(far_ty.clone())?;
                            next.push(found.clone());
                            graph.add_node(found);
                        }
                        graph.add_edge(record.into_edge(edge_ty.clone())?)?;
                    }
                }
            }
            frontier = next;
            depth += 1;
        }
        debug!(
            session_id = self.id,
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            depth,
            "subgraph loaded"
        );
        Ok(graph)
    }

    // -- raw rows ---------------------------------------------------------

    pub(crate) fn select_nodes(
        &self,
        ty: &NodeType,
        query: &NodeQuery,
        limit: Option<usize>,
    ) -> Result<Vec<NodeRecord>> {
        let Some(filter) = query.compile(ty, None)? else {
            return Ok(Vec::new());
        };
        if filter.is_unsatisfiable() {
            return Ok(Vec::new());
        }
        let mut sql = format!(
            "SELECT {} FROM {}{} ORDER BY node_id",
            column_list(NODE_COLUMNS, None),
            ty.table(),
            filter.where_sql()
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_from_iter(filter.params.iter()), NodeRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub(crate) fn select_edges(
        &self,
        ty: &EdgeType,
        query: &EdgeQuery,
        limit: Option<usize>,
    ) -> Result<Vec<EdgeRecord>> {
        let Some(filter) = query.compile(ty)? else {
            return Ok(Vec::new());
        };
        if filter.is_unsatisfiable() {
            return Ok(Vec::new());
        }
        let mut sql = format!(
            "SELECT {} FROM {}{} ORDER BY src_id, dst_id",
            column_list(EDGE_COLUMNS, None),
            ty.table(),
            filter.where_sql()
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_from_iter(filter.params.iter()), EdgeRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn count(&self, table: &str, filter: &SqlFilter) -> Result<usize> {
        if filter.is_unsatisfiable() {
            return Ok(0);
        }
        let sql = format!("SELECT COUNT(*) FROM {table}{}", filter.where_sql());
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&sql)?;
        let count: i64 = stmt.query_row(params_from_iter(filter.params.iter()), |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            if !self.pending.is_empty() {
                warn!(
                    session_id = self.id,
                    pending = self.pending.len(),
                    "session dropped with unflushed writes"
                );
            }
            self.abort();
        }
    }
}

impl std::fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("read_only", &self.read_only)
            .field("pending", &self.pending.len())
            .finish()
    }
}
