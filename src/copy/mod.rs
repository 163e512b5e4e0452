//! Chunked copy of one graph's rows into another graph's tables.
//!
//! Source rows are read in key order inside one read transaction and
//! written to the destination one chunk per transaction. A chunk updates
//! the rows the destination already holds and inserts the rest, so
//! running the same copy twice leaves the destination unchanged. Copies
//! move stored rows verbatim and write no history.

mod client;
mod server;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::TxBehavior;
use crate::error::{GraphError, Result};
use crate::store::{EdgeQuery, Graph, NodeQuery};

/// Where a chunk is reconciled.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyStrategy {
    /// Look up existing keys, then update and insert row by row.
    #[default]
    Client,
    /// Stage the chunk in a temporary table and reconcile it with set
    /// statements under the write lock.
    Server,
}

/// Copy tuning.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct CopyOptions {
    /// Rows per destination transaction.
    pub chunk_size: usize,
    /// Reconciliation strategy.
    pub strategy: CopyStrategy,
    /// Skip edges whose endpoints the destination lacks. When `false`
    /// such edges reach the destination and its foreign keys reject the
    /// chunk.
    pub drop_missing_endpoints: bool,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            strategy: CopyStrategy::Client,
            drop_missing_endpoints: true,
        }
    }
}

/// Outcome of copying one node or edge type.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct CopyReport {
    /// Label or edge type name.
    pub type_name: String,
    /// Destination transactions committed.
    pub chunks: usize,
    /// Source rows read.
    pub read: usize,
    /// Rows the destination did not have.
    pub inserted: usize,
    /// Rows rewritten because their stored text differed.
    pub updated: usize,
    /// Rows already identical at the destination.
    pub unchanged: usize,
    /// Edges dropped for a missing endpoint.
    pub skipped: usize,
}

impl CopyReport {
    fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_owned(),
            ..Self::default()
        }
    }

    fn absorb(&mut self, read: usize, chunk: ChunkOutcome) {
        self.chunks += 1;
        self.read += read;
        self.inserted += chunk.inserted;
        self.updated += chunk.updated;
        self.unchanged += chunk.unchanged;
        self.skipped += chunk.skipped;
    }

    /// Rows inserted or updated.
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct ChunkOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

/// Destination node tables an edge chunk points into.
pub(crate) struct Endpoints<'t> {
    pub src_table: &'t str,
    pub dst_table: &'t str,
    pub drop_missing: bool,
}

/// Copies rows from `source` into `dest`. Both graphs must declare the
/// copied types.
#[derive(Debug)]
pub struct BulkCopier<'a> {
    source: &'a Graph,
    dest: &'a Graph,
    options: CopyOptions,
}

impl<'a> BulkCopier<'a> {
    /// Copier using the destination's configured [`CopyOptions`].
    pub fn new(source: &'a Graph, dest: &'a Graph) -> Self {
        Self {
            source,
            dest,
            options: dest.config().copy.clone(),
        }
    }

    /// Replaces the copy options.
    pub fn with_options(mut self, options: CopyOptions) -> Self {
        self.options = options;
        self
    }

    /// Active options.
    pub fn options(&self) -> &CopyOptions {
        &self.options
    }

    /// Copies the nodes matching `query`, which must name a label.
    pub fn copy_nodes(&self, query: &NodeQuery) -> Result<CopyReport> {
        let label = query.label().ok_or_else(|| {
            GraphError::InvalidArgument("bulk copy needs a concrete node label".into())
        })?;
        let chunk_size = self.chunk_size()?;
        let src_ty = self.source.schema().resolve_node(label)?;
        let dst_ty = self.dest.schema().resolve_node(label)?;

        let mut report = CopyReport::new(label);
        let reader = self.source.read_session()?;
        let mut page = query.clone();
        let mut remaining = query.row_limit();
        loop {
            let take = remaining.map_or(chunk_size, |left| left.min(chunk_size));
            if take == 0 {
                break;
            }
            let records = reader.select_nodes(&src_ty, &page, Some(take))?;
            let Some(last) = records.last() else {
                break;
            };
            page = query.clone().after(last.node_id.clone());
            if let Some(left) = remaining.as_mut() {
                *left -= records.len();
            }

            let outcome = self.write_chunk(|conn| match self.options.strategy {
                CopyStrategy::Client => client::upsert_nodes(conn, dst_ty.table(), &records),
                CopyStrategy::Server => server::upsert_nodes(conn, dst_ty.table(), &records),
            })?;
            report.absorb(records.len(), outcome);
            debug!(
                label,
                chunk = report.chunks,
                rows = records.len(),
                inserted = outcome.inserted,
                updated = outcome.updated,
                "node chunk copied"
            );
            if records.len() < take {
                break;
            }
        }
        reader.commit()?;
        log_report(&report);
        Ok(report)
    }

    /// Copies the edges matching `query`, which must select one edge type.
    pub fn copy_edges(&self, query: &EdgeQuery) -> Result<CopyReport> {
        if !query.is_concrete() {
            return Err(GraphError::InvalidArgument(
                "bulk copy needs a concrete edge type".into(),
            ));
        }
        let chunk_size = self.chunk_size()?;
        let src_ty = query
            .edge_types(self.source.schema())?
            .pop()
            .ok_or_else(|| GraphError::InvalidArgument("query selects no edge type".into()))?;
        let dst_ty = self.dest.schema().edge_type(src_ty.name())?;
        let src_table = self.dest.schema().resolve_node(dst_ty.src_label())?;
        let dst_table = self.dest.schema().resolve_node(dst_ty.dst_label())?;
        let endpoints = Endpoints {
            src_table: src_table.table(),
            dst_table: dst_table.table(),
            drop_missing: self.options.drop_missing_endpoints,
        };

        let mut report = CopyReport::new(src_ty.name());
        let reader = self.source.read_session()?;
        let mut page = query.clone();
        let mut remaining = query.row_limit();
        loop {
            let take = remaining.map_or(chunk_size, |left| left.min(chunk_size));
            if take == 0 {
                break;
            }
            let records = reader.select_edges(&src_ty, &page, Some(take))?;
            let Some(last) = records.last() else {
                break;
            };
            page = query.clone().after(last.src_id.clone(), last.dst_id.clone());
            if let Some(left) = remaining.as_mut() {
                *left -= records.len();
            }

            let outcome = self.write_chunk(|conn| match self.options.strategy {
                CopyStrategy::Client => client::upsert_edges(conn, dst_ty.table(), &endpoints, &records),
                CopyStrategy::Server => server::upsert_edges(conn, dst_ty.table(), &endpoints, &records),
            })?;
            report.absorb(records.len(), outcome);
            debug!(
                edge_type = src_ty.name(),
                chunk = report.chunks,
                rows = records.len(),
                inserted = outcome.inserted,
                updated = outcome.updated,
                skipped = outcome.skipped,
                "edge chunk copied"
            );
            if records.len() < take {
                break;
            }
        }
        reader.commit()?;
        log_report(&report);
        Ok(report)
    }

    /// Copies every node type, then every edge type, of the source.
    pub fn copy_graph(&self) -> Result<Vec<CopyReport>> {
        let schema = self.source.schema();
        let mut reports = Vec::new();
        for ty in schema.node_types() {
            reports.push(self.copy_nodes(&NodeQuery::new(ty.label()))?);
        }
        for ty in schema.edge_types() {
            reports.push(self.copy_edges(&EdgeQuery::new(ty.name()))?);
        }
        Ok(reports)
    }

    fn chunk_size(&self) -> Result<usize> {
        match self.options.chunk_size {
            0 => Err(GraphError::InvalidArgument("chunk_size must be positive".into())),
            size => Ok(size),
        }
    }

    fn write_chunk<F>(&self, write: F) -> Result<ChunkOutcome>
    where
        F: FnOnce(&Connection) -> Result<ChunkOutcome>,
    {
        let behavior = match self.options.strategy {
            CopyStrategy::Server => TxBehavior::Immediate,
            CopyStrategy::Client => self.dest.config().tx_behavior,
        };
        let session = self.dest.session_with(behavior)?;
        let outcome = write(session.connection()?)?;
        session.commit()?;
        Ok(outcome)
    }
}

fn log_report(report: &CopyReport) {
    info!(
        type_name = %report.type_name,
        chunks = report.chunks,
        read = report.read,
        inserted = report.inserted,
        updated = report.updated,
        unchanged = report.unchanged,
        skipped = report.skipped,
        "copy finished"
    );
}

/// Placeholders for an `IN (...)` list of `n` values.
fn marks(n: usize) -> String {
    vec!["?"; n].join(", ")
}
