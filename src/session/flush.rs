//! Snapshot-before-mutate versioning.
//!
//! A flush drains the session's pending writes in a fixed order (node
//! upserts, edge upserts, edge deletes, node deletes) under one shared
//! timestamp. Prior state is always re-read inside the transaction, so
//! the merge and the history row agree with what the transaction sees.

use rusqlite::Connection;
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tracing::debug;

use crate::error::{GraphError, Result};
use crate::model::{format_ts, normalize_ts, Edge, Node, Properties};
use crate::schema::{EdgeSide, PropertySet, Schema};
use crate::store::rows::{self, encode, EdgeRecord, NodeRecord, StoredState};

/// What a queued write asks for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum WriteOp {
    /// Fresh entity; no prior row is expected.
    Insert,
    /// Update the stored row, inserting when none exists.
    Merge,
    /// Snapshot and remove the stored row.
    Delete,
}

#[derive(Debug)]
pub(crate) enum Pending {
    Node(WriteOp, Node),
    Edge(WriteOp, Edge),
}

/// Per-flush counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlushStats {
    /// Rows written for entities that did not exist.
    pub inserted: usize,
    /// Rows rewritten after a snapshot.
    pub updated: usize,
    /// Merges that changed nothing.
    pub unchanged: usize,
    /// Rows removed, cascaded edges included.
    pub deleted: usize,
    /// History rows written.
    pub snapshots: usize,
}

impl FlushStats {
    /// Total entities touched.
    pub fn writes(&self) -> usize {
        self.inserted + self.updated + self.unchanged + self.deleted
    }

    pub(crate) fn absorb(&mut self, other: FlushStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.deleted += other.deleted;
        self.snapshots += other.snapshots;
    }
}

/// Text of the timestamp shared by every row a flush writes.
pub(crate) fn flush_timestamp(conn: &Connection, db_clock: bool) -> Result<String> {
    if db_clock {
        let raw: String = conn.query_row(
            "SELECT strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
            [],
            |row| row.get(0),
        )?;
        normalize_ts(&raw)
    } else {
        format_ts(OffsetDateTime::now_utc())
    }
}

pub(crate) struct Flush<'c> {
    conn: &'c Connection,
    schema: &'c Schema,
    session_id: u64,
    stamp: String,
    stats: FlushStats,
}

impl<'c> Flush<'c> {
    pub fn new(conn: &'c Connection, schema: &'c Schema, session_id: u64, stamp: String) -> Self {
        Self {
            conn,
            schema,
            session_id,
            stamp,
            stats: FlushStats::default(),
        }
    }

    pub fn run(mut self, pending: Vec<Pending>) -> Result<FlushStats> {
        let mut node_writes = Vec::new();
        let mut edge_writes = Vec::new();
        let mut edge_deletes = Vec::new();
        let mut node_deletes = Vec::new();
        for op in pending {
            match op {
                Pending::Node(WriteOp::Delete, node) => node_deletes.push(node),
                Pending::Node(op, node) => node_writes.push((op, node)),
                Pending::Edge(WriteOp::Delete, edge) => edge_deletes.push(edge),
                Pending::Edge(op, edge) => edge_writes.push((op, edge)),
            }
        }
        for (op, node) in &node_writes {
            self.write_node(*op, node)?;
        }
        for (op, edge) in &edge_writes {
            self.write_edge(*op, edge)?;
        }
        for edge in &edge_deletes {
            self.delete_edge(edge)?;
        }
        for node in &node_deletes {
            self.delete_node(node)?;
        }
        debug!(
            session_id = self.session_id,
            stamp = %self.stamp,
            inserted = self.stats.inserted,
            updated = self.stats.updated,
            unchanged = self.stats.unchanged,
            deleted = self.stats.deleted,
            snapshots = self.stats.snapshots,
            "flush complete"
        );
        Ok(self.stats)
    }

    fn write_node(&mut self, op: WriteOp, node: &Node) -> Result<()> {
        let ty = node.node_type();
        let prior = match op {
            WriteOp::Insert => None,
            _ => rows::fetch_node(self.conn, ty, node.node_id())?,
        };
        let Some(prior) = prior else {
            return self.insert_node(node);
        };

        let stored = prior.state()?;
        let next = merged_state(
            node.properties(),
            node.system_annotations().pending_changes().merge_onto(&stored.sysan),
            if node.acl_dirty() { node.acl().to_vec() } else { stored.acl.clone() },
            &stored,
            ty.properties(),
        );
        check_required(node.properties(), &next.props, |key| {
            node.invalid(Some(key), "required property is null")
        })?;
        if is_same(&next, &stored, ty.properties()) {
            self.stats.unchanged += 1;
            debug!(session_id = self.session_id, label = ty.label(), node_id = node.node_id(), "node unchanged");
            return Ok(());
        }

        rows::void_node(self.conn, ty.label(), &prior, &self.stamp)?;
        let record = NodeRecord {
            node_id: prior.node_id.clone(),
            created: prior.created.clone(),
            acl: encode(&next.acl)?,
            sysan: encode(&next.sysan)?,
            props: encode(&next.props)?,
        };
        rows::update_node(self.conn, ty.table(), &record)?;
        self.stats.snapshots += 1;
        self.stats.updated += 1;
        debug!(session_id = self.session_id, label = ty.label(), node_id = node.node_id(), "node updated");
        Ok(())
    }

    fn insert_node(&mut self, node: &Node) -> Result<()> {
        let ty = node.node_type();
        let props = node.properties().to_map();
        check_required(node.properties(), &props, |key| {
            node.invalid(Some(key), "required property is null")
        })?;
        let record = NodeRecord {
            node_id: node.node_id().to_owned(),
            created: self.created_text(node.created())?,
            acl: encode(node.acl())?,
            sysan: encode(node.system_annotations().as_map())?,
            props: encode(&props)?,
        };
        rows::insert_node(self.conn, ty.table(), &record)?;
        self.stats.inserted += 1;
        debug!(session_id = self.session_id, label = ty.label(), node_id = node.node_id(), "node inserted");
        Ok(())
    }

    fn delete_node(&mut self, node: &Node) -> Result<()> {
        let ty = node.node_type();
        let prior = rows::fetch_node(self.conn, ty, node.node_id())?
            .ok_or_else(|| GraphError::lookup(ty.label(), node.node_id(), 1, 0))?;

        for (edge_ty, side) in self.schema.edges_touching(ty.label()) {
            let column = match side {
                EdgeSide::Source => "src_id",
                EdgeSide::Destination => "dst_id",
            };
            for record in rows::edges_at(self.conn, &edge_ty, column, node.node_id())? {
                rows::void_edge(self.conn, &edge_ty, &record, &self.stamp)?;
                rows::delete_edge(self.conn, edge_ty.table(), &record.src_id, &record.dst_id)?;
                self.stats.snapshots += 1;
                self.stats.deleted += 1;
                debug!(
                    session_id = self.session_id,
                    edge_type = edge_ty.name(),
                    src_id = %record.src_id,
                    dst_id = %record.dst_id,
                    "incident edge deleted"
                );
            }
        }

        let stored = prior.state()?;
        let last = merged_state(
            node.properties(),
            node.system_annotations().pending_changes().merge_onto(&stored.sysan),
            if node.acl_dirty() { node.acl().to_vec() } else { stored.acl.clone() },
            &stored,
            ty.properties(),
        );
        let snapshot = NodeRecord {
            node_id: prior.node_id.clone(),
            created: prior.created.clone(),
            acl: encode(&last.acl)?,
            sysan: encode(&last.sysan)?,
            props: encode(&last.props)?,
        };
        rows::void_node(self.conn, ty.label(), &snapshot, &self.stamp)?;
        rows::delete_node(self.conn, ty.table(), node.node_id())?;
        self.stats.snapshots += 1;
        self.stats.deleted += 1;
        debug!(session_id = self.session_id, label = ty.label(), node_id = node.node_id(), "node deleted");
        Ok(())
    }

    fn write_edge(&mut self, op: WriteOp, edge: &Edge) -> Result<()> {
        let ty = edge.edge_type();
        let prior = match op {
            WriteOp::Insert => None,
            _ => rows::fetch_edge(self.conn, ty, edge.src_id(), edge.dst_id())?,
        };
        let Some(prior) = prior else {
            return self.insert_edge(edge);
        };

        let stored = prior.state()?;
        let next = merged_state(
            edge.properties(),
            edge.system_annotations().pending_changes().merge_onto(&stored.sysan),
            if edge.acl_dirty() { edge.acl().to_vec() } else { stored.acl.clone() },
            &stored,
            ty.properties(),
        );
        check_required(edge.properties(), &next.props, |key| {
            edge.invalid(Some(key), "required property is null")
        })?;
        if is_same(&next, &stored, ty.properties()) {
            self.stats.unchanged += 1;
            return Ok(());
        }

        rows::void_edge(self.conn, ty, &prior, &self.stamp)?;
        let record = EdgeRecord {
            src_id: prior.src_id.clone(),
            dst_id: prior.dst_id.clone(),
            created: prior.created.clone(),
            acl: encode(&next.acl)?,
            sysan: encode(&next.sysan)?,
            props: encode(&next.props)?,
        };
        rows::update_edge(self.conn, ty.table(), &record)?;
        self.stats.snapshots += 1;
        self.stats.updated += 1;
        debug!(
            session_id = self.session_id,
            edge_type = ty.name(),
            src_id = edge.src_id(),
            dst_id = edge.dst_id(),
            "edge updated"
        );
        Ok(())
    }

    fn insert_edge(&mut self, edge: &Edge) -> Result<()> {
        let ty = edge.edge_type();
        let endpoints = [
            ("source", ty.src_label(), edge.src_id()),
            ("destination", ty.dst_label(), edge.dst_id()),
        ];
        for (side, label, id) in endpoints {
            let table = self.schema.resolve_node(label)?;
            if !rows::node_exists(self.conn, table.table(), id)? {
                return Err(GraphError::MissingEndpoint {
                    edge_type: ty.name().to_owned(),
                    src_id: edge.src_id().to_owned(),
                    dst_id: edge.dst_id().to_owned(),
                    side,
                    missing: id.to_owned(),
                });
            }
        }
        let props = edge.properties().to_map();
        check_required(edge.properties(), &props, |key| {
            edge.invalid(Some(key), "required property is null")
        })?;
        let record = EdgeRecord {
            src_id: edge.src_id().to_owned(),
            dst_id: edge.dst_id().to_owned(),
            created: self.created_text(edge.created())?,
            acl: encode(edge.acl())?,
            sysan: encode(edge.system_annotations().as_map())?,
            props: encode(&props)?,
        };
        rows::insert_edge(self.conn, ty.table(), &record)?;
        self.stats.inserted += 1;
        debug!(
            session_id = self.session_id,
            edge_type = ty.name(),
            src_id = edge.src_id(),
            dst_id = edge.dst_id(),
            "edge inserted"
        );
        Ok(())
    }

    fn delete_edge(&mut self, edge: &Edge) -> Result<()> {
        let ty = edge.edge_type();
        let prior = rows::fetch_edge(self.conn, ty, edge.src_id(), edge.dst_id())?
            .ok_or_else(|| GraphError::lookup(ty.name(), edge.display_id(), 1, 0))?;
        let stored = prior.state()?;
        let last = merged_state(
            edge.properties(),
            edge.system_annotations().pending_changes().merge_onto(&stored.sysan),
            if edge.acl_dirty() { edge.acl().to_vec() } else { stored.acl.clone() },
            &stored,
            ty.properties(),
        );
        let snapshot = EdgeRecord {
            acl: encode(&last.acl)?,
            sysan: encode(&last.sysan)?,
            props: encode(&last.props)?,
            ..prior
        };
        rows::void_edge(self.conn, ty, &snapshot, &self.stamp)?;
        rows::delete_edge(self.conn, ty.table(), edge.src_id(), edge.dst_id())?;
        self.stats.snapshots += 1;
        self.stats.deleted += 1;
        debug!(
            session_id = self.session_id,
            edge_type = ty.name(),
            src_id = edge.src_id(),
            dst_id = edge.dst_id(),
            "edge deleted"
        );
        Ok(())
    }

    fn created_text(&self, created: Option<OffsetDateTime>) -> Result<String> {
        match created {
            Some(created) => format_ts(created),
            None => Ok(self.stamp.clone()),
        }
    }
}

/// Stored state with the in-flight delta applied: keys the entity did not
/// touch keep their stored value, touched keys take the entity's value.
fn merged_state(
    props: &Properties,
    sysan: Map<String, Value>,
    acl: Vec<String>,
    stored: &StoredState,
    decl: &PropertySet,
) -> StoredState {
    let merged = props.pending_changes().merge_onto(&stored.props);
    StoredState {
        acl,
        sysan,
        props: padded(merged, decl),
    }
}

fn padded(mut map: Map<String, Value>, decl: &PropertySet) -> Map<String, Value> {
    for key in decl.keys() {
        if !map.contains_key(key) {
            map.insert(key.to_owned(), Value::Null);
        }
    }
    map
}

fn is_same(next: &StoredState, stored: &StoredState, decl: &PropertySet) -> bool {
    next.acl == stored.acl
        && next.sysan == stored.sysan
        && next.props == padded(stored.props.clone(), decl)
}

fn check_required<F>(props: &Properties, state: &Map<String, Value>, invalid: F) -> Result<()>
where
    F: FnOnce(&str) -> GraphError,
{
    match props.missing_required(state).next() {
        Some(key) => Err(invalid(key)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{NodeTypeDef, PropertyDef};
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn file_schema() -> std::sync::Arc<Schema> {
        Schema::builder()
            .node(
                NodeTypeDef::new("file")
                    .property(PropertyDef::string("name"))
                    .property(PropertyDef::integer("size"))
                    .required(["name"]),
            )
            .build()
            .unwrap()
    }

    fn stored_file(schema: &Schema, props: Value) -> (Node, StoredState) {
        let ty = schema.resolve_node("file").unwrap();
        let stored = StoredState {
            acl: vec!["open".into()],
            sysan: map(json!({"source": "import"})),
            props: map(props),
        };
        let node = Node::from_stored(
            ty,
            "f1".into(),
            OffsetDateTime::UNIX_EPOCH,
            stored.acl.clone(),
            stored.sysan.clone(),
            stored.props.clone(),
        );
        (node, stored)
    }

    #[test]
    fn live_values_win_and_untouched_keys_survive() {
        let schema = file_schema();
        let (mut node, stored) = stored_file(&schema, json!({"name": "x.txt", "size": 5}));
        node.set("name", "y.txt").unwrap();
        let next = merged_state(
            node.properties(),
            stored.sysan.clone(),
            stored.acl.clone(),
            &stored,
            node.node_type().properties(),
        );
        assert_eq!(next.props, map(json!({"name": "y.txt", "size": 5})));
        assert!(!is_same(&next, &stored, node.node_type().properties()));
    }

    #[test]
    fn a_stale_entity_does_not_clobber_keys_it_never_touched() {
        // The entity was loaded with size 5; another writer stored size 9
        // before this flush. Only the touched key may change.
        let schema = file_schema();
        let (mut node, _) = stored_file(&schema, json!({"name": "x.txt", "size": 5}));
        node.set("name", "y.txt").unwrap();
        let concurrent = StoredState {
            acl: vec!["open".into()],
            sysan: map(json!({"source": "import"})),
            props: map(json!({"name": "x.txt", "size": 9})),
        };
        let next = merged_state(
            node.properties(),
            concurrent.sysan.clone(),
            concurrent.acl.clone(),
            &concurrent,
            node.node_type().properties(),
        );
        assert_eq!(next.props, map(json!({"name": "y.txt", "size": 9})));
    }

    #[test]
    fn rewriting_the_same_value_is_not_a_change() {
        let schema = file_schema();
        let (mut node, stored) = stored_file(&schema, json!({"name": "x.txt"}));
        node.set("name", "x.txt").unwrap();
        let next = merged_state(
            node.properties(),
            stored.sysan.clone(),
            stored.acl.clone(),
            &stored,
            node.node_type().properties(),
        );
        assert_eq!(next.props, map(json!({"name": "x.txt", "size": null})));
        assert!(is_same(&next, &stored, node.node_type().properties()));
    }

    #[test]
    fn required_keys_are_checked_on_the_merged_state() {
        let schema = file_schema();
        let (mut node, stored) = stored_file(&schema, json!({"name": "x.txt"}));
        node.properties_mut().delete("name").unwrap();
        let next = merged_state(
            node.properties(),
            stored.sysan.clone(),
            stored.acl.clone(),
            &stored,
            node.node_type().properties(),
        );
        let err = check_required(node.properties(), &next.props, |key| {
            node.invalid(Some(key), "required property is null")
        })
        .unwrap_err();
        assert!(matches!(err, GraphError::Validation { key: Some(ref k), .. } if k == "name"));
    }
}
