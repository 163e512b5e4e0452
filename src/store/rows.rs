//! Stored row shapes and the single-row statements the session and the
//! copier share.
//!
//! JSON columns are kept as text here. Decoding to maps happens only when
//! a row becomes an entity or a history record, so the copier can compare
//! and move rows without a decode/encode round trip.

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::ddl::{VOIDED_EDGES, VOIDED_NODES};
use crate::error::Result;
use crate::model::{parse_ts, Edge, Node, VoidedEdge, VoidedNode};
use crate::schema::{EdgeType, NodeType};

pub(crate) const NODE_COLUMNS: &[&str] = &["node_id", "created", "acl", "_sysan", "_props"];
pub(crate) const EDGE_COLUMNS: &[&str] = &["src_id", "dst_id", "created", "acl", "_sysan", "_props"];

/// Comma separated column list, optionally qualified by a table alias.
pub(crate) fn column_list(columns: &[&str], alias: Option<&str>) -> String {
    columns
        .iter()
        .map(|col| match alias {
            Some(alias) => format!("{alias}.{col}"),
            None => (*col).to_owned(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(raw: &str) -> Result<T> {
    Ok(serde_json::from_str(raw)?)
}

/// One `node_<label>` row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct NodeRecord {
    pub node_id: String,
    pub created: String,
    pub acl: String,
    pub sysan: String,
    pub props: String,
}

impl NodeRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            node_id: row.get(0)?,
            created: row.get(1)?,
            acl: row.get(2)?,
            sysan: row.get(3)?,
            props: row.get(4)?,
        })
    }

    pub fn state(&self) -> Result<StoredState> {
        StoredState::decode(&self.acl, &self.sysan, &self.props)
    }

    pub fn into_node(self, ty: Arc<NodeType>) -> Result<Node> {
        let state = self.state()?;
        Ok(Node::from_stored(
            ty,
            self.node_id,
            parse_ts(&self.created)?,
            state.acl,
            state.sysan,
            state.props,
        ))
    }
}

/// One `edge_<type>` row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct EdgeRecord {
    pub src_id: String,
    pub dst_id: String,
    pub created: String,
    pub acl: String,
    pub sysan: String,
    pub props: String,
}

impl EdgeRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            src_id: row.get(0)?,
            dst_id: row.get(1)?,
            created: row.get(2)?,
            acl: row.get(3)?,
            sysan: row.get(4)?,
            props: row.get(5)?,
        })
    }

    pub fn state(&self) -> Result<StoredState> {
        StoredState::decode(&self.acl, &self.sysan, &self.props)
    }

    pub fn into_edge(self, ty: Arc<EdgeType>) -> Result<Edge> {
        let state = self.state()?;
        Ok(Edge::from_stored(
            ty,
            self.src_id,
            self.dst_id,
            parse_ts(&self.created)?,
            state.acl,
            state.sysan,
            state.props,
        ))
    }
}

/// Decoded mutable state of a stored entity.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct StoredState {
    pub acl: Vec<String>,
    pub sysan: Map<String, Value>,
    pub props: Map<String, Value>,
}

impl StoredState {
    fn decode(acl: &str, sysan: &str, props: &str) -> Result<Self> {
        Ok(Self {
            acl: decode(acl)?,
            sysan: decode(sysan)?,
            props: decode(props)?,
        })
    }
}

pub(crate) fn fetch_node(conn: &Connection, ty: &NodeType, node_id: &str) -> Result<Option<NodeRecord>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE node_id = ?1",
        column_list(NODE_COLUMNS, None),
        ty.table()
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    Ok(stmt.query_row([node_id], NodeRecord::from_row).optional()?)
}

pub(crate) fn node_exists(conn: &Connection, table: &str, node_id: &str) -> Result<bool> {
    let sql = format!("SELECT 1 FROM {table} WHERE node_id = ?1");
    let mut stmt = conn.prepare_cached(&sql)?;
    Ok(stmt.exists([node_id])?)
}

pub(crate) fn insert_node(conn: &Connection, table: &str, record: &NodeRecord) -> Result<()> {
    let sql = format!(
        "INSERT INTO {table} ({}) VALUES (?1, ?2, ?3, ?4, ?5)",
        column_list(NODE_COLUMNS, None)
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    stmt.execute(params![
        record.node_id,
        record.created,
        record.acl,
        record.sysan,
        record.props
    ])?;
    Ok(())
}

pub(crate) fn update_node(conn: &Connection, table: &str, record: &NodeRecord) -> Result<usize> {
    let sql = format!("UPDATE {table} SET acl = ?2, _sysan = ?3, _props = ?4 WHERE node_id = ?1");
    let mut stmt = conn.prepare_cached(&sql)?;
    Ok(stmt.execute(params![record.node_id, record.acl, record.sysan, record.props])?)
}

pub(crate) fn delete_node(conn: &Connection, table: &str, node_id: &str) -> Result<usize> {
    let sql = format!("DELETE FROM {table} WHERE node_id = ?1");
    let mut stmt = conn.prepare_cached(&sql)?;
    Ok(stmt.execute([node_id])?)
}

pub(crate) fn fetch_edge(
    conn: &Connection,
    ty: &EdgeType,
    src_id: &str,
    dst_id: &str,
) -> Result<Option<EdgeRecord>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE src_id = ?1 AND dst_id = ?2",
        column_list(EDGE_COLUMNS, None),
        ty.table()
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    Ok(stmt
        .query_row([src_id, dst_id], EdgeRecord::from_row)
        .optional()?)
}

/// Edges of `ty` whose `column` (`src_id` or `dst_id`) equals `node_id`.
pub(crate) fn edges_at(
    conn: &Connection,
    ty: &EdgeType,
    column: &str,
    node_id: &str,
) -> Result<Vec<EdgeRecord>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE {column} = ?1 ORDER BY src_id, dst_id",
        column_list(EDGE_COLUMNS, None),
        ty.table()
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map([node_id], EdgeRecord::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub(crate) fn insert_edge(conn: &Connection, table: &str, record: &EdgeRecord) -> Result<()> {
    let sql = format!(
        "INSERT INTO {table} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        column_list(EDGE_COLUMNS, None)
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    stmt.execute(params![
        record.src_id,
        record.dst_id,
        record.created,
        record.acl,
        record.sysan,
        record.props
    ])?;
    Ok(())
}

pub(crate) fn update_edge(conn: &Connection, table: &str, record: &EdgeRecord) -> Result<usize> {
    let sql = format!(
        "UPDATE {table} SET acl = ?3, _sysan = ?4, _props = ?5 WHERE src_id = ?1 AND dst_id = ?2"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    Ok(stmt.execute(params![
        record.src_id,
        record.dst_id,
        record.acl,
        record.sysan,
        record.props
    ])?)
}

pub(crate) fn delete_edge(conn: &Connection, table: &str, src_id: &str, dst_id: &str) -> Result<usize> {
    let sql = format!("DELETE FROM {table} WHERE src_id = ?1 AND dst_id = ?2");
    let mut stmt = conn.prepare_cached(&sql)?;
    Ok(stmt.execute([src_id, dst_id])?)
}

pub(crate) fn void_node(conn: &Connection, label: &str, record: &NodeRecord, voided: &str) -> Result<()> {
    let sql = format!(
        "INSERT INTO {VOIDED_NODES} (node_id, label, created, voided, acl, _sysan, _props)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    stmt.execute(params![
        record.node_id,
        label,
        record.created,
        voided,
        record.acl,
        record.sysan,
        record.props
    ])?;
    Ok(())
}

pub(crate) fn void_edge(conn: &Connection, ty: &EdgeType, record: &EdgeRecord, voided: &str) -> Result<()> {
    let sql = format!(
        "INSERT INTO {VOIDED_EDGES} (src_id, dst_id, label, edge_type, created, voided, acl, _sysan, _props)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    stmt.execute(params![
        record.src_id,
        record.dst_id,
        ty.label(),
        ty.name(),
        record.created,
        voided,
        record.acl,
        record.sysan,
        record.props
    ])?;
    Ok(())
}

pub(crate) fn node_history(conn: &Connection, label: &str, node_id: &str) -> Result<Vec<VoidedNode>> {
    let sql = format!(
        "SELECT key, node_id, label, created, voided, acl, _sysan, _props
         FROM {VOIDED_NODES} WHERE node_id = ?1 AND label = ?2
         ORDER BY voided DESC, key DESC"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let raw = stmt
        .query_map([node_id, label], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                [row.get::<_, String>(5)?, row.get(6)?, row.get(7)?],
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raw.into_iter()
        .map(|(key, node_id, label, created, voided, [acl, sysan, props])| {
            let state = StoredState::decode(&acl, &sysan, &props)?;
            Ok(VoidedNode {
                key,
                node_id,
                label,
                created: parse_ts(&created)?,
                voided: parse_ts(&voided)?,
                acl: state.acl,
                system_annotations: state.sysan,
                properties: state.props,
            })
        })
        .collect()
}

pub(crate) fn edge_history(
    conn: &Connection,
    src_id: &str,
    dst_id: &str,
    label: &str,
) -> Result<Vec<VoidedEdge>> {
    let sql = format!(
        "SELECT key, src_id, dst_id, label, edge_type, created, voided, acl, _sysan, _props
         FROM {VOIDED_EDGES} WHERE src_id = ?1 AND dst_id = ?2 AND label = ?3
         ORDER BY voided DESC, key DESC"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let raw = stmt
        .query_map([src_id, dst_id, label], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                [row.get::<_, String>(1)?, row.get(2)?, row.get(3)?, row.get(4)?],
                [row.get::<_, String>(5)?, row.get(6)?],
                [row.get::<_, String>(7)?, row.get(8)?, row.get(9)?],
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raw.into_iter()
        .map(|(key, [src_id, dst_id, label, edge_type], [created, voided], [acl, sysan, props])| {
            let state = StoredState::decode(&acl, &sysan, &props)?;
            Ok(VoidedEdge {
                key,
                src_id,
                dst_id,
                label,
                edge_type,
                created: parse_ts(&created)?,
                voided: parse_ts(&voided)?,
                acl: state.acl,
                system_annotations: state.sysan,
                properties: state.props,
            })
        })
        .collect()
}
