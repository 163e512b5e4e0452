use rusqlite::{params, params_from_iter, Connection};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::warn;

use super::{marks, ChunkOutcome, Endpoints};
use crate::error::Result;
use crate::store::rows::{self, column_list, EdgeRecord, NodeRecord, EDGE_COLUMNS, NODE_COLUMNS};

/// Keys per lookup statement. Edge lookups bind two values per key, so
/// this stays below SQLite's historical 999-variable limit.
pub(super) const LOOKUP_BATCH: usize = 400;

pub(super) fn upsert_nodes(conn: &Connection, table: &str, records: &[NodeRecord]) -> Result<ChunkOutcome> {
    let ids: Vec<&str> = records.iter().map(|r| r.node_id.as_str()).collect();
    let existing = existing_nodes(conn, table, &ids)?;
    let update = format!(
        "UPDATE {table} SET created = ?2, acl = ?3, _sysan = ?4, _props = ?5 WHERE node_id = ?1"
    );
    let mut outcome = ChunkOutcome::default();
    for record in records {
        match existing.get(record.node_id.as_str()) {
            Some(stored) if stored == record => outcome.unchanged += 1,
            Some(_) => {
                conn.prepare_cached(&update)?.execute(params![
                    record.node_id,
                    record.created,
                    record.acl,
                    record.sysan,
                    record.props
                ])?;
                outcome.updated += 1;
            }
            None => {
                rows::insert_node(conn, table, record)?;
                outcome.inserted += 1;
            }
        }
    }
    Ok(outcome)
}

pub(super) fn upsert_edges(
    conn: &Connection,
    table: &str,
    endpoints: &Endpoints<'_>,
    records: &[EdgeRecord],
) -> Result<ChunkOutcome> {
    let mut outcome = ChunkOutcome::default();
    let kept: Vec<&EdgeRecord> = if endpoints.drop_missing {
        let srcs: Vec<&str> = records.iter().map(|r| r.src_id.as_str()).collect();
        let dsts: Vec<&str> = records.iter().map(|r| r.dst_id.as_str()).collect();
        let src_present = present_ids(conn, endpoints.src_table, &srcs)?;
        let dst_present = present_ids(conn, endpoints.dst_table, &dsts)?;
        records
            .iter()
            .filter(|r| src_present.contains(&r.src_id) && dst_present.contains(&r.dst_id))
            .collect()
    } else {
        records.iter().collect()
    };
    outcome.skipped = records.len() - kept.len();
    if outcome.skipped > 0 {
        warn!(table, skipped = outcome.skipped, "edges with missing endpoints dropped");
    }

    let existing = existing_edges(conn, table, &kept)?;
    let update = format!(
        "UPDATE {table} SET created = ?3, acl = ?4, _sysan = ?5, _props = ?6 \
         WHERE src_id = ?1 AND dst_id = ?2"
    );
    for record in kept {
        let key = (record.src_id.clone(), record.dst_id.clone());
        match existing.get(&key) {
            Some(stored) if stored == record => outcome.unchanged += 1,
            Some(_) => {
                conn.prepare_cached(&update)?.execute(params![
                    record.src_id,
                    record.dst_id,
                    record.created,
                    record.acl,
                    record.sysan,
                    record.props
                ])?;
                outcome.updated += 1;
            }
            None => {
                rows::insert_edge(conn, table, record)?;
                outcome.inserted += 1;
            }
        }
    }
    Ok(outcome)
}

fn existing_nodes(conn: &Connection, table: &str, ids: &[&str]) -> Result<FxHashMap<String, NodeRecord>> {
    let mut found = FxHashMap::default();
    for batch in ids.chunks(LOOKUP_BATCH) {
        let sql = format!(
            "SELECT {} FROM {table} WHERE node_id IN ({})",
            column_list(NODE_COLUMNS, None),
            marks(batch.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        for row in stmt.query_map(params_from_iter(batch), NodeRecord::from_row)? {
            let record = row?;
            found.insert(record.node_id.clone(), record);
        }
    }
    Ok(found)
}

fn existing_edges(
    conn: &Connection,
    table: &str,
    records: &[&EdgeRecord],
) -> Result<FxHashMap<(String, String), EdgeRecord>> {
    let mut found = FxHashMap::default();
    for batch in records.chunks(LOOKUP_BATCH) {
        let pairs = vec!["(?, ?)"; batch.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM {table} WHERE (src_id, dst_id) IN (VALUES {pairs})",
            column_list(EDGE_COLUMNS, None)
        );
        let keys = batch
            .iter()
            .flat_map(|r| [r.src_id.as_str(), r.dst_id.as_str()]);
        let mut stmt = conn.prepare(&sql)?;
        for row in stmt.query_map(params_from_iter(keys), EdgeRecord::from_row)? {
            let record = row?;
            found.insert((record.src_id.clone(), record.dst_id.clone()), record);
        }
    }
    Ok(found)
}

fn present_ids(conn: &Connection, table: &str, ids: &[&str]) -> Result<FxHashSet<String>> {
    let unique: Vec<&str> = ids.iter().copied().collect::<FxHashSet<_>>().into_iter().collect();
    let mut found = FxHashSet::default();
    for batch in unique.chunks(LOOKUP_BATCH) {
        let sql = format!(
            "SELECT node_id FROM {table} WHERE node_id IN ({})",
            marks(batch.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        for row in stmt.query_map(params_from_iter(batch), |row| row.get::<_, String>(0))? {
            found.insert(row?);
        }
    }
    Ok(found)
}
