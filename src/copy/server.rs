//! Set-based reconciliation through a per-connection staging table.
//!
//! The chunk is written to a temporary table, then one `UPDATE ... FROM
//! ... RETURNING` rewrites the rows that differ and one `INSERT ...
//! WHERE NOT EXISTS` adds the rows still missing. The caller holds the
//! destination's write lock (`BEGIN IMMEDIATE`) for the whole chunk.

use rusqlite::Connection;
use tracing::warn;

use super::{ChunkOutcome, Endpoints};
use crate::error::Result;
use crate::store::rows::{self, column_list, EdgeRecord, NodeRecord, EDGE_COLUMNS, NODE_COLUMNS};

const NODE_STAGE: &str = "temp.relgraph_stage_node";
const EDGE_STAGE: &str = "temp.relgraph_stage_edge";

const STAGE_DDL: &str = "
CREATE TEMP TABLE IF NOT EXISTS relgraph_stage_node (
    node_id TEXT PRIMARY KEY,
    created TEXT NOT NULL,
    acl     TEXT NOT NULL,
    _sysan  TEXT NOT NULL,
    _props  TEXT NOT NULL
);
CREATE TEMP TABLE IF NOT EXISTS relgraph_stage_edge (
    src_id  TEXT NOT NULL,
    dst_id  TEXT NOT NULL,
    created TEXT NOT NULL,
    acl     TEXT NOT NULL,
    _sysan  TEXT NOT NULL,
    _props  TEXT NOT NULL,
    PRIMARY KEY (src_id, dst_id)
);
";

fn stage(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(STAGE_DDL)?;
    conn.execute(&format!("DELETE FROM {table}"), [])?;
    Ok(())
}

fn differs(table: &str, columns: &[&str]) -> String {
    columns
        .iter()
        .map(|col| format!("{table}.{col} IS NOT s.{col}"))
        .collect::<Vec<_>>()
        .join(" OR ")
}

pub(super) fn upsert_nodes(conn: &Connection, table: &str, records: &[NodeRecord]) -> Result<ChunkOutcome> {
    stage(conn, NODE_STAGE)?;
    for record in records {
        rows::insert_node(conn, NODE_STAGE, record)?;
    }
    let matched: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {NODE_STAGE} AS s JOIN {table} AS t ON t.node_id = s.node_id"),
        [],
        |row| row.get(0),
    )?;

    let value_columns = &NODE_COLUMNS[1..];
    let update = format!(
        "UPDATE {table} SET {} FROM {NODE_STAGE} AS s \
         WHERE {table}.node_id = s.node_id AND ({}) RETURNING node_id",
        assignments(value_columns),
        differs(table, value_columns)
    );
    let updated = returned_rows(conn, &update)?;

    let insert = format!(
        "INSERT INTO {table} ({cols}) SELECT {staged} FROM {NODE_STAGE} AS s \
         WHERE NOT EXISTS (SELECT 1 FROM {table} AS t WHERE t.node_id = s.node_id)",
        cols = column_list(NODE_COLUMNS, None),
        staged = column_list(NODE_COLUMNS, Some("s")),
    );
    let inserted = conn.execute(&insert, [])?;

    Ok(ChunkOutcome {
        inserted,
        updated,
        unchanged: matched as usize - updated,
        skipped: 0,
    })
}

pub(super) fn upsert_edges(
    conn: &Connection,
    table: &str,
    endpoints: &Endpoints<'_>,
    records: &[EdgeRecord],
) -> Result<ChunkOutcome> {
    stage(conn, EDGE_STAGE)?;
    for record in records {
        rows::insert_edge(conn, EDGE_STAGE, record)?;
    }
    let skipped = if endpoints.drop_missing {
        let dropped = conn.execute(
            &format!(
                "DELETE FROM {EDGE_STAGE} WHERE \
                 NOT EXISTS (SELECT 1 FROM {src} AS n WHERE n.node_id = {EDGE_STAGE}.src_id) OR \
                 NOT EXISTS (SELECT 1 FROM {dst} AS n WHERE n.node_id = {EDGE_STAGE}.dst_id)",
                src = endpoints.src_table,
                dst = endpoints.dst_table,
            ),
            [],
        )?;
        if dropped > 0 {
            warn!(table, skipped = dropped, "edges with missing endpoints dropped");
        }
        dropped
    } else {
        0
    };
    let matched: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM {EDGE_STAGE} AS s JOIN {table} AS t \
             ON t.src_id = s.src_id AND t.dst_id = s.dst_id"
        ),
        [],
        |row| row.get(0),
    )?;

    let value_columns = &EDGE_COLUMNS[2..];
    let update = format!(
        "UPDATE {table} SET {} FROM {EDGE_STAGE} AS s \
         WHERE {table}.src_id = s.src_id AND {table}.dst_id = s.dst_id AND ({}) \
         RETURNING src_id",
        assignments(value_columns),
        differs(table, value_columns)
    );
    let updated = returned_rows(conn, &update)?;

    let insert = format!(
        "INSERT INTO {table} ({cols}) SELECT {staged} FROM {EDGE_STAGE} AS s \
         WHERE NOT EXISTS (SELECT 1 FROM {table} AS t WHERE t.src_id = s.src_id AND t.dst_id = s.dst_id)",
        cols = column_list(EDGE_COLUMNS, None),
        staged = column_list(EDGE_COLUMNS, Some("s")),
    );
    let inserted = conn.execute(&insert, [])?;

    Ok(ChunkOutcome {
        inserted,
        updated,
        unchanged: matched as usize - updated,
        skipped,
    })
}

fn assignments(columns: &[&str]) -> String {
    columns
        .iter()
        .map(|col| format!("{col} = s.{col}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn returned_rows(conn: &Connection, sql: &str) -> Result<usize> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    let mut count = 0;
    while rows.next()?.is_some() {
        count += 1;
    }
    Ok(count)
}
