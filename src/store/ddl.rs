use rusqlite::Connection;
use tracing::debug;

use crate::error::Result;
use crate::schema::{EdgeType, NodeType, Schema};

pub(crate) const VOIDED_NODES: &str = "_voided_nodes";
pub(crate) const VOIDED_EDGES: &str = "_voided_edges";

/// Creates every table and index the schema needs. Idempotent.
pub(crate) fn create_all(conn: &Connection, schema: &Schema, index_properties: bool) -> Result<()> {
    let mut ddl = String::new();
    for ty in schema.node_types() {
        ddl.push_str(&node_table(ty));
        if index_properties {
            for key in ty.properties().keys() {
                ddl.push_str(&property_index(ty.table(), key));
            }
        }
    }
    for ty in schema.edge_types() {
        ddl.push_str(&edge_table(ty));
        if index_properties {
            for key in ty.properties().keys() {
                ddl.push_str(&property_index(ty.table(), key));
            }
        }
    }
    ddl.push_str(VOIDED_DDL);
    conn.execute_batch(&format!("BEGIN;\n{ddl}COMMIT;"))?;
    debug!(
        node_tables = schema.node_types().count(),
        edge_tables = schema.edge_types().count(),
        index_properties,
        "schema tables ensured"
    );
    Ok(())
}

fn node_table(ty: &NodeType) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            node_id TEXT PRIMARY KEY NOT NULL,
            created TEXT NOT NULL,
            acl TEXT NOT NULL DEFAULT '[]',
            _sysan TEXT NOT NULL DEFAULT '{{}}',
            _props TEXT NOT NULL DEFAULT '{{}}'
        );\n",
        table = ty.table()
    )
}

fn edge_table(ty: &EdgeType) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            src_id TEXT NOT NULL REFERENCES node_{src}(node_id)
                ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
            dst_id TEXT NOT NULL REFERENCES node_{dst}(node_id)
                ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
            created TEXT NOT NULL,
            acl TEXT NOT NULL DEFAULT '[]',
            _sysan TEXT NOT NULL DEFAULT '{{}}',
            _props TEXT NOT NULL DEFAULT '{{}}',
            PRIMARY KEY (src_id, dst_id)
        );
        CREATE INDEX IF NOT EXISTS {table}_dst ON {table} (dst_id);\n",
        table = ty.table(),
        src = ty.src_label(),
        dst = ty.dst_label(),
    )
}

fn property_index(table: &str, key: &str) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {table}__{key} ON {table} ({expr});\n",
        expr = json_path("_props", key)
    )
}

/// Expression reading one key out of a JSON column. Query predicates use
/// the exact same text so SQLite can match the expression indexes.
pub(crate) fn json_path(column: &str, key: &str) -> String {
    format!("json_extract({column}, '$.\"{key}\"')")
}

const VOIDED_DDL: &str = "
CREATE TABLE IF NOT EXISTS _voided_nodes (
    key INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id TEXT NOT NULL,
    label TEXT NOT NULL,
    created TEXT NOT NULL,
    voided TEXT NOT NULL,
    acl TEXT NOT NULL,
    _sysan TEXT NOT NULL,
    _props TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS _voided_nodes_id ON _voided_nodes (node_id, label);
CREATE TABLE IF NOT EXISTS _voided_edges (
    key INTEGER PRIMARY KEY AUTOINCREMENT,
    src_id TEXT NOT NULL,
    dst_id TEXT NOT NULL,
    label TEXT NOT NULL,
    edge_type TEXT NOT NULL,
    created TEXT NOT NULL,
    voided TEXT NOT NULL,
    acl TEXT NOT NULL,
    _sysan TEXT NOT NULL,
    _props TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS _voided_edges_ids ON _voided_edges (src_id, dst_id, label);
";
