//! History records written before an update or delete.

use serde::Serialize;
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// Immutable snapshot of a node, written just before it was updated or
/// deleted.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VoidedNode {
    /// Monotonic row key; later snapshots have larger keys.
    pub key: i64,
    /// Id of the node the snapshot belongs to.
    pub node_id: String,
    /// Node label.
    pub label: String,
    /// Creation time of the live node.
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    /// Time the snapshot was taken.
    #[serde(with = "time::serde::rfc3339")]
    pub voided: OffsetDateTime,
    /// Access control list at snapshot time.
    pub acl: Vec<String>,
    /// System annotations at snapshot time.
    pub system_annotations: Map<String, Value>,
    /// Properties at snapshot time.
    pub properties: Map<String, Value>,
}

/// Immutable snapshot of an edge, written just before it was updated or
/// deleted.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VoidedEdge {
    /// Monotonic row key; later snapshots have larger keys.
    pub key: i64,
    /// Source node id.
    pub src_id: String,
    /// Destination node id.
    pub dst_id: String,
    /// Edge label.
    pub label: String,
    /// Concrete edge type name.
    pub edge_type: String,
    /// Creation time of the live edge.
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    /// Time the snapshot was taken.
    #[serde(with = "time::serde::rfc3339")]
    pub voided: OffsetDateTime,
    /// Access control list at snapshot time.
    pub acl: Vec<String>,
    /// System annotations at snapshot time.
    pub system_annotations: Map<String, Value>,
    /// Properties at snapshot time.
    pub properties: Map<String, Value>,
}

impl VoidedNode {
    /// Reads a snapshotted property.
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }
}

impl VoidedEdge {
    /// Reads a snapshotted property.
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }
}
