//! Typed graph nodes.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use super::props::{Annotations, Properties};
use super::timestamp::{format_ts, parse_ts};
use crate::error::{GraphError, Result};
use crate::schema::{NodeType, Schema};

/// A typed graph node.
///
/// Identity is `(node_id, label)`. The label is fixed when the node is
/// constructed; properties are validated against the node type as they
/// are written.
#[derive(Clone)]
pub struct Node {
    node_id: String,
    ty: Arc<NodeType>,
    acl: Vec<String>,
    acl_dirty: bool,
    created: Option<OffsetDateTime>,
    properties: Properties,
    sysan: Annotations,
    persisted: bool,
}

#[derive(Debug, Deserialize, Serialize)]
struct NodeJson {
    node_id: String,
    label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    acl: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created: Option<String>,
    #[serde(default)]
    properties: Map<String, Value>,
    #[serde(default)]
    system_annotations: Map<String, Value>,
}

impl Node {
    /// Constructs a fresh node of the type registered under `label`.
    pub fn new(schema: &Schema, label: &str, node_id: impl Into<String>) -> Result<Self> {
        let ty = schema.resolve_node(label)?;
        Ok(Self::of_type(ty, node_id))
    }

    /// Constructs a fresh node of an already resolved type.
    pub fn of_type(ty: Arc<NodeType>, node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        let properties = Properties::new(ty.label(), node_id.clone(), ty.property_set());
        Self {
            node_id,
            ty,
            acl: Vec::new(),
            acl_dirty: false,
            created: None,
            properties,
            sysan: Annotations::default(),
            persisted: false,
        }
    }

    pub(crate) fn from_stored(
        ty: Arc<NodeType>,
        node_id: String,
        created: OffsetDateTime,
        acl: Vec<String>,
        sysan: Map<String, Value>,
        props: Map<String, Value>,
    ) -> Self {
        let properties = Properties::loaded(ty.label(), node_id.clone(), ty.property_set(), props);
        Self {
            node_id,
            ty,
            acl,
            acl_dirty: false,
            created: Some(created),
            properties,
            sysan: Annotations::loaded(sysan),
            persisted: true,
        }
    }

    /// Opaque node identifier.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Concrete label.
    pub fn label(&self) -> &str {
        self.ty.label()
    }

    /// Concrete node type.
    pub fn node_type(&self) -> &Arc<NodeType> {
        &self.ty
    }

    /// Access control list.
    pub fn acl(&self) -> &[String] {
        &self.acl
    }

    /// Replaces the access control list.
    pub fn set_acl<I, S>(&mut self, acl: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acl = acl.into_iter().map(Into::into).collect();
        self.acl_dirty = true;
    }

    /// Creation time; `None` until the node is first flushed.
    pub fn created(&self) -> Option<OffsetDateTime> {
        self.created
    }

    /// Declared properties.
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Mutable declared properties.
    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    /// Shorthand for `properties_mut().set(key, value)`.
    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<()> {
        self.properties.set(key, value)
    }

    /// Shorthand for `properties().get(key)`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// System annotations.
    pub fn system_annotations(&self) -> &Annotations {
        &self.sysan
    }

    /// Mutable system annotations.
    pub fn system_annotations_mut(&mut self) -> &mut Annotations {
        &mut self.sysan
    }

    /// `true` when the node was loaded from, or flushed to, the store.
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub(crate) fn acl_dirty(&self) -> bool {
        self.acl_dirty
    }

    /// Serializes identity and state to a JSON document.
    pub fn to_json(&self) -> Result<Value> {
        let doc = NodeJson {
            node_id: self.node_id.clone(),
            label: self.label().to_owned(),
            acl: Some(self.acl.clone()),
            created: self.created.map(format_ts).transpose()?,
            properties: self.properties.to_map(),
            system_annotations: self.sysan.as_map().clone(),
        };
        Ok(serde_json::to_value(doc)?)
    }

    /// Rebuilds a node from [`Node::to_json`] output. Properties are
    /// validated; the result is a fresh, unpersisted node.
    pub fn from_json(schema: &Schema, value: &Value) -> Result<Self> {
        let doc: NodeJson = serde_json::from_value(value.clone())?;
        let mut node = Node::new(schema, &doc.label, doc.node_id)?;
        if let Some(acl) = doc.acl {
            node.set_acl(acl);
        }
        node.created = doc.created.as_deref().map(parse_ts).transpose()?;
        node.properties.update(doc.properties)?;
        node.sysan.update(doc.system_annotations)?;
        Ok(node)
    }

    pub(crate) fn invalid(&self, key: Option<&str>, message: impl Into<String>) -> GraphError {
        GraphError::validation(self.label(), &self.node_id, key, message)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id && self.label() == other.label()
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node_id.hash(state);
        self.label().hash(state);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("label", &self.label())
            .field("node_id", &self.node_id)
            .field("properties", self.properties.explicit())
            .field("persisted", &self.persisted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{NodeTypeDef, PropertyDef};
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn schema() -> Arc<Schema> {
        Schema::builder()
            .node(
                NodeTypeDef::new("file")
                    .property(PropertyDef::string("file_name"))
                    .property(PropertyDef::integer("file_size"))
                    .required(["file_name"]),
            )
            .node(NodeTypeDef::new("case"))
            .build()
            .unwrap()
    }

    #[test]
    fn identity_is_id_plus_label() {
        let schema = schema();
        let mut a = Node::new(&schema, "file", "n1").unwrap();
        let b = Node::new(&schema, "file", "n1").unwrap();
        let c = Node::new(&schema, "case", "n1").unwrap();
        a.set("file_name", "x.txt").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        let set: HashSet<Node> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn unknown_label_fails() {
        let err = Node::new(&schema(), "folder", "n1").unwrap_err();
        assert!(matches!(err, GraphError::UnknownType { kind: "node", .. }));
    }

    #[test]
    fn json_carries_every_declared_key() {
        let schema = schema();
        let mut node = Node::new(&schema, "file", "n1").unwrap();
        node.set("file_name", "x.txt").unwrap();
        node.set_acl(["open"]);
        node.system_annotations_mut().set("source", "import").unwrap();
        let doc = node.to_json().unwrap();
        assert_eq!(doc["label"], json!("file"));
        assert_eq!(doc["acl"], json!(["open"]));
        assert_eq!(
            doc["properties"],
            json!({"file_name": "x.txt", "file_size": null})
        );
        assert_eq!(doc["system_annotations"], json!({"source": "import"}));
        assert!(doc.get("created").is_none());
    }

    #[test]
    fn from_json_validates_properties() {
        let doc = json!({"node_id": "n1", "label": "file", "properties": {"file_size": "big"}});
        assert!(Node::from_json(&schema(), &doc).is_err());
        let doc = json!({"node_id": "n1", "label": "file", "properties": {"bogus": 1}});
        assert!(Node::from_json(&schema(), &doc).is_err());
    }

    #[test]
    fn acl_from_json_counts_as_a_change() {
        let doc = json!({"node_id": "n1", "label": "file", "acl": ["new"]});
        let node = Node::from_json(&schema(), &doc).unwrap();
        assert!(node.acl_dirty());
        assert_eq!(node.acl(), ["new"]);

        let doc = json!({"node_id": "n1", "label": "file"});
        assert!(!Node::from_json(&schema(), &doc).unwrap().acl_dirty());
    }

    proptest! {
        #[test]
        fn prop_json_roundtrip(
            id in "[a-z0-9-]{1,16}",
            name in proptest::option::of("[ -~]{0,20}"),
            size in proptest::option::of(any::<i64>()),
            acl in prop::collection::vec("[a-z]{1,6}", 0..4),
            sysan in prop::collection::btree_map("[a-z_]{1,8}", any::<i32>(), 0..4),
        ) {
            let schema = schema();
            let mut node = Node::new(&schema, "file", id).unwrap();
            node.set("file_name", &name).unwrap();
            node.set("file_size", &size).unwrap();
            node.set_acl(acl);
            node.system_annotations_mut().update(sysan).unwrap();

            let back = Node::from_json(&schema, &node.to_json().unwrap()).unwrap();
            prop_assert_eq!(&back, &node);
            prop_assert_eq!(back.label(), node.label());
            prop_assert_eq!(back.acl(), node.acl());
            prop_assert_eq!(back.properties().to_map(), node.properties().to_map());
            prop_assert_eq!(back.system_annotations().as_map(), node.system_annotations().as_map());
        }
    }
}
