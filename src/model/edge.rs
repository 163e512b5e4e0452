//! Typed edges between two stored nodes.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use super::node::Node;
use super::props::{Annotations, Properties};
use super::timestamp::{format_ts, parse_ts};
use crate::error::{GraphError, Result};
use crate::schema::{EdgeType, Schema};

/// A typed, directed edge between two nodes.
///
/// Identity is `(src_id, dst_id, type)`; each edge type binds one ordered
/// `(src_label, label, dst_label)` tuple.
#[derive(Clone)]
pub struct Edge {
    src_id: String,
    dst_id: String,
    ty: Arc<EdgeType>,
    acl: Vec<String>,
    acl_dirty: bool,
    created: Option<OffsetDateTime>,
    properties: Properties,
    sysan: Annotations,
    persisted: bool,
}

#[derive(Debug, Deserialize, Serialize)]
struct EdgeJson {
    src_id: String,
    dst_id: String,
    label: String,
    src_label: String,
    dst_label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    acl: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created: Option<String>,
    #[serde(default)]
    properties: Map<String, Value>,
    #[serde(default)]
    system_annotations: Map<String, Value>,
}

impl Edge {
    /// Constructs an edge from a label carried by exactly one edge type.
    pub fn new(
        schema: &Schema,
        src_id: impl Into<String>,
        dst_id: impl Into<String>,
        label: &str,
    ) -> Result<Self> {
        let ty = schema.resolve_edge(label)?;
        Ok(Self::of_type(ty, src_id, dst_id))
    }

    /// Constructs an edge whose type is pinned by both endpoint labels.
    pub fn between(
        schema: &Schema,
        src_label: &str,
        src_id: impl Into<String>,
        label: &str,
        dst_label: &str,
        dst_id: impl Into<String>,
    ) -> Result<Self> {
        let ty = schema.resolve_edge_between(src_label, label, dst_label)?;
        Ok(Self::of_type(ty, src_id, dst_id))
    }

    /// Connects two typed nodes. The edge type is found from the node
    /// labels, in either direction; `label` is required when more than one
    /// edge type joins the pair.
    pub fn connect(schema: &Schema, a: &Node, b: &Node, label: Option<&str>) -> Result<Self> {
        let bindings: Vec<_> = schema
            .resolve_edge_by_endpoints(a.label(), b.label())
            .into_iter()
            .filter(|binding| label.map_or(true, |l| binding.edge_type.label() == l))
            .collect();
        let binding = match bindings.as_slice() {
            [only] => only,
            [] => {
                return Err(GraphError::UnknownType {
                    kind: "edge",
                    label: format!("{} <-[{}]-> {}", a.label(), label.unwrap_or("*"), b.label()),
                })
            }
            many => {
                return Err(GraphError::AmbiguousEdge {
                    label: label.unwrap_or("*").to_owned(),
                    candidates: many
                        .iter()
                        .map(|binding| binding.edge_type.name().to_owned())
                        .collect(),
                })
            }
        };
        let (src, dst) = if binding.reversed { (b, a) } else { (a, b) };
        Ok(Self::of_type(
            binding.edge_type.clone(),
            src.node_id(),
            dst.node_id(),
        ))
    }

    /// Constructs a fresh edge of an already resolved type.
    pub fn of_type(ty: Arc<EdgeType>, src_id: impl Into<String>, dst_id: impl Into<String>) -> Self {
        let src_id = src_id.into();
        let dst_id = dst_id.into();
        let properties = Properties::new(ty.name(), format!("{src_id}->{dst_id}"), ty.property_set());
        Self {
            src_id,
            dst_id,
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
        ty: Arc<EdgeType>,
        src_id: String,
        dst_id: String,
        created: OffsetDateTime,
        acl: Vec<String>,
        sysan: Map<String, Value>,
        props: Map<String, Value>,
    ) -> Self {
        let properties = Properties::loaded(
            ty.name(),
            format!("{src_id}->{dst_id}"),
            ty.property_set(),
            props,
        );
        Self {
            src_id,
            dst_id,
            ty,
            acl,
            acl_dirty: false,
            created: Some(created),
            properties,
            sysan: Annotations::loaded(sysan),
            persisted: true,
        }
    }

    /// Source node id.
    pub fn src_id(&self) -> &str {
        &self.src_id
    }

    /// Destination node id.
    pub fn dst_id(&self) -> &str {
        &self.dst_id
    }

    /// Edge label.
    pub fn label(&self) -> &str {
        self.ty.label()
    }

    /// Concrete edge type.
    pub fn edge_type(&self) -> &Arc<EdgeType> {
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

    /// Creation time; `None` until the edge is first flushed.
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

    /// `true` when the edge was loaded from, or flushed to, the store.
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub(crate) fn acl_dirty(&self) -> bool {
        self.acl_dirty
    }

    /// Serializes identity and state to a JSON document.
    pub fn to_json(&self) -> Result<Value> {
        let doc = EdgeJson {
            src_id: self.src_id.clone(),
            dst_id: self.dst_id.clone(),
            label: self.label().to_owned(),
            src_label: self.ty.src_label().to_owned(),
            dst_label: self.ty.dst_label().to_owned(),
            acl: Some(self.acl.clone()),
            created: self.created.map(format_ts).transpose()?,
            properties: self.properties.to_map(),
            system_annotations: self.sysan.as_map().clone(),
        };
        Ok(serde_json::to_value(doc)?)
    }

    /// Rebuilds an edge from [`Edge::to_json`] output.
    pub fn from_json(schema: &Schema, value: &Value) -> Result<Self> {
        let doc: EdgeJson = serde_json::from_value(value.clone())?;
        let mut edge = Edge::between(
            schema,
            &doc.src_label,
            doc.src_id,
            &doc.label,
            &doc.dst_label,
            doc.dst_id,
        )?;
        if let Some(acl) = doc.acl {
            edge.set_acl(acl);
        }
        edge.created = doc.created.as_deref().map(parse_ts).transpose()?;
        edge.properties.update(doc.properties)?;
        edge.sysan.update(doc.system_annotations)?;
        Ok(edge)
    }

    pub(crate) fn display_id(&self) -> String {
        format!("{}->{}", self.src_id, self.dst_id)
    }

    pub(crate) fn invalid(&self, key: Option<&str>, message: impl Into<String>) -> GraphError {
        GraphError::validation(self.ty.name(), self.display_id(), key, message)
    }
}

impl PartialEq for Edge {
    fn eq(&self, other: &Self) -> bool {
        self.src_id == other.src_id
            && self.dst_id == other.dst_id
            && self.ty.name() == other.ty.name()
    }
}

impl Eq for Edge {}

impl Hash for Edge {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.src_id.hash(state);
        self.dst_id.hash(state);
        self.ty.name().hash(state);
    }
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Edge")
            .field("type", &self.ty.name())
            .field("src_id", &self.src_id)
            .field("dst_id", &self.dst_id)
            .field("properties", self.properties.explicit())
            .finish()
    }
}
