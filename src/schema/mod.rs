//! Label to concrete type registry.
//!
//! Every concrete node and edge type is registered once, up front, through
//! [`SchemaBuilder`] or a [`Dictionary`]. The resulting [`Schema`] is
//! immutable and shared behind an `Arc`, so concurrent readers need no
//! synchronization. All lookups are precomputed map hits.

mod dictionary;
mod property;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tracing::info;

use crate::error::{GraphError, Result};

pub use dictionary::{Dictionary, LinkDefinition, NodeDefinition, PropertySpec, TypeSpec};
pub use property::{PropertyDef, PropertyKind, PropertySet};

const MAX_IDENT_LEN: usize = 48;

/// A concrete node type, backed by its own table.
#[derive(Debug)]
pub struct NodeType {
    label: String,
    table: String,
    properties: Arc<PropertySet>,
}

impl NodeType {
    /// Label stored with every node of this type.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Backing table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Declared properties.
    pub fn properties(&self) -> &PropertySet {
        &self.properties
    }

    pub(crate) fn property_set(&self) -> Arc<PropertySet> {
        self.properties.clone()
    }
}

/// A concrete edge type: one ordered `(src_label, label, dst_label)` tuple.
#[derive(Debug)]
pub struct EdgeType {
    name: String,
    label: String,
    src_label: String,
    dst_label: String,
    src_dst_assoc: String,
    dst_src_assoc: String,
    table: String,
    properties: Arc<PropertySet>,
}

impl EdgeType {
    /// Unique type name, `<src>_<label>_<dst>`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Edge label; may be shared by several edge types.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Label of the source node type.
    pub fn src_label(&self) -> &str {
        &self.src_label
    }

    /// Label of the destination node type.
    pub fn dst_label(&self) -> &str {
        &self.dst_label
    }

    /// Association name that reaches the destination from the source.
    pub fn src_dst_assoc(&self) -> &str {
        &self.src_dst_assoc
    }

    /// Association name that reaches the source from the destination.
    pub fn dst_src_assoc(&self) -> &str {
        &self.dst_src_assoc
    }

    /// Backing table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Declared properties.
    pub fn properties(&self) -> &PropertySet {
        &self.properties
    }

    pub(crate) fn property_set(&self) -> Arc<PropertySet> {
        self.properties.clone()
    }
}

/// Which end of an edge a node sits on.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EdgeSide {
    /// The node is the edge source.
    Source,
    /// The node is the edge destination.
    Destination,
}

/// A named way to reach neighbors from one node type.
#[derive(Clone, Debug)]
pub struct Association {
    /// Association name (a dictionary link `name` or `backref`).
    pub name: String,
    /// Edge type walked by the association.
    pub edge_type: Arc<EdgeType>,
    /// Side the owning node occupies on that edge type.
    pub side: EdgeSide,
}

impl Association {
    /// Label of the nodes the association reaches.
    pub fn target_label(&self) -> &str {
        match self.side {
            EdgeSide::Source => self.edge_type.dst_label(),
            EdgeSide::Destination => self.edge_type.src_label(),
        }
    }
}

/// An edge type connecting two labels, seen from the caller's first label.
#[derive(Clone, Debug)]
pub struct EndpointBinding {
    /// Matching edge type.
    pub edge_type: Arc<EdgeType>,
    /// `true` when the caller's first label is the edge destination.
    pub reversed: bool,
}

impl EndpointBinding {
    /// Association name on the caller's first node reaching the second.
    pub fn assoc_from_first(&self) -> &str {
        if self.reversed {
            self.edge_type.dst_src_assoc()
        } else {
            self.edge_type.src_dst_assoc()
        }
    }

    /// Association name on the caller's second node reaching the first.
    pub fn assoc_from_second(&self) -> &str {
        if self.reversed {
            self.edge_type.src_dst_assoc()
        } else {
            self.edge_type.dst_src_assoc()
        }
    }
}

/// Immutable registry of every declared node and edge type.
#[derive(Debug, Default)]
pub struct Schema {
    nodes: BTreeMap<String, Arc<NodeType>>,
    edges: Vec<Arc<EdgeType>>,
    edges_by_name: HashMap<String, Arc<EdgeType>>,
    edges_by_label: HashMap<String, Vec<Arc<EdgeType>>>,
    edges_by_endpoints: HashMap<(String, String), Vec<Arc<EdgeType>>>,
    associations: HashMap<String, Vec<Association>>,
}

impl Schema {
    /// Starts a new registry definition.
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Builds a registry from an external dictionary.
    pub fn from_dictionary(dictionary: &Dictionary) -> Result<Arc<Self>> {
        dictionary.to_builder()?.build()
    }

    /// Every concrete node type, ordered by label.
    pub fn node_types(&self) -> impl Iterator<Item = &Arc<NodeType>> {
        self.nodes.values()
    }

    /// Every concrete edge type in registration order.
    pub fn edge_types(&self) -> impl Iterator<Item = &Arc<EdgeType>> {
        self.edges.iter()
    }

    /// Looks up an edge type by its unique name.
    pub fn edge_type(&self, name: &str) -> Result<Arc<EdgeType>> {
        self.edges_by_name
            .get(name)
            .cloned()
            .ok_or_else(|| GraphError::UnknownType {
                kind: "edge",
                label: name.to_owned(),
            })
    }

    /// Resolves a node label to its concrete type.
    pub fn resolve_node(&self, label: &str) -> Result<Arc<NodeType>> {
        self.nodes
            .get(label)
            .cloned()
            .ok_or_else(|| GraphError::UnknownType {
                kind: "node",
                label: label.to_owned(),
            })
    }

    /// Resolves an edge label that is carried by exactly one edge type.
    pub fn resolve_edge(&self, label: &str) -> Result<Arc<EdgeType>> {
        let candidates = self.edges_by_label.get(label).map(Vec::as_slice).unwrap_or(&[]);
        match candidates {
            [] => Err(GraphError::UnknownType {
                kind: "edge",
                label: label.to_owned(),
            }),
            [only] => Ok(only.clone()),
            many => Err(GraphError::AmbiguousEdge {
                label: label.to_owned(),
                candidates: many.iter().map(|ty| ty.name.clone()).collect(),
            }),
        }
    }

    /// Resolves an edge label scoped to an endpoint label pair.
    pub fn resolve_edge_between(
        &self,
        src_label: &str,
        label: &str,
        dst_label: &str,
    ) -> Result<Arc<EdgeType>> {
        let matches: Vec<&Arc<EdgeType>> = self
            .edges_by_label
            .get(label)
            .into_iter()
            .flatten()
            .filter(|ty| ty.src_label == src_label && ty.dst_label == dst_label)
            .collect();
        match matches.as_slice() {
            [] => Err(GraphError::UnknownType {
                kind: "edge",
                label: format!("{src_label} -[{label}]-> {dst_label}"),
            }),
            [only] => Ok((*only).clone()),
            many => Err(GraphError::AmbiguousEdge {
                label: label.to_owned(),
                candidates: many.iter().map(|ty| ty.name.clone()).collect(),
            }),
        }
    }

    /// Lists every edge type connecting `first` and `second`, in either
    /// direction. Each binding records which side `first` is on.
    pub fn resolve_edge_by_endpoints(&self, first: &str, second: &str) -> Vec<EndpointBinding> {
        let forward = self
            .edges_by_endpoints
            .get(&(first.to_owned(), second.to_owned()))
            .into_iter()
            .flatten()
            .map(|ty| EndpointBinding {
                edge_type: ty.clone(),
                reversed: false,
            });
        let backward = (first != second)
            .then(|| {
                self.edges_by_endpoints
                    .get(&(second.to_owned(), first.to_owned()))
            })
            .flatten()
            .into_iter()
            .flatten()
            .map(|ty| EndpointBinding {
                edge_type: ty.clone(),
                reversed: true,
            });
        forward.chain(backward).collect()
    }

    /// Associations available on nodes of `label`.
    pub fn associations(&self, label: &str) -> &[Association] {
        self.associations
            .get(label)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Looks up one association by name.
    pub fn association(&self, label: &str, name: &str) -> Result<&Association> {
        self.associations(label)
            .iter()
            .find(|assoc| assoc.name == name)
            .ok_or_else(|| GraphError::UnknownType {
                kind: "association",
                label: format!("{label}.{name}"),
            })
    }

    /// Edge types with `label` on either end, paired with the side it occupies.
    /// Self-loop types appear once per side.
    pub fn edges_touching(&self, label: &str) -> Vec<(Arc<EdgeType>, EdgeSide)> {
        let mut out = Vec::new();
        for ty in &self.edges {
            if ty.src_label == label {
                out.push((ty.clone(), EdgeSide::Source));
            }
            if ty.dst_label == label {
                out.push((ty.clone(), EdgeSide::Destination));
            }
        }
        out
    }
}

/// Node type declaration consumed by [`SchemaBuilder`].
#[derive(Clone, Debug)]
pub struct NodeTypeDef {
    label: String,
    properties: Vec<PropertyDef>,
    required: BTreeSet<String>,
}

impl NodeTypeDef {
    /// Declares a node type with no properties.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            properties: Vec::new(),
            required: BTreeSet::new(),
        }
    }

    /// Adds a declared property.
    pub fn property(mut self, def: PropertyDef) -> Self {
        self.properties.push(def);
        self
    }

    /// Marks declared keys as required.
    pub fn required<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required.extend(keys.into_iter().map(Into::into));
        self
    }
}

/// Edge type declaration consumed by [`SchemaBuilder`].
#[derive(Clone, Debug)]
pub struct EdgeTypeDef {
    src_label: String,
    label: String,
    dst_label: String,
    src_dst_assoc: Option<String>,
    dst_src_assoc: Option<String>,
    properties: Vec<PropertyDef>,
    required: BTreeSet<String>,
}

impl EdgeTypeDef {
    /// Declares an edge type `src -[label]-> dst`.
    pub fn new(
        src_label: impl Into<String>,
        label: impl Into<String>,
        dst_label: impl Into<String>,
    ) -> Self {
        Self {
            src_label: src_label.into(),
            label: label.into(),
            dst_label: dst_label.into(),
            src_dst_assoc: None,
            dst_src_assoc: None,
            properties: Vec::new(),
            required: BTreeSet::new(),
        }
    }

    /// Names the associations reaching dst from src and src from dst.
    pub fn associations(mut self, src_dst: impl Into<String>, dst_src: impl Into<String>) -> Self {
        self.src_dst_assoc = Some(src_dst.into());
        self.dst_src_assoc = Some(dst_src.into());
        self
    }

    /// Adds a declared property.
    pub fn property(mut self, def: PropertyDef) -> Self {
        self.properties.push(def);
        self
    }

    /// Marks declared keys as required.
    pub fn required<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required.extend(keys.into_iter().map(Into::into));
        self
    }
}

/// Collects declarations and freezes them into a [`Schema`].
#[derive(Clone, Debug, Default)]
pub struct SchemaBuilder {
    nodes: Vec<NodeTypeDef>,
    edges: Vec<EdgeTypeDef>,
}

impl SchemaBuilder {
    /// Registers a node type.
    pub fn node(mut self, def: NodeTypeDef) -> Self {
        self.nodes.push(def);
        self
    }

    /// Registers an edge type.
    pub fn edge(mut self, def: EdgeTypeDef) -> Self {
        self.edges.push(def);
        self
    }

    /// Validates every declaration and builds the lookup tables.
    pub fn build(self) -> Result<Arc<Schema>> {
        let mut schema = Schema::default();
        let mut tables = HashSet::new();

        for def in self.nodes {
            check_ident("node label", &def.label)?;
            let properties = build_properties(&def.label, def.properties, def.required)?;
            let table = format!("node_{}", def.label);
            if !tables.insert(table.clone()) {
                return Err(GraphError::Schema(format!(
                    "node type '{}' declared twice",
                    def.label
                )));
            }
            let ty = NodeType {
                label: def.label.clone(),
                table,
                properties,
            };
            schema.nodes.insert(def.label, Arc::new(ty));
        }

        for def in self.edges {
            check_ident("edge label", &def.label)?;
            for endpoint in [&def.src_label, &def.dst_label] {
                if !schema.nodes.contains_key(endpoint) {
                    return Err(GraphError::Schema(format!(
                        "edge '{}' references undeclared node type '{endpoint}'",
                        def.label
                    )));
                }
            }
            let name = format!("{}_{}_{}", def.src_label, def.label, def.dst_label);
            let table = format!("edge_{name}");
            if !tables.insert(table.clone()) {
                return Err(GraphError::Schema(format!(
                    "edge type '{name}' collides with an existing table"
                )));
            }
            let src_dst_assoc = def
                .src_dst_assoc
                .unwrap_or_else(|| format!("{}_{}", def.label, def.dst_label));
            let dst_src_assoc = def
                .dst_src_assoc
                .unwrap_or_else(|| format!("{}_{}_of", def.src_label, def.label));
            check_ident("association", &src_dst_assoc)?;
            check_ident("association", &dst_src_assoc)?;
            let properties = build_properties(&name, def.properties, def.required)?;
            let ty = Arc::new(EdgeType {
                name: name.clone(),
                label: def.label,
                src_label: def.src_label,
                dst_label: def.dst_label,
                src_dst_assoc,
                dst_src_assoc,
                table,
                properties,
            });
            schema.register_edge(ty)?;
        }

        info!(
            node_types = schema.nodes.len(),
            edge_types = schema.edges.len(),
            "schema registry built"
        );
        Ok(Arc::new(schema))
    }
}

impl Schema {
    fn register_edge(&mut self, ty: Arc<EdgeType>) -> Result<()> {
        let sides = [
            (ty.src_label.clone(), ty.src_dst_assoc.clone(), EdgeSide::Source),
            (ty.dst_label.clone(), ty.dst_src_assoc.clone(), EdgeSide::Destination),
        ];
        for (label, name, side) in sides {
            let assocs = self.associations.entry(label.clone()).or_default();
            if assocs.iter().any(|existing| existing.name == name) {
                return Err(GraphError::Schema(format!(
                    "association '{name}' declared twice on '{label}'"
                )));
            }
            assocs.push(Association {
                name,
                edge_type: ty.clone(),
                side,
            });
        }
        self.edges_by_name.insert(ty.name.clone(), ty.clone());
        self.edges_by_label
            .entry(ty.label.clone())
            .or_default()
            .push(ty.clone());
        self.edges_by_endpoints
            .entry((ty.src_label.clone(), ty.dst_label.clone()))
            .or_default()
            .push(ty.clone());
        self.edges.push(ty);
        Ok(())
    }
}

fn build_properties(
    owner: &str,
    defs: Vec<PropertyDef>,
    required: BTreeSet<String>,
) -> Result<Arc<PropertySet>> {
    for def in &defs {
        check_ident("property key", &def.name)?;
    }
    PropertySet::new(defs, required)
        .map(Arc::new)
        .map_err(|msg| GraphError::Schema(format!("{owner}: {msg}")))
}

/// Labels, associations and keys become SQL identifiers and JSON paths.
pub(crate) fn check_ident(what: &str, ident: &str) -> Result<()> {
    let mut chars = ident.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && ident.len() <= MAX_IDENT_LEN;
    if valid {
        Ok(())
    } else {
        Err(GraphError::Schema(format!(
            "{what} '{ident}' must match [a-z][a-z0-9_]* (max {MAX_IDENT_LEN} chars)"
        )))
    }
}
