use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EdgeTypeDef, NodeTypeDef, PropertyDef, PropertyKind, Schema, SchemaBuilder};
use crate::error::{GraphError, Result};

/// Externally supplied schema definition, keyed by node label.
///
/// ```json
/// {
///   "file": {
///     "properties": { "file_name": {"type": "string"}, "state": {"enum": ["live", "redacted"]} },
///     "required": ["file_name"],
///     "links": [{ "name": "aliquots", "backref": "files", "label": "derived_from", "target_type": "aliquot" }]
///   },
///   "aliquot": {}
/// }
/// ```
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Dictionary {
    /// Node definitions keyed by label.
    pub nodes: BTreeMap<String, NodeDefinition>,
}

/// One node entry of a [`Dictionary`].
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct NodeDefinition {
    /// Declared properties.
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySpec>,
    /// Keys that must be non-null.
    #[serde(default)]
    pub required: Vec<String>,
    /// Outgoing edges from this node type.
    #[serde(default)]
    pub links: Vec<LinkDefinition>,
}

/// Outgoing link of a node definition; declares one edge type.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LinkDefinition {
    /// Association on the owning node reaching the target.
    pub name: String,
    /// Association on the target reaching the owning node.
    pub backref: String,
    /// Edge label.
    pub label: String,
    /// Target node label.
    pub target_type: String,
    /// Declared edge properties.
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySpec>,
    /// Required edge properties.
    #[serde(default)]
    pub required: Vec<String>,
}

/// Declared shape of one property.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PropertySpec {
    /// A type name or list of type names (`"null"` allowed in the list).
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub ty: Option<TypeSpec>,
    /// Closed set of allowed values.
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<Value>>,
}

/// Either one type name or several.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TypeSpec {
    /// Single type name.
    One(String),
    /// Union of type names.
    Many(Vec<String>),
}

impl Dictionary {
    /// Parses a JSON dictionary.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Reads and parses a JSON dictionary file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Builds the registry for this dictionary.
    pub fn into_schema(self) -> Result<Arc<Schema>> {
        Schema::from_dictionary(&self)
    }

    pub(crate) fn to_builder(&self) -> Result<SchemaBuilder> {
        let mut builder = Schema::builder();
        for (label, def) in &self.nodes {
            let mut node = NodeTypeDef::new(label.clone()).required(def.required.iter().cloned());
            for (key, spec) in &def.properties {
                node = node.property(spec.to_def(label, key)?);
            }
            builder = builder.node(node);
        }
        for (label, def) in &self.nodes {
            for link in &def.links {
                let mut edge = EdgeTypeDef::new(label.clone(), link.label.clone(), link.target_type.clone())
                    .associations(link.name.clone(), link.backref.clone())
                    .required(link.required.iter().cloned());
                for (key, spec) in &link.properties {
                    edge = edge.property(spec.to_def(&link.label, key)?);
                }
                builder = builder.edge(edge);
            }
        }
        Ok(builder)
    }
}

impl PropertySpec {
    fn to_def(&self, owner: &str, key: &str) -> Result<PropertyDef> {
        if let Some(values) = &self.values {
            return Ok(PropertyDef::new(key, PropertyKind::Enum(values.clone())));
        }
        let names: Vec<&str> = match &self.ty {
            None => return Ok(PropertyDef::new(key, PropertyKind::Any)),
            Some(TypeSpec::One(name)) => vec![name.as_str()],
            Some(TypeSpec::Many(names)) => names.iter().map(String::as_str).collect(),
        };
        let mut kinds = Vec::with_capacity(names.len());
        for name in names.into_iter().filter(|name| *name != "null") {
            let kind = PropertyKind::from_type_name(name).ok_or_else(|| {
                GraphError::Schema(format!("{owner}.{key}: unknown property type '{name}'"))
            })?;
            kinds.push(kind);
        }
        let kind = match kinds.len() {
            0 => PropertyKind::Any,
            1 => kinds.remove(0),
            _ => PropertyKind::OneOf(kinds),
        };
        Ok(PropertyDef::new(key, kind))
    }
}
