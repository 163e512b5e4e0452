use std::collections::{BTreeSet, HashMap};

use serde_json::Value;

/// Declared value shape of a property.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyKind {
    /// Any sanitized value.
    Any,
    /// JSON string.
    String,
    /// Whole number.
    Integer,
    /// Integer or floating point number.
    Number,
    /// `true` / `false`.
    Boolean,
    /// List of scalars.
    Array,
    /// Nested scalar map.
    Object,
    /// Closed set of allowed values.
    Enum(Vec<Value>),
    /// Value matching any of the listed kinds.
    OneOf(Vec<PropertyKind>),
}

impl PropertyKind {
    /// Returns `true` when `value` (never null here) has this kind.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            PropertyKind::Any => true,
            PropertyKind::String => value.is_string(),
            PropertyKind::Integer => value.is_i64() || value.is_u64(),
            PropertyKind::Number => value.is_number(),
            PropertyKind::Boolean => value.is_boolean(),
            PropertyKind::Array => value.is_array(),
            PropertyKind::Object => value.is_object(),
            PropertyKind::Enum(allowed) => allowed.contains(value),
            PropertyKind::OneOf(kinds) => kinds.iter().any(|kind| kind.accepts(value)),
        }
    }

    /// Parses a dictionary type name (`string`, `integer`, ...).
    pub fn from_type_name(name: &str) -> Option<Self> {
        Some(match name {
            "string" => PropertyKind::String,
            "integer" => PropertyKind::Integer,
            "number" => PropertyKind::Number,
            "boolean" => PropertyKind::Boolean,
            "array" => PropertyKind::Array,
            "object" => PropertyKind::Object,
            "any" => PropertyKind::Any,
            _ => return None,
        })
    }

    fn describe(&self) -> String {
        match self {
            PropertyKind::Any => "any".into(),
            PropertyKind::String => "string".into(),
            PropertyKind::Integer => "integer".into(),
            PropertyKind::Number => "number".into(),
            PropertyKind::Boolean => "boolean".into(),
            PropertyKind::Array => "array".into(),
            PropertyKind::Object => "object".into(),
            PropertyKind::Enum(values) => format!("one of {values:?}"),
            PropertyKind::OneOf(kinds) => kinds
                .iter()
                .map(PropertyKind::describe)
                .collect::<Vec<_>>()
                .join(" | "),
        }
    }
}

/// A single declared property.
#[derive(Clone, Debug, PartialEq)]
pub struct PropertyDef {
    /// Property key.
    pub name: String,
    /// Declared shape.
    pub kind: PropertyKind,
}

impl PropertyDef {
    /// Declares `name` with the given kind.
    pub fn new(name: impl Into<String>, kind: PropertyKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    /// Declares a string property.
    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, PropertyKind::String)
    }

    /// Declares an integer property.
    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, PropertyKind::Integer)
    }

    /// Declares a boolean property.
    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, PropertyKind::Boolean)
    }

    /// Declares an enum property restricted to `values`.
    pub fn enumeration<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values = values
            .into_iter()
            .map(|v| Value::String(v.into()))
            .collect();
        Self::new(name, PropertyKind::Enum(values))
    }

    /// Checks a candidate value. Null is always writable; required-ness is
    /// enforced when the owning entity is flushed.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        if value.is_null() || self.kind.accepts(value) {
            Ok(())
        } else {
            Err(format!("expected {}, got {value}", self.kind.describe()))
        }
    }
}

/// Ordered set of declared properties plus the required subset.
#[derive(Clone, Debug, Default)]
pub struct PropertySet {
    defs: Vec<PropertyDef>,
    index: HashMap<String, usize>,
    required: BTreeSet<String>,
}

impl PropertySet {
    pub(crate) fn new(defs: Vec<PropertyDef>, required: BTreeSet<String>) -> Result<Self, String> {
        let mut index = HashMap::with_capacity(defs.len());
        for (pos, def) in defs.iter().enumerate() {
            if index.insert(def.name.clone(), pos).is_some() {
                return Err(format!("property '{}' declared twice", def.name));
            }
        }
        if let Some(missing) = required.iter().find(|key| !index.contains_key(*key)) {
            return Err(format!("required property '{missing}' is not declared"));
        }
        Ok(Self {
            defs,
            index,
            required,
        })
    }

    /// Declared keys in declaration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.defs.iter().map(|def| def.name.as_str())
    }

    /// Declared definitions in declaration order.
    pub fn defs(&self) -> &[PropertyDef] {
        &self.defs
    }

    /// Looks up a declared key.
    pub fn get(&self, key: &str) -> Option<&PropertyDef> {
        self.index.get(key).map(|&pos| &self.defs[pos])
    }

    /// Returns `true` when `key` is declared.
    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Keys that must be non-null when flushed.
    pub fn required(&self) -> &BTreeSet<String> {
        &self.required
    }

    /// Number of declared keys.
    pub fn len(&self) -> usize {
        self.defs.len()
    }

    /// Returns `true` when nothing is declared.
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}
