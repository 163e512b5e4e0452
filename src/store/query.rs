//! Declarative node/edge filters compiled to SQL over one concrete table.

use std::sync::Arc;

use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use super::ddl::json_path;
use crate::error::{GraphError, Result};
use crate::sanitize::is_safe_key;
use crate::schema::{EdgeType, NodeType, PropertySet, Schema};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JsonColumn {
    Props,
    Sysan,
}

impl JsonColumn {
    fn name(self) -> &'static str {
        match self {
            JsonColumn::Props => "_props",
            JsonColumn::Sysan => "_sysan",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
struct JsonEq {
    column: JsonColumn,
    key: String,
    value: Value,
}

/// Accumulated `WHERE` clauses and their positional parameters.
#[derive(Debug, Default)]
pub(crate) struct SqlFilter {
    clauses: Vec<String>,
    pub params: Vec<SqlValue>,
}

impl SqlFilter {
    fn push(&mut self, clause: String, params: impl IntoIterator<Item = SqlValue>) {
        self.clauses.push(clause);
        self.params.extend(params);
    }

    fn push_in(&mut self, column: &str, ids: &[String]) {
        if ids.is_empty() {
            self.clauses.push("0".to_owned());
            return;
        }
        let marks = vec!["?"; ids.len()].join(", ");
        self.push(
            format!("{column} IN ({marks})"),
            ids.iter().cloned().map(SqlValue::Text),
        );
    }

    fn push_json_eq(&mut self, alias: Option<&str>, filter: &JsonEq) {
        let column = match alias {
            Some(alias) => format!("{alias}.{}", filter.column.name()),
            None => filter.column.name().to_owned(),
        };
        let expr = json_path(&column, &filter.key);
        match &filter.value {
            Value::Null => self.clauses.push(format!("{expr} IS NULL")),
            Value::Bool(flag) => self.push(format!("{expr} = ?"), [SqlValue::Integer(i64::from(*flag))]),
            Value::Number(num) => {
                let bound = match num.as_i64() {
                    Some(int) => SqlValue::Integer(int),
                    None => SqlValue::Real(num.as_f64().unwrap_or(f64::NAN)),
                };
                self.push(format!("{expr} = ?"), [bound]);
            }
            Value::String(text) => self.push(format!("{expr} = ?"), [SqlValue::Text(text.clone())]),
            nested => self.push(format!("{expr} = json(?)"), [SqlValue::Text(nested.to_string())]),
        }
    }

    /// ` WHERE a AND b`, or an empty string.
    pub fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    pub fn is_unsatisfiable(&self) -> bool {
        self.clauses.iter().any(|clause| clause == "0")
    }
}

fn check_filters(filters: &[JsonEq], decl: &PropertySet, entity: &str) -> Result<bool> {
    for filter in filters {
        match filter.column {
            JsonColumn::Props if !decl.contains(&filter.key) => return Ok(false),
            JsonColumn::Sysan if !is_safe_key(&filter.key) => {
                return Err(GraphError::InvalidArgument(format!(
                    "{entity}: unsupported annotation key {:?}",
                    filter.key
                )))
            }
            _ => {}
        }
    }
    Ok(true)
}

/// Filter over nodes of one label, or of every label.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeQuery {
    label: Option<String>,
    ids: Option<Vec<String>>,
    filters: Vec<JsonEq>,
    after: Option<String>,
    limit: Option<usize>,
}

impl NodeQuery {
    /// Nodes of one concrete label.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ids: None,
            filters: Vec::new(),
            after: None,
            limit: None,
        }
    }

    /// Nodes of every label. Only session reads accept this; copies need a
    /// concrete label.
    pub fn all() -> Self {
        Self {
            label: None,
            ..Self::new(String::new())
        }
    }

    /// Restricts to one node id.
    pub fn id(self, node_id: impl Into<String>) -> Self {
        self.ids([node_id.into()])
    }

    /// Restricts to a set of node ids.
    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Requires a declared property to equal `value` (null matches absent).
    pub fn prop_eq(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(JsonEq {
            column: JsonColumn::Props,
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Requires a system annotation to equal `value`.
    pub fn sysan_eq(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(JsonEq {
            column: JsonColumn::Sysan,
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Keyset pagination: only ids strictly greater than `node_id`.
    pub fn after(mut self, node_id: impl Into<String>) -> Self {
        self.after = Some(node_id.into());
        self
    }

    /// Caps the number of rows per node type.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Concrete label, or `None` for an all-labels query.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub(crate) fn row_limit(&self) -> Option<usize> {
        self.limit
    }

    pub(crate) fn node_types(&self, schema: &Schema) -> Result<Vec<Arc<NodeType>>> {
        match &self.label {
            Some(label) => Ok(vec![schema.resolve_node(label)?]),
            None => Ok(schema.node_types().cloned().collect()),
        }
    }

    /// Compiles the filter for one node table; `None` when the table
    /// cannot match (a filtered property is not declared there).
    pub(crate) fn compile(&self, ty: &NodeType, alias: Option<&str>) -> Result<Option<SqlFilter>> {
        if !check_filters(&self.filters, ty.properties(), ty.label())? {
            if self.label.is_some() {
                let key = self
                    .filters
                    .iter()
                    .find(|f| f.column == JsonColumn::Props && !ty.properties().contains(&f.key))
                    .map(|f| f.key.as_str());
                return Err(GraphError::validation(
                    ty.label(),
                    "query",
                    key,
                    "property is not declared",
                ));
            }
            return Ok(None);
        }
        let col = |name: &str| match alias {
            Some(alias) => format!("{alias}.{name}"),
            None => name.to_owned(),
        };
        let mut sql = SqlFilter::default();
        if let Some(ids) = &self.ids {
            sql.push_in(&col("node_id"), ids);
        }
        for filter in &self.filters {
            sql.push_json_eq(alias, filter);
        }
        if let Some(after) = &self.after {
            sql.push(format!("{} > ?", col("node_id")), [SqlValue::Text(after.clone())]);
        }
        Ok(Some(sql))
    }

    pub(crate) fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(ids) = &self.ids {
            parts.push(format!("node_id in {ids:?}"));
        }
        for filter in &self.filters {
            parts.push(format!("{}.{} = {}", filter.column.name(), filter.key, filter.value));
        }
        if parts.is_empty() {
            "all rows".to_owned()
        } else {
            parts.join(" and ")
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum EdgeSelector {
    All,
    Name(String),
    Label(String),
}

/// Filter over edges of one concrete edge type, or of every edge type.
#[derive(Clone, Debug, PartialEq)]
pub struct EdgeQuery {
    selector: EdgeSelector,
    src_ids: Option<Vec<String>>,
    dst_ids: Option<Vec<String>>,
    filters: Vec<JsonEq>,
    after: Option<(String, String)>,
    limit: Option<usize>,
}

impl EdgeQuery {
    fn with(selector: EdgeSelector) -> Self {
        Self {
            selector,
            src_ids: None,
            dst_ids: None,
            filters: Vec::new(),
            after: None,
            limit: None,
        }
    }

    /// Edges of the type named `<src>_<label>_<dst>`.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self::with(EdgeSelector::Name(type_name.into()))
    }

    /// Edges of the type pinned by both endpoint labels.
    pub fn between(src_label: &str, label: &str, dst_label: &str) -> Self {
        Self::new(format!("{src_label}_{label}_{dst_label}"))
    }

    /// Edges of the single type carrying `label`; ambiguous labels fail
    /// when the query runs.
    pub fn label(label: impl Into<String>) -> Self {
        Self::with(EdgeSelector::Label(label.into()))
    }

    /// Edges of every type.
    pub fn all() -> Self {
        Self::with(EdgeSelector::All)
    }

    /// Restricts to one source id.
    pub fn src(self, src_id: impl Into<String>) -> Self {
        self.src_ids([src_id.into()])
    }

    /// Restricts to one destination id.
    pub fn dst(self, dst_id: impl Into<String>) -> Self {
        self.dst_ids([dst_id.into()])
    }

    /// Restricts to a set of source ids.
    pub fn src_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.src_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Restricts to a set of destination ids.
    pub fn dst_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dst_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Requires a declared edge property to equal `value`.
    pub fn prop_eq(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(JsonEq {
            column: JsonColumn::Props,
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Requires a system annotation to equal `value`.
    pub fn sysan_eq(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(JsonEq {
            column: JsonColumn::Sysan,
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Keyset pagination over `(src_id, dst_id)`.
    pub fn after(mut self, src_id: impl Into<String>, dst_id: impl Into<String>) -> Self {
        self.after = Some((src_id.into(), dst_id.into()));
        self
    }

    /// Caps the number of rows per edge type.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// `false` for [`EdgeQuery::all`].
    pub fn is_concrete(&self) -> bool {
        self.selector != EdgeSelector::All
    }

    pub(crate) fn row_limit(&self) -> Option<usize> {
        self.limit
    }

    pub(crate) fn edge_types(&self, schema: &Schema) -> Result<Vec<Arc<EdgeType>>> {
        match &self.selector {
            EdgeSelector::All => Ok(schema.edge_types().cloned().collect()),
            EdgeSelector::Name(name) => Ok(vec![schema.edge_type(name)?]),
            EdgeSelector::Label(label) => Ok(vec![schema.resolve_edge(label)?]),
        }
    }

    pub(crate) fn compile(&self, ty: &EdgeType) -> Result<Option<SqlFilter>> {
        if !check_filters(&self.filters, ty.properties(), ty.name())? {
            if self.is_concrete() {
                let key = self
                    .filters
                    .iter()
                    .find(|f| f.column == JsonColumn::Props && !ty.properties().contains(&f.key))
                    .map(|f| f.key.as_str());
                return Err(GraphError::validation(
                    ty.name(),
                    "query",
                    key,
                    "property is not declared",
                ));
            }
            return Ok(None);
        }
        let mut sql = SqlFilter::default();
        if let Some(ids) = &self.src_ids {
            sql.push_in("src_id", ids);
        }
        if let Some(ids) = &self.dst_ids {
            sql.push_in("dst_id", ids);
        }
        for filter in &self.filters {
            sql.push_json_eq(None, filter);
        }
        if let Some((src, dst)) = &self.after {
            sql.push(
                "(src_id, dst_id) > (?, ?)".to_owned(),
                [SqlValue::Text(src.clone()), SqlValue::Text(dst.clone())],
            );
        }
        Ok(Some(sql))
    }
}

impl NodeQuery {
    /// `false` for [`NodeQuery::all`].
    pub fn is_concrete(&self) -> bool {
        self.label.is_some()
    }
}
