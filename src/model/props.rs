//! Property and annotation containers with explicit change tracking.
//!
//! Both containers keep the map last loaded from (or written to) the store
//! as a baseline. [`MapDiff`] describes how the current map departs from a
//! snapshot; the session flush uses it to decide whether a history row is
//! needed and to merge the change onto the stored state.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{GraphError, Result};
use crate::sanitize::{is_safe_key, sanitize};
use crate::schema::PropertySet;

static NULL: Value = Value::Null;

/// Per-key comparison between a current map and a snapshot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MapDiff {
    /// Keys that are new or changed, with their current values.
    pub added: Map<String, Value>,
    /// Keys that changed or were removed, with their snapshot values.
    pub deleted: Map<String, Value>,
    /// Keys whose value is the same in both maps.
    pub unchanged: Map<String, Value>,
}

impl MapDiff {
    /// Computes the diff of `current` against `snapshot`.
    pub fn between(snapshot: &Map<String, Value>, current: &Map<String, Value>) -> Self {
        let mut diff = MapDiff::default();
        for (key, value) in current {
            match snapshot.get(key) {
                Some(old) if old == value => {
                    diff.unchanged.insert(key.clone(), value.clone());
                }
                Some(old) => {
                    diff.deleted.insert(key.clone(), old.clone());
                    diff.added.insert(key.clone(), value.clone());
                }
                None => {
                    diff.added.insert(key.clone(), value.clone());
                }
            }
        }
        for (key, old) in snapshot {
            if !current.contains_key(key) {
                diff.deleted.insert(key.clone(), old.clone());
            }
        }
        diff
    }

    /// Returns `true` when nothing was added, changed or removed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty()
    }

    /// Keys present in the snapshot but absent from the current map.
    pub fn removed_keys(&self) -> impl Iterator<Item = &String> {
        self.deleted
            .keys()
            .filter(move |key| !self.added.contains_key(*key))
    }

    /// Applies this diff onto `base`: removed keys go away, added keys win.
    pub fn merge_onto(&self, base: &Map<String, Value>) -> Map<String, Value> {
        let mut merged = base.clone();
        for key in self.removed_keys() {
            merged.remove(key);
        }
        for (key, value) in &self.added {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }
}

#[derive(Clone, Debug, Default)]
struct TrackedMap {
    current: Map<String, Value>,
    baseline: Option<Map<String, Value>>,
}

impl TrackedMap {
    fn loaded(map: Map<String, Value>) -> Self {
        Self {
            baseline: Some(map.clone()),
            current: map,
        }
    }

    fn pending(&self) -> MapDiff {
        match &self.baseline {
            Some(baseline) => MapDiff::between(baseline, &self.current),
            None => MapDiff::between(&Map::new(), &self.current),
        }
    }
}

/// Declared properties of one entity.
///
/// Every declared key is always readable (absent keys read as null);
/// writes are validated against the declaration immediately.
#[derive(Clone, Debug)]
pub struct Properties {
    entity: String,
    id: String,
    decl: Arc<PropertySet>,
    map: TrackedMap,
}

impl Properties {
    pub(crate) fn new(entity: &str, id: String, decl: Arc<PropertySet>) -> Self {
        Self {
            entity: entity.to_owned(),
            id,
            decl,
            map: TrackedMap::default(),
        }
    }

    pub(crate) fn loaded(
        entity: &str,
        id: String,
        decl: Arc<PropertySet>,
        map: Map<String, Value>,
    ) -> Self {
        Self {
            entity: entity.to_owned(),
            id,
            decl,
            map: TrackedMap::loaded(map),
        }
    }

    /// Reads a declared key. Returns `None` only for undeclared keys.
    pub fn get(&self, key: &str) -> Option<&Value> {
        if !self.decl.contains(key) {
            return None;
        }
        Some(self.map.current.get(key).unwrap_or(&NULL))
    }

    /// Reads a declared key as a string, when it holds one.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Validates and writes one property.
    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<()> {
        let def = self.decl.get(key).ok_or_else(|| {
            GraphError::validation(&self.entity, &self.id, Some(key), "property is not declared")
        })?;
        let value = sanitize(value)
            .map_err(|err| GraphError::validation(&self.entity, &self.id, Some(key), err.to_string()))?;
        def.check(&value)
            .map_err(|msg| GraphError::validation(&self.entity, &self.id, Some(key), msg))?;
        self.map.current.insert(key.to_owned(), value);
        Ok(())
    }

    /// Writes several properties, stopping at the first invalid one.
    pub fn update<I, K, V>(&mut self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Serialize,
    {
        for (key, value) in entries {
            self.set(key.as_ref(), &value)?;
        }
        Ok(())
    }

    /// Clears a declared key back to null.
    pub fn delete(&mut self, key: &str) -> Result<()> {
        self.set(key, &Value::Null)
    }

    /// Every declared key with its value, in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.decl
            .keys()
            .map(move |key| (key, self.map.current.get(key).unwrap_or(&NULL)))
    }

    /// Materializes every declared key into a map.
    pub fn to_map(&self) -> Map<String, Value> {
        self.iter()
            .map(|(key, value)| (key.to_owned(), value.clone()))
            .collect()
    }

    /// Keys that were explicitly written (or loaded), without null padding.
    pub fn explicit(&self) -> &Map<String, Value> {
        &self.map.current
    }

    /// Diff of the explicit map against an arbitrary snapshot.
    pub fn diff_since(&self, snapshot: &Map<String, Value>) -> MapDiff {
        MapDiff::between(snapshot, &self.map.current)
    }

    /// Changes since the entity was loaded; everything, for a fresh entity.
    pub fn pending_changes(&self) -> MapDiff {
        self.map.pending()
    }

    /// Declared keys that must be non-null but currently are null.
    pub fn missing_required<'a>(&'a self, map: &'a Map<String, Value>) -> impl Iterator<Item = &'a str> {
        self.decl
            .required()
            .iter()
            .map(String::as_str)
            .filter(move |key| map.get(*key).map_or(true, Value::is_null))
    }
}

/// Free-form operational metadata (system annotations) of one entity.
#[derive(Clone, Debug, Default)]
pub struct Annotations {
    map: TrackedMap,
}

impl Annotations {
    pub(crate) fn loaded(map: Map<String, Value>) -> Self {
        Self {
            map: TrackedMap::loaded(map),
        }
    }

    /// Reads one annotation.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.current.get(key)
    }

    /// Sanitizes and writes one annotation.
    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<()> {
        if !is_safe_key(key) {
            return Err(GraphError::InvalidArgument(format!(
                "unsupported annotation key {key:?}"
            )));
        }
        let value = sanitize(value)?;
        self.map.current.insert(key.to_owned(), value);
        Ok(())
    }

    /// Writes several annotations.
    pub fn update<I, K, V>(&mut self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Serialize,
    {
        for (key, value) in entries {
            self.set(key.as_ref(), &value)?;
        }
        Ok(())
    }

    /// Removes an annotation, returning its previous value.
    pub fn delete(&mut self, key: &str) -> Option<Value> {
        self.map.current.remove(key)
    }

    /// Iterates annotations in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.map.current.iter()
    }

    /// Current annotation map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.map.current
    }

    /// Diff against an arbitrary snapshot.
    pub fn diff_since(&self, snapshot: &Map<String, Value>) -> MapDiff {
        MapDiff::between(snapshot, &self.map.current)
    }

    /// Changes since the entity was loaded; everything, for a fresh entity.
    pub fn pending_changes(&self) -> MapDiff {
        self.map.pending()
    }

    /// Number of annotations.
    pub fn len(&self) -> usize {
        self.map.current.len()
    }

    /// Returns `true` when there are no annotations.
    pub fn is_empty(&self) -> bool {
        self.map.current.is_empty()
    }
}
