//! Nested result trees.
//!
//! Finds return, and saves accept, data keyed by alias:
//!
//! ```text
//! {
//!   "Post":    { "id": 1, "title": "Hello", "author_id": 3 },
//!   "Author":  { "id": 3, "name": "mariano" },
//!   "Comment": [ { "id": 1, "post_id": 1, "User": { ... } } ]
//! }
//! ```
//!
//! The root entity and its direct associations are siblings in a [`Tree`].
//! Associations of associated records nest inside that [`Record`].

use std::collections::BTreeMap;

use relmodel_core::{Error, Result, Value};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

/// Build a [`Record`] from `field => value` pairs.
///
/// ```ignore
/// let post = record! { "title" => "Hello", "author_id" => 3 };
/// ```
#[macro_export]
macro_rules! record {
    () => {
        $crate::Record::new()
    };
    ($($field:expr => $value:expr),+ $(,)?) => {{
        let mut record = $crate::Record::new();
        $( record.set($field, $value); )+
        record
    }};
}

/// Column values of one row plus the associations nested inside it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: BTreeMap<String, Value>,
    related: BTreeMap<String, Related>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// A record with every listed column present and NULL.
    pub fn placeholder<'a>(columns: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            fields: columns
                .into_iter()
                .map(|c| (c.to_string(), Value::Null))
                .collect(),
            related: BTreeMap::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Set a column value, replacing any previous value.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Builder form of [`Record::set`].
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Column values in name order.
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut BTreeMap<String, Value> {
        &mut self.fields
    }

    /// True when the record has neither columns nor nested associations.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.related.is_empty()
    }

    pub fn related(&self, alias: &str) -> Option<&Related> {
        self.related.get(alias)
    }

    pub fn related_mut(&mut self, alias: &str) -> Option<&mut Related> {
        self.related.get_mut(alias)
    }

    /// Nest association results under `alias`.
    pub fn set_related(&mut self, alias: impl Into<String>, related: Related) {
        self.related.insert(alias.into(), related);
    }

    /// Builder form of [`Record::set_related`].
    pub fn with_related(mut self, alias: impl Into<String>, related: Related) -> Self {
        self.set_related(alias, related);
        self
    }

    pub fn take_related(&mut self, alias: &str) -> Option<Related> {
        self.related.remove(alias)
    }

    /// Nested associations in alias order.
    pub fn related_entries(&self) -> &BTreeMap<String, Related> {
        &self.related
    }

    /// Split into column values and nested associations.
    pub fn into_parts(self) -> (BTreeMap<String, Value>, BTreeMap<String, Related>) {
        (self.fields, self.related)
    }

    /// Merge `other` into this record; its values win.
    pub fn merge(&mut self, other: Record) {
        self.fields.extend(other.fields);
        self.related.extend(other.related);
    }

    /// Build from a JSON object: scalars become fields, objects and arrays
    /// become nested associations.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let serde_json::Value::Object(map) = value else {
            return Err(Error::Custom(format!(
                "expected a JSON object for a record, found {}",
                value
            )));
        };
        let mut record = Record::new();
        for (key, value) in map {
            match value {
                serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                    record.set_related(key.clone(), Related::from_json(value)?);
                }
                scalar => record.set(key.clone(), Value::from(scalar.clone())),
            }
        }
        Ok(record)
    }

    /// Render as a JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len() + self.related.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        for (k, v) in &self.related {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (k, v) in iter {
            record.set(k, v);
        }
        record
    }
}

/// Association data under one alias.
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    /// belongsTo / hasOne: exactly one record, possibly a placeholder
    One(Record),
    /// hasMany / hasAndBelongsToMany: zero or more records
    Many(Vec<Record>),
    /// Bare key list, accepted on save for hasAndBelongsToMany
    Keys(Vec<Value>),
}

impl Related {
    pub fn as_one(&self) -> Option<&Record> {
        match self {
            Related::One(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_many(&self) -> Option<&[Record]> {
        match self {
            Related::Many(rs) => Some(rs),
            _ => None,
        }
    }

    /// Number of records (or keys) held.
    pub fn len(&self) -> usize {
        match self {
            Related::One(_) => 1,
            Related::Many(rs) => rs.len(),
            Related::Keys(ks) => ks.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn from_json(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Object(_) => Ok(Related::One(Record::from_json(value)?)),
            serde_json::Value::Array(items) if items.iter().all(serde_json::Value::is_object) => {
                Ok(Related::Many(
                    items.iter().map(Record::from_json).collect::<Result<_>>()?,
                ))
            }
            serde_json::Value::Array(items) => Ok(Related::Keys(
                items.iter().cloned().map(Value::from).collect(),
            )),
            other => Err(Error::Custom(format!(
                "expected an object or array for associated data, found {}",
                other
            ))),
        }
    }
}

impl Serialize for Related {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Related::One(record) => record.serialize(serializer),
            Related::Many(records) => {
                let mut seq = serializer.serialize_seq(Some(records.len()))?;
                for r in records {
                    seq.serialize_element(r)?;
                }
                seq.end()
            }
            Related::Keys(keys) => keys.serialize(serializer),
        }
    }
}

/// One result row (or one save payload) keyed by alias.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tree {
    entries: BTreeMap<String, Related>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    /// A tree holding one record under `alias`.
    pub fn single(alias: impl Into<String>, record: Record) -> Self {
        Self::new().with(alias, record)
    }

    pub fn insert(&mut self, alias: impl Into<String>, related: Related) {
        self.entries.insert(alias.into(), related);
    }

    /// Add a single record under `alias`.
    pub fn with(mut self, alias: impl Into<String>, record: Record) -> Self {
        self.insert(alias, Related::One(record));
        self
    }

    /// Add a record list under `alias`.
    pub fn with_many(mut self, alias: impl Into<String>, records: Vec<Record>) -> Self {
        self.insert(alias, Related::Many(records));
        self
    }

    /// Add a bare key list under `alias`.
    pub fn with_keys<V: Into<Value>>(mut self, alias: impl Into<String>, keys: Vec<V>) -> Self {
        self.insert(alias, Related::Keys(keys.into_iter().map(Into::into).collect()));
        self
    }

    pub fn get(&self, alias: &str) -> Option<&Related> {
        self.entries.get(alias)
    }

    pub fn get_mut(&mut self, alias: &str) -> Option<&mut Related> {
        self.entries.get_mut(alias)
    }

    pub fn remove(&mut self, alias: &str) -> Option<Related> {
        self.entries.remove(alias)
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.entries.contains_key(alias)
    }

    /// The single record under `alias`.
    pub fn record(&self, alias: &str) -> Option<&Record> {
        self.get(alias).and_then(Related::as_one)
    }

    pub fn record_mut(&mut self, alias: &str) -> Option<&mut Record> {
        match self.entries.get_mut(alias) {
            Some(Related::One(r)) => Some(r),
            _ => None,
        }
    }

    /// The record list under `alias`.
    pub fn records(&self, alias: &str) -> Option<&[Record]> {
        self.get(alias).and_then(Related::as_many)
    }

    /// Look up `"Alias.field"` in a single-record entry.
    pub fn value(&self, path: &str) -> Option<&Value> {
        let (alias, field) = path.split_once('.')?;
        self.record(alias)?.get(field)
    }

    /// Aliases in order.
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Related)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a JSON object shaped like a find result.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let serde_json::Value::Object(map) = value else {
            return Err(Error::Custom(format!(
                "expected a JSON object keyed by alias, found {}",
                value
            )));
        };
        let mut tree = Tree::new();
        for (alias, entry) in map {
            tree.insert(alias.clone(), Related::from_json(entry)?);
        }
        Ok(tree)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl Serialize for Tree {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl IntoIterator for Tree {
    type Item = (String, Related);
    type IntoIter = std::collections::btree_map::IntoIter<String, Related>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_macro_and_access() {
        let r = record! { "id" => 1, "title" => "Hello", "body" => Value::Null };
        assert_eq!(r.get("id"), Some(&Value::Int(1)));
        assert_eq!(r.get("title"), Some(&Value::Text("Hello".into())));
        assert!(r.contains("body"));
        assert!(!r.contains("missing"));
    }

    #[test]
    fn test_placeholder_has_every_column() {
        let p = Record::placeholder(["id", "name"]);
        assert_eq!(p.to_json(), json!({"id": null, "name": null}));
    }

    #[test]
    fn test_tree_json_round_trip() {
        let input = json!({
            "Article": {"title": "First", "user_id": 1},
            "Comment": [{"comment": "a"}, {"comment": "b", "User": {"name": "x"}}],
            "Tag": [1, 2],
        });
        let tree = Tree::from_json(&input).expect("parse");
        assert_eq!(tree.value("Article.title"), Some(&Value::from("First")));
        assert_eq!(tree.records("Comment").map(<[Record]>::len), Some(2));
        assert!(matches!(tree.get("Tag"), Some(Related::Keys(k)) if k.len() == 2));
        let nested = &tree.records("Comment").expect("comments")[1];
        assert!(nested.related("User").and_then(Related::as_one).is_some());
        assert_eq!(tree.to_json(), input);
    }

    #[test]
    fn test_rejects_scalar_tree() {
        assert!(Tree::from_json(&json!(3)).is_err());
        assert!(Tree::from_json(&json!({"Post": 3})).is_err());
    }
}
