//! Flat records: the unit of truth held by a record source.
//!
//! A [Record] maps storage keys to [FieldValue]s. A key that is absent from the record was never
//! fetched ("undefined"); a key holding `FieldValue::Scalar(Value::Null)` was fetched and is
//! explicitly null. Merging two versions of a record never erases a known value with an absent
//! one, but an explicit null does overwrite.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::{
    borrow::{Borrow, Cow},
    collections::BTreeMap,
    fmt::{self, Display},
};

pub const ID_KEY: &str = "__id";
pub const TYPENAME_KEY: &str = "__typename";
pub const ERRORS_KEY: &str = "__errors";
pub const ROOT_ID: &str = "client:root";
pub const ROOT_TYPE: &str = "__Root";
pub const CLIENT_ID_PREFIX: &str = "client:";

/// Globally unique record identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataId(String);

impl DataId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        DataId(id.into())
    }

    pub fn root() -> Self {
        DataId(ROOT_ID.to_string())
    }

    /// Derive the identifier of a record that has no global id of its own, from the record that
    /// links to it, the storage key of the linking field and, for plural fields, the position.
    ///
    /// The derivation is deterministic so that normalizing the same payload twice yields the same
    /// identifiers.
    pub fn client(parent: &DataId, storage_key: &str, index: Option<usize>) -> Self {
        let mut key = format!("{}:{}", parent.0, storage_key);
        if let Some(index) = index {
            key.push(':');
            key.push_str(&index.to_string());
        }
        if !key.starts_with(CLIENT_ID_PREFIX) {
            key.insert_str(0, CLIENT_ID_PREFIX);
        }
        DataId(key)
    }

    pub fn is_client(&self) -> bool {
        self.0.starts_with(CLIENT_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DataId {
    fn from(id: &str) -> Self {
        DataId(id.to_string())
    }
}

impl From<String> for DataId {
    fn from(id: String) -> Self {
        DataId(id)
    }
}

impl From<&DataId> for String {
    fn from(id: &DataId) -> String {
        id.0.clone()
    }
}

impl Borrow<str> for DataId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The value stored under one storage key.
///
/// Serialized the same way persisted stores are usually exchanged: links as `{"__ref": id}`,
/// plural links as `{"__refs": [id | null, ...]}`, everything else as plain JSON. Only an object
/// whose sole key is `__ref` or `__refs` reads back as a link, so a custom scalar carrying those
/// keys next to others stays a scalar.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Link {
        #[serde(rename = "__ref")]
        id: DataId,
    },
    Links {
        #[serde(rename = "__refs")]
        ids: Vec<Option<DataId>>,
    },
    /// A scalar, a list of scalars, or an explicit null (for scalar and linked fields alike).
    Scalar(Value),
}

impl FieldValue {
    pub fn null() -> Self {
        FieldValue::Scalar(Value::Null)
    }

    pub fn link(id: DataId) -> Self {
        FieldValue::Link { id }
    }

    pub fn links(ids: Vec<Option<DataId>>) -> Self {
        FieldValue::Links { ids }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Scalar(Value::Null))
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            FieldValue::Scalar(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<&DataId> {
        match self {
            FieldValue::Link { id } => Some(id),
            _ => None,
        }
    }

    pub fn as_links(&self) -> Option<&[Option<DataId>]> {
        match self {
            FieldValue::Links { ids } => Some(ids),
            _ => None,
        }
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        FieldValue::Scalar(value)
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(stored_link(&value).unwrap_or(FieldValue::Scalar(value)))
    }
}

fn stored_link(value: &Value) -> Option<FieldValue> {
    let Value::Object(map) = value else {
        return None;
    };
    if map.len() != 1 {
        return None;
    }
    match map.iter().next()? {
        (key, Value::String(id)) if key == "__ref" => {
            Some(FieldValue::link(DataId::from(id.as_str())))
        }
        (key, Value::Array(items)) if key == "__refs" => items
            .iter()
            .map(|item| match item {
                Value::String(id) => Some(Some(DataId::from(id.as_str()))),
                Value::Null => Some(None),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .map(FieldValue::links),
        _ => None,
    }
}

/// One segment of a response path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Index(idx) => write!(f, "{idx}"),
            PathSegment::Key(key) => f.write_str(key),
        }
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<usize> for PathSegment {
    fn from(idx: usize) -> Self {
        PathSegment::Index(idx)
    }
}

pub fn format_path(path: &[PathSegment]) -> String {
    path.iter()
        .map(|segment| segment.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FieldErrorKind {
    /// Reported by the server in the response `errors` list.
    #[default]
    Server,
    /// Raised by a client resolver computing the field.
    Resolver,
}

/// An error attached to a single field, either in a record or in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    pub message: String,
    #[serde(default)]
    pub path: Vec<PathSegment>,
    #[serde(default)]
    pub kind: FieldErrorKind,
}

/// A flat record. Every record carries its identifier and its concrete type name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "__id")]
    id: DataId,
    #[serde(rename = "__typename")]
    typename: String,
    #[serde(rename = "__errors", default, skip_serializing_if = "BTreeMap::is_empty")]
    errors: BTreeMap<String, Vec<FieldError>>,
    #[serde(flatten)]
    fields: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new<S: Into<String>>(id: DataId, typename: S) -> Self {
        Record {
            id,
            typename: typename.into(),
            errors: BTreeMap::new(),
            fields: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &DataId {
        &self.id
    }

    pub fn typename(&self) -> &str {
        &self.typename
    }

    /// Look up a storage key. The reserved keys `__id` and `__typename` are served from the
    /// record header.
    pub fn get(&self, key: &str) -> Option<Cow<'_, FieldValue>> {
        match key {
            ID_KEY => Some(Cow::Owned(FieldValue::Scalar(Value::String(
                self.id.to_string(),
            )))),
            TYPENAME_KEY => Some(Cow::Owned(FieldValue::Scalar(Value::String(
                self.typename.clone(),
            )))),
            _ => self.fields.get(key).map(Cow::Borrowed),
        }
    }

    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn has(&self, key: &str) -> bool {
        matches!(key, ID_KEY | TYPENAME_KEY) || self.fields.contains_key(key)
    }

    /// Set a field value, returning true if the stored value changed.
    pub fn set(&mut self, key: &str, value: FieldValue) -> bool {
        match key {
            ID_KEY => false,
            TYPENAME_KEY => {
                let FieldValue::Scalar(Value::String(typename)) = value else {
                    tracing::warn!("Ignoring non-string __typename write on record {}", self.id);
                    return false;
                };
                if typename != self.typename {
                    self.typename = typename;
                    true
                } else {
                    false
                }
            }
            _ => {
                if self.fields.get(key) == Some(&value) {
                    false
                } else {
                    self.fields.insert(key.to_string(), value);
                    true
                }
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<FieldValue> {
        self.errors.remove(key);
        self.fields.remove(key)
    }

    pub fn errors(&self, key: &str) -> Option<&[FieldError]> {
        self.errors.get(key).map(|errors| errors.as_slice())
    }

    pub fn all_errors(&self) -> &BTreeMap<String, Vec<FieldError>> {
        &self.errors
    }

    pub fn set_errors(&mut self, key: &str, errors: Vec<FieldError>) {
        if errors.is_empty() {
            self.errors.remove(key);
        } else {
            self.errors.insert(key.to_string(), errors);
        }
    }

    /// Merge the fields of `other` into this record.
    ///
    /// Keys absent from `other` are untouched. Field errors follow the value they describe: a key
    /// written by `other` takes `other`'s errors for that key (or none). Returns the storage keys
    /// whose value changed.
    pub fn update(&mut self, other: &Record) -> Vec<String> {
        if other.id != self.id {
            tracing::warn!(
                "Invalid record update, expected both versions of the record to have the same id, \
                 got {} and {}",
                self.id,
                other.id
            );
        }
        let mut changed = Vec::new();
        if other.typename != self.typename {
            tracing::warn!(
                "Record {} changed __typename from {} to {}",
                self.id,
                self.typename,
                other.typename
            );
            self.typename = other.typename.clone();
            changed.push(TYPENAME_KEY.to_string());
        }
        for (key, value) in other.fields.iter() {
            let errors_changed = self.errors.get(key) != other.errors.get(key);
            if self.set(key, value.clone()) || errors_changed {
                changed.push(key.clone());
            }
            match other.errors.get(key) {
                Some(errors) => {
                    self.errors.insert(key.clone(), errors.clone());
                }
                None => {
                    self.errors.remove(key);
                }
            }
        }
        changed
    }
}
