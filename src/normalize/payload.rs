use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::{
    config::StoreConfig,
    error::StoreError,
    operation::{LinkedField, OperationDescriptor, Selection},
    record::{format_path, DataId, PathSegment},
    storage_key::Variables,
    store::RecordMap,
};

/// One entry of a GraphQL response's `errors` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathSegment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

/// A server response, either the initial payload of an operation or an incremental chunk. Chunks
/// carry the `label` of the deferred or streamed selection they fill and the response `path` where
/// it attaches. Streamed chunks carry `items`, and their path ends with the index of the first
/// item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLResponse {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathSegment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<Value>>,
    #[serde(default)]
    pub has_next: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQLResponse {
    pub fn from_json(value: Value) -> Result<Self, StoreError> {
        Ok(serde_json::from_value(value)?)
    }

    /// A complete, error-free response with the given data.
    pub fn with_data(data: Value) -> Self {
        GraphQLResponse {
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn is_incremental(&self) -> bool {
        self.label.is_some()
    }

    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|err| err.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Where a normalization pass starts: a record, its type, and the selections to apply to the
/// response object found there.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizationSelector {
    pub data_id: DataId,
    pub typename: String,
    pub selections: Vec<Selection>,
    pub variables: Variables,
}

/// Emitted for every field carrying a handle; the matching field handler runs when the payload is
/// committed.
#[derive(Debug, Clone, PartialEq)]
pub struct HandleFieldPayload {
    pub data_id: DataId,
    /// Storage key of the server field.
    pub field_key: String,
    /// Storage key of the client field the handler maintains.
    pub handle_key: String,
    pub handle: String,
    pub args: Variables,
}

/// A deferred or streamed selection whose data hasn't arrived yet.
#[derive(Debug, Clone, PartialEq)]
pub enum IncrementalPlaceholder {
    Defer {
        label: String,
        path: Vec<PathSegment>,
        selector: NormalizationSelector,
    },
    Stream {
        label: String,
        /// Path of the streamed list field itself.
        path: Vec<PathSegment>,
        parent_id: DataId,
        field: LinkedField,
        variables: Variables,
        /// Number of items delivered with the initial payload.
        next_index: usize,
    },
}

impl IncrementalPlaceholder {
    pub fn label(&self) -> &str {
        match self {
            IncrementalPlaceholder::Defer { label, .. }
            | IncrementalPlaceholder::Stream { label, .. } => label,
        }
    }

    pub fn path(&self) -> &[PathSegment] {
        match self {
            IncrementalPlaceholder::Defer { path, .. }
            | IncrementalPlaceholder::Stream { path, .. } => path,
        }
    }

    pub fn key(&self) -> (String, String) {
        (self.label().to_string(), format_path(self.path()))
    }
}

/// The output of one normalization pass: a sink of partial records plus the follow-up work the
/// pass discovered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponsePayload {
    pub source: RecordMap,
    pub field_payloads: Vec<HandleFieldPayload>,
    pub incremental: Vec<IncrementalPlaceholder>,
    /// Resolver fields met on the way, as `(record, storage key)`.
    pub resolver_fields: Vec<(DataId, String)>,
    pub errors: Vec<GraphQLError>,
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizeOptions {
    pub id_field: String,
    pub abstract_type_memberships: BTreeMap<String, BTreeSet<String>>,
    pub warn_on_conflicting_writes: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        NormalizeOptions::from_config(&StoreConfig::default())
    }
}

impl NormalizeOptions {
    pub fn from_config(config: &StoreConfig) -> Self {
        NormalizeOptions {
            id_field: config.id_field.clone(),
            abstract_type_memberships: BTreeMap::new(),
            warn_on_conflicting_writes: config.warn_on_conflicting_writes,
        }
    }

    pub fn for_operation(config: &StoreConfig, operation: &OperationDescriptor) -> Self {
        NormalizeOptions {
            abstract_type_memberships: operation.abstract_type_memberships.clone(),
            ..NormalizeOptions::from_config(config)
        }
    }
}
