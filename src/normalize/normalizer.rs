//! Flattens tree-shaped responses into records.
//!
//! The normalizer walks a selection tree in lockstep with a response object. Objects become
//! records (keyed by their global id, or by a client id derived from the parent record and field
//! storage key), and the fields linking to them become `__ref` / `__refs` values. A field absent
//! from the response is left undefined; only structurally invalid responses fail the pass.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::{
    error::StoreError,
    normalize::payload::{
        GraphQLError, GraphQLResponse, HandleFieldPayload, IncrementalPlaceholder,
        NormalizationSelector, NormalizeOptions, ResponsePayload,
    },
    operation::{InlineFragment, LinkedField, Selection},
    record::{
        format_path, DataId, FieldError, FieldErrorKind, FieldValue, PathSegment, TYPENAME_KEY,
    },
    storage_key::{argument_values, Variables},
    store::{RecordSource, RecordSourceMutator},
};

/// Work discovered during a pass, besides the record writes themselves.
#[derive(Debug, Default)]
pub struct NormalizedParts {
    pub field_payloads: Vec<HandleFieldPayload>,
    pub incremental: Vec<IncrementalPlaceholder>,
    pub resolver_fields: Vec<(DataId, String)>,
}

pub struct Normalizer<'m, 'a> {
    mutator: &'m mut RecordSourceMutator<'a>,
    options: &'m NormalizeOptions,
    errors: &'m [GraphQLError],
    variables: Variables,
    path: Vec<PathSegment>,
    written: BTreeMap<(DataId, String), FieldValue>,
    parts: NormalizedParts,
}

impl<'m, 'a> Normalizer<'m, 'a> {
    /// `path` is the response path of the object the pass starts at: empty for an operation
    /// root, the label path for an incremental chunk.
    pub fn new(
        mutator: &'m mut RecordSourceMutator<'a>,
        options: &'m NormalizeOptions,
        errors: &'m [GraphQLError],
        variables: Variables,
        path: Vec<PathSegment>,
    ) -> Self {
        Normalizer {
            mutator,
            options,
            errors,
            variables,
            path,
            written: BTreeMap::new(),
            parts: NormalizedParts::default(),
        }
    }

    pub fn finish(self) -> NormalizedParts {
        self.parts
    }

    pub fn normalize_root(
        &mut self,
        selector: &NormalizationSelector,
        data: &Value,
    ) -> Result<(), StoreError> {
        let Value::Object(object) = data else {
            return Err(StoreError::Normalization(format!(
                "Expected an object at `{}` for {}, found {data}",
                format_path(&self.path),
                selector.data_id
            )));
        };
        self.mutator.ensure(&selector.data_id, &selector.typename)?;
        self.traverse(&selector.selections, &selector.data_id, object)
    }

    /// Place one streamed list item at `index` of the list stored under `field` on `parent`.
    /// The normalizer's path must be the path of the list field.
    pub fn normalize_stream_item(
        &mut self,
        parent: &DataId,
        field: &LinkedField,
        index: usize,
        item: &Value,
    ) -> Result<(), StoreError> {
        let key = field.storage_key(&self.variables);
        let mut ids = match self.mutator.get_linked_record_ids(parent, &key) {
            Some(Some(ids)) => ids,
            _ => Vec::new(),
        };
        let child = if item.is_null() {
            None
        } else {
            self.path.push(index.into());
            let child = self.normalize_child(field, parent, &key, Some(index), item)?;
            self.path.pop();
            Some(child)
        };
        if ids.len() <= index {
            ids.resize(index + 1, None);
        }
        ids[index] = child;
        self.mutator
            .set_value(parent, &key, FieldValue::links(ids))
    }

    fn traverse(
        &mut self,
        selections: &[Selection],
        id: &DataId,
        data: &Map<String, Value>,
    ) -> Result<(), StoreError> {
        for selection in selections.iter() {
            match selection {
                Selection::ScalarField(field) => {
                    let response_key = field.response_key();
                    match data.get(response_key) {
                        Some(value) => {
                            let key = field.storage_key(&self.variables);
                            let value = FieldValue::Scalar(value.clone());
                            self.write(id, &key, value, Some(response_key))?;
                        }
                        None => self.log_absent(id, response_key),
                    }
                }
                Selection::LinkedField(field) => self.normalize_linked_field(field, id, data)?,
                Selection::InlineFragment(fragment) => {
                    self.normalize_inline_fragment(fragment, id, data)?
                }
                Selection::FragmentSpread(spread) => {
                    let scoped = spread.fragment_variables(&self.variables);
                    let outer = std::mem::replace(&mut self.variables, scoped);
                    let result = self.traverse(&spread.fragment.selections, id, data);
                    self.variables = outer;
                    result?;
                }
                Selection::Condition(condition) => {
                    if condition.passes(&self.variables) {
                        self.traverse(&condition.selections, id, data)?;
                    }
                }
                Selection::Defer(defer) => {
                    if !defer.is_enabled(&self.variables) {
                        self.traverse(&defer.selections, id, data)?;
                        continue;
                    }
                    let mut keys = Vec::new();
                    defer
                        .selections
                        .iter()
                        .for_each(|selection| selection.response_keys(&mut keys));
                    if keys.iter().any(|key| data.contains_key(key)) {
                        self.traverse(&defer.selections, id, data)?;
                    } else {
                        tracing::debug!(
                            "Deferring `{}` at `{}` until its payload arrives",
                            defer.label,
                            format_path(&self.path)
                        );
                        let selector = NormalizationSelector {
                            data_id: id.clone(),
                            typename: self.record_type(id),
                            selections: defer.selections.clone(),
                            variables: self.variables.clone(),
                        };
                        self.parts.incremental.push(IncrementalPlaceholder::Defer {
                            label: defer.label.clone(),
                            path: self.path.clone(),
                            selector,
                        });
                    }
                }
                Selection::Stream(stream) => {
                    self.traverse(&stream.selections, id, data)?;
                    if !stream.is_enabled(&self.variables) {
                        continue;
                    }
                    for selection in stream.selections.iter() {
                        match selection {
                            Selection::LinkedField(field) if field.plural => {
                                let response_key = field.response_key();
                                let next_index = data
                                    .get(response_key)
                                    .and_then(Value::as_array)
                                    .map(Vec::len)
                                    .unwrap_or(0);
                                let mut path = self.path.clone();
                                path.push(response_key.into());
                                self.parts.incremental.push(IncrementalPlaceholder::Stream {
                                    label: stream.label.clone(),
                                    path,
                                    parent_id: id.clone(),
                                    field: field.clone(),
                                    variables: self.variables.clone(),
                                    next_index,
                                });
                            }
                            other => tracing::warn!(
                                "Stream `{}` only supports plural linked fields, \
                                 {other:?} is normalized inline",
                                stream.label
                            ),
                        }
                    }
                }
                // Client fields are never sent by the server, so absences here aren't missing data.
                Selection::ClientExtension(extension) => {
                    self.traverse(&extension.selections, id, data)?
                }
                Selection::Resolver(field) => {
                    let key = field.storage_key(&self.variables);
                    self.parts.resolver_fields.push((id.clone(), key));
                }
                Selection::TypeDiscriminator(discriminator) => {
                    let implements = self.implements(id, &discriminator.abstract_key, data);
                    self.write(
                        id,
                        &discriminator.abstract_key,
                        FieldValue::Scalar(Value::Bool(implements)),
                        None,
                    )?;
                }
            }
        }
        Ok(())
    }

    fn normalize_inline_fragment(
        &mut self,
        fragment: &InlineFragment,
        id: &DataId,
        data: &Map<String, Value>,
    ) -> Result<(), StoreError> {
        match fragment.abstract_key.as_deref() {
            Some(abstract_key) => {
                let implements = self.implements(id, abstract_key, data);
                self.write(
                    id,
                    abstract_key,
                    FieldValue::Scalar(Value::Bool(implements)),
                    None,
                )?;
                if implements {
                    self.traverse(&fragment.selections, id, data)?;
                }
            }
            None => {
                if self.record_type(id) == fragment.type_condition {
                    self.traverse(&fragment.selections, id, data)?;
                }
            }
        }
        Ok(())
    }

    /// Whether the record's concrete type implements the abstract type behind `abstract_key`.
    /// The membership table decides; without one, the server must have echoed the key.
    fn implements(&self, id: &DataId, abstract_key: &str, data: &Map<String, Value>) -> bool {
        match self.options.abstract_type_memberships.get(abstract_key) {
            Some(members) => members.contains(&self.record_type(id)),
            None => data.get(abstract_key).is_some_and(|value| !value.is_null()),
        }
    }

    fn normalize_linked_field(
        &mut self,
        field: &LinkedField,
        parent: &DataId,
        data: &Map<String, Value>,
    ) -> Result<(), StoreError> {
        let response_key = field.response_key();
        let Some(value) = data.get(response_key) else {
            self.log_absent(parent, response_key);
            return Ok(());
        };
        let key = field.storage_key(&self.variables);
        if value.is_null() {
            self.write(parent, &key, FieldValue::null(), Some(response_key))?;
        } else if field.plural {
            let Value::Array(items) = value else {
                return Err(self.structural(response_key, "a list", value));
            };
            self.path.push(response_key.into());
            let mut ids = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                if item.is_null() {
                    ids.push(None);
                    continue;
                }
                self.path.push(index.into());
                let child = self.normalize_child(field, parent, &key, Some(index), item)?;
                self.path.pop();
                ids.push(Some(child));
            }
            self.path.pop();
            self.write(parent, &key, FieldValue::links(ids), Some(response_key))?;
        } else {
            self.path.push(response_key.into());
            let child = self.normalize_child(field, parent, &key, None, value)?;
            self.path.pop();
            self.write(parent, &key, FieldValue::link(child), Some(response_key))?;
        }

        let handle_key = field.handle_key(&self.variables);
        if let (Some(handle), Some(handle_key)) = (&field.handle, handle_key) {
            self.parts.field_payloads.push(HandleFieldPayload {
                data_id: parent.clone(),
                field_key: key,
                handle_key,
                handle: handle.handle.clone(),
                args: argument_values(&field.args, &self.variables),
            });
        }
        Ok(())
    }

    fn normalize_child(
        &mut self,
        field: &LinkedField,
        parent: &DataId,
        key: &str,
        index: Option<usize>,
        value: &Value,
    ) -> Result<DataId, StoreError> {
        let Value::Object(object) = value else {
            return Err(self.structural(field.response_key(), "an object", value));
        };
        let id = match object.get(&self.options.id_field) {
            Some(Value::String(id)) => DataId::new(id.as_str()),
            Some(Value::Number(id)) => DataId::new(id.to_string()),
            _ => DataId::client(parent, key, index),
        };
        let typename = object
            .get(TYPENAME_KEY)
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| field.concrete_type.clone())
            .or_else(|| self.mutator.get_type(&id).map(str::to_string))
            .ok_or_else(|| {
                StoreError::Normalization(format!(
                    "Expected `{}` at `{}` to include __typename",
                    field.response_key(),
                    format_path(&self.path)
                ))
            })?;
        self.mutator.ensure(&id, &typename)?;
        if self.mutator.get_type(&id) != Some(typename.as_str()) {
            self.mutator
                .set_value(&id, TYPENAME_KEY, FieldValue::Scalar(Value::String(typename)))?;
        }
        self.traverse(&field.selections, &id, object)?;
        Ok(id)
    }

    fn write(
        &mut self,
        id: &DataId,
        key: &str,
        value: FieldValue,
        response_key: Option<&str>,
    ) -> Result<(), StoreError> {
        if let Some(previous) = self
            .written
            .insert((id.clone(), key.to_string()), value.clone())
        {
            if previous != value && self.options.warn_on_conflicting_writes {
                tracing::error!(
                    "Conflicting values for {id}.{key} in one payload, keeping the last: \
                     {previous:?} then {value:?}"
                );
            }
        }
        let errors = match response_key {
            Some(response_key) => self.errors_at(response_key, value.is_null()),
            None => Vec::new(),
        };
        self.mutator.set_value(id, key, value)?;
        self.mutator.set_errors(id, key, errors)
    }

    /// Server errors reported for the field at `response_key` under the current path. A null
    /// field also takes the errors of everything beneath it, since none of that gets written.
    fn errors_at(&self, response_key: &str, include_descendants: bool) -> Vec<FieldError> {
        if self.errors.is_empty() {
            return Vec::new();
        }
        let mut field_path = self.path.clone();
        field_path.push(response_key.into());
        self.errors
            .iter()
            .filter_map(|err| {
                let path = err.path.as_ref()?;
                let matches = path == &field_path
                    || (include_descendants && path.starts_with(&field_path));
                matches.then(|| FieldError {
                    message: err.message.clone(),
                    path: path.clone(),
                    kind: FieldErrorKind::Server,
                })
            })
            .collect()
    }

    fn record_type(&self, id: &DataId) -> String {
        self.mutator.get_type(id).unwrap_or_default().to_string()
    }

    fn log_absent(&self, id: &DataId, response_key: &str) {
        tracing::debug!(
            "`{response_key}` is absent from the response at `{}`, \
             leaving {id}.{response_key} undefined",
            format_path(&self.path)
        );
    }

    fn structural(&self, response_key: &str, expected: &str, found: &Value) -> StoreError {
        let err = StoreError::Normalization(format!(
            "Expected {expected} for `{response_key}` at `{}`, found {found}",
            format_path(&self.path)
        ));
        tracing::error!("{err}");
        err
    }
}

/// Normalize `data` starting at `selector` into a fresh sink over `base`.
pub fn normalize_data(
    base: &dyn RecordSource,
    selector: &NormalizationSelector,
    data: &Value,
    path: Vec<PathSegment>,
    errors: &[GraphQLError],
    options: &NormalizeOptions,
) -> Result<ResponsePayload, StoreError> {
    let mut mutator = RecordSourceMutator::new(base, None);
    let mut normalizer = Normalizer::new(
        &mut mutator,
        options,
        errors,
        selector.variables.clone(),
        path,
    );
    normalizer.normalize_root(selector, data)?;
    let parts = normalizer.finish();
    Ok(ResponsePayload {
        source: mutator.into_sink(),
        field_payloads: parts.field_payloads,
        incremental: parts.incremental,
        resolver_fields: parts.resolver_fields,
        errors: errors.to_vec(),
        is_final: true,
    })
}

/// Normalize the initial payload of an operation. A response without data fails with the
/// server's errors.
pub fn normalize_response(
    base: &dyn RecordSource,
    response: &GraphQLResponse,
    selector: &NormalizationSelector,
    options: &NormalizeOptions,
) -> Result<ResponsePayload, StoreError> {
    let data = match response.data.as_ref() {
        Some(data) if !data.is_null() => data,
        _ if !response.errors.is_empty() => {
            return Err(StoreError::Response(response.error_summary()))
        }
        _ => {
            return Err(StoreError::Normalization(
                "Response has neither data nor errors".to_string(),
            ))
        }
    };
    let mut payload = normalize_data(
        base,
        selector,
        data,
        Vec::new(),
        &response.errors,
        options,
    )?;
    payload.is_final = !response.has_next;
    Ok(payload)
}
