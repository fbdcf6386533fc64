//! Reconstructs tree-shaped results from records.
//!
//! Reading walks the read selections (fragment boundaries intact) from a root record and records
//! every `(record, storage key)` pair it touches. That dependency set is what the store matches
//! changes against when deciding which subscriptions to re-read.

use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use crate::{
    error::StoreError,
    operation::{
        FragmentSpread, InlineFragment, LinkedField, ReaderSelector, RequestIdentifier,
        RequiredAction, ResolverField, ScalarField, Selection, FRAGMENTS_KEY, FRAGMENT_OWNER_KEY,
    },
    record::{
        format_path, DataId, FieldError, FieldErrorKind, FieldValue, PathSegment, Record, ID_KEY,
    },
    resolver::ResolverLayer,
    storage_key::Variables,
    store::{OverlaySource, RecordLookup, RecordSource},
};

/// Record id to the storage keys read from it. An id with no keys was followed but never read
/// from (it was missing or deleted).
pub type Dependencies = BTreeMap<DataId, BTreeSet<String>>;

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub data: Value,
    pub is_missing_data: bool,
    pub seen: Dependencies,
    pub field_errors: Vec<FieldError>,
    /// Response paths of required fields that were null or missing, for `log` and `none`
    /// actions.
    pub missing_required_fields: Vec<String>,
    /// Set when the read failed: a `throw` required field was null or missing, or a field error
    /// was hit with throw-on-field-error enabled. `data` is null and `seen` covers what was read
    /// up to the failure.
    pub error: Option<StoreError>,
    pub selector: ReaderSelector,
}

impl Snapshot {
    /// True if both snapshots would render the same result.
    pub fn same_result(&self, other: &Snapshot) -> bool {
        self.data == other.data
            && self.is_missing_data == other.is_missing_data
            && self.field_errors == other.field_errors
            && self.missing_required_fields == other.missing_required_fields
            && self.error == other.error
    }

    /// The snapshot itself, or its read failure.
    pub fn into_result(self) -> Result<Snapshot, StoreError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// Read `selector` from `source`, failing when the read fails. Resolver fields are evaluated
/// through `resolvers`; without one they read as missing.
pub fn read(
    source: &dyn RecordSource,
    selector: &ReaderSelector,
    resolvers: Option<&ResolverLayer>,
) -> Result<Snapshot, StoreError> {
    read_snapshot(source, selector, resolvers).into_result()
}

/// Read `selector` from `source`. A failed read still yields a snapshot, carrying the failure in
/// [Snapshot::error] along with the dependencies read before it.
pub fn read_snapshot(
    source: &dyn RecordSource,
    selector: &ReaderSelector,
    resolvers: Option<&ResolverLayer>,
) -> Snapshot {
    let mut reader = Reader::new(
        source,
        resolvers,
        &selector.owner,
        selector.variables.clone(),
        Vec::new(),
    );
    let result = reader.read_record(&selector.data_id, &selector.fragment.selections);
    let (data, mut error) = match result {
        Ok(data) => (data, None),
        Err(err) => (Value::Null, Some(err)),
    };
    if error.is_none() && selector.fragment.throw_on_field_error {
        if let Some(err) = reader.field_errors.first() {
            error = Some(StoreError::FieldError {
                owner: selector.owner.to_string(),
                path: format_path(&err.path),
                message: err.message.clone(),
            });
        } else if reader.is_missing_data {
            error = Some(StoreError::MissingData {
                owner: selector.owner.to_string(),
            });
        }
    }
    if error.is_some() {
        tracing::debug!("Read of {} failed", selector.owner);
    }
    Snapshot {
        data: if error.is_some() { Value::Null } else { data },
        is_missing_data: reader.is_missing_data,
        seen: reader.seen,
        field_errors: reader.field_errors,
        missing_required_fields: reader.missing_required_fields,
        error,
        selector: selector.clone(),
    }
}

struct Reader<'s> {
    source: &'s dyn RecordSource,
    resolvers: Option<&'s ResolverLayer>,
    owner: &'s RequestIdentifier,
    variables: Variables,
    path: Vec<PathSegment>,
    seen: Dependencies,
    is_missing_data: bool,
    field_errors: Vec<FieldError>,
    missing_required_fields: Vec<String>,
}

impl<'s> Reader<'s> {
    fn new(
        source: &'s dyn RecordSource,
        resolvers: Option<&'s ResolverLayer>,
        owner: &'s RequestIdentifier,
        variables: Variables,
        path: Vec<PathSegment>,
    ) -> Self {
        Reader {
            source,
            resolvers,
            owner,
            variables,
            path,
            seen: Dependencies::new(),
            is_missing_data: false,
            field_errors: Vec::new(),
            missing_required_fields: Vec::new(),
        }
    }

    fn track(&mut self, id: &DataId, key: &str) {
        self.seen
            .entry(id.clone())
            .or_default()
            .insert(key.to_string());
    }

    fn read_record(&mut self, id: &DataId, selections: &[Selection]) -> Result<Value, StoreError> {
        self.seen.entry(id.clone()).or_default();
        let source = self.source;
        match source.get(id) {
            RecordLookup::Existent(record) => {
                let mut out = Map::new();
                self.traverse(selections, record, &mut out)?;
                Ok(Value::Object(out))
            }
            RecordLookup::Nonexistent => Ok(Value::Null),
            RecordLookup::Unknown => {
                self.is_missing_data = true;
                Ok(Value::Null)
            }
        }
    }

    fn traverse(
        &mut self,
        selections: &[Selection],
        record: &Record,
        out: &mut Map<String, Value>,
    ) -> Result<(), StoreError> {
        for selection in selections.iter() {
            match selection {
                Selection::ScalarField(field) => self.read_scalar(field, record, out)?,
                Selection::LinkedField(field) => self.read_linked(field, record, out)?,
                Selection::InlineFragment(fragment) => {
                    self.read_inline_fragment(fragment, record, out)?
                }
                Selection::FragmentSpread(spread) => self.read_spread(spread, record, out)?,
                Selection::Condition(condition) => {
                    if condition.passes(&self.variables) {
                        self.traverse(&condition.selections, record, out)?;
                    }
                }
                Selection::Defer(defer) => self.traverse(&defer.selections, record, out)?,
                Selection::Stream(stream) => self.traverse(&stream.selections, record, out)?,
                Selection::ClientExtension(extension) => {
                    let was_missing = self.is_missing_data;
                    self.traverse(&extension.selections, record, out)?;
                    self.is_missing_data = was_missing;
                }
                Selection::Resolver(field) => self.read_resolver(field, record, out)?,
                Selection::TypeDiscriminator(discriminator) => {
                    self.track(record.id(), &discriminator.abstract_key)
                }
            }
        }
        Ok(())
    }

    fn read_scalar(
        &mut self,
        field: &ScalarField,
        record: &Record,
        out: &mut Map<String, Value>,
    ) -> Result<(), StoreError> {
        let key = field.storage_key(&self.variables);
        let response_key = field.response_key();
        self.track(record.id(), &key);
        let value = match record.get(&key).as_deref() {
            Some(FieldValue::Scalar(value)) => value.clone(),
            Some(other) => {
                tracing::warn!(
                    "Expected a scalar at {}.{key}, found {other:?}",
                    record.id()
                );
                Value::Null
            }
            None => {
                self.is_missing_data = true;
                Value::Null
            }
        };
        self.collect_errors(record, &key, response_key);
        if value.is_null() {
            if let Some(action) = field.required {
                self.required_violation(action, response_key)?;
            }
        }
        out.insert(response_key.to_string(), value);
        Ok(())
    }

    fn read_linked(
        &mut self,
        field: &LinkedField,
        record: &Record,
        out: &mut Map<String, Value>,
    ) -> Result<(), StoreError> {
        let key = field.read_storage_key(&self.variables);
        let response_key = field.response_key();
        self.track(record.id(), &key);
        let value = match record.get(&key).as_deref() {
            None => {
                self.is_missing_data = true;
                Value::Null
            }
            Some(FieldValue::Link { id }) => {
                self.path.push(response_key.into());
                let value = self.read_record(id, &field.selections);
                self.path.pop();
                value?
            }
            Some(FieldValue::Links { ids }) => {
                let mut items = Vec::with_capacity(ids.len());
                for (index, slot) in ids.iter().enumerate() {
                    let item = match slot {
                        None => Value::Null,
                        Some(id) => {
                            self.path.push(response_key.into());
                            self.path.push(index.into());
                            let item = self.read_record(id, &field.selections);
                            self.path.truncate(self.path.len() - 2);
                            item?
                        }
                    };
                    items.push(item);
                }
                Value::Array(items)
            }
            Some(FieldValue::Scalar(Value::Null)) => Value::Null,
            Some(FieldValue::Scalar(other)) => {
                tracing::warn!(
                    "Expected a linked record at {}.{key}, found {other}",
                    record.id()
                );
                Value::Null
            }
        };
        self.collect_errors(record, &key, response_key);
        if value.is_null() {
            if let Some(action) = field.required {
                self.required_violation(action, response_key)?;
            }
        }
        out.insert(response_key.to_string(), value);
        Ok(())
    }

    fn read_inline_fragment(
        &mut self,
        fragment: &InlineFragment,
        record: &Record,
        out: &mut Map<String, Value>,
    ) -> Result<(), StoreError> {
        let applies = match fragment.abstract_key.as_deref() {
            Some(abstract_key) => {
                self.track(record.id(), abstract_key);
                match record.get(abstract_key).as_deref() {
                    Some(FieldValue::Scalar(Value::Bool(implements))) => *implements,
                    None => {
                        self.is_missing_data = true;
                        false
                    }
                    Some(_) => false,
                }
            }
            None => record.typename() == fragment.type_condition,
        };
        match (&fragment.alias, applies) {
            (Some(alias), true) => {
                let mut nested = Map::new();
                self.traverse(&fragment.selections, record, &mut nested)?;
                out.insert(alias.clone(), Value::Object(nested));
            }
            (Some(alias), false) => {
                out.insert(alias.clone(), Value::Null);
            }
            (None, true) => self.traverse(&fragment.selections, record, out)?,
            (None, false) => {}
        }
        Ok(())
    }

    fn read_spread(
        &mut self,
        spread: &FragmentSpread,
        record: &Record,
        out: &mut Map<String, Value>,
    ) -> Result<(), StoreError> {
        if spread.masked {
            let args = Value::Object(spread.local_argument_values(&self.variables));
            let name = spread.fragment.name.clone();
            match &spread.alias {
                Some(alias) => {
                    out.insert(
                        alias.clone(),
                        json!({
                            ID_KEY: record.id().as_str(),
                            FRAGMENTS_KEY: {name: args},
                            FRAGMENT_OWNER_KEY: self.owner.as_str(),
                        }),
                    );
                }
                None => {
                    out.insert(ID_KEY.to_string(), Value::String(record.id().to_string()));
                    let fragments = out
                        .entry(FRAGMENTS_KEY.to_string())
                        .or_insert_with(|| Value::Object(Map::new()));
                    if let Value::Object(fragments) = fragments {
                        fragments.insert(name, args);
                    }
                    out.insert(
                        FRAGMENT_OWNER_KEY.to_string(),
                        Value::String(self.owner.to_string()),
                    );
                }
            }
            return Ok(());
        }

        let scoped = spread.fragment_variables(&self.variables);
        let outer = std::mem::replace(&mut self.variables, scoped);
        let result = match &spread.alias {
            Some(alias) => {
                let mut nested = Map::new();
                let result = self.traverse(&spread.fragment.selections, record, &mut nested);
                out.insert(alias.clone(), Value::Object(nested));
                result
            }
            None => self.traverse(&spread.fragment.selections, record, out),
        };
        self.variables = outer;
        result
    }

    fn read_resolver(
        &mut self,
        field: &ResolverField,
        record: &Record,
        out: &mut Map<String, Value>,
    ) -> Result<(), StoreError> {
        let response_key = field.response_key();
        let Some(resolvers) = self.resolvers else {
            tracing::warn!(
                "No resolver layer available to compute `{response_key}` on {}",
                record.id()
            );
            self.is_missing_data = true;
            out.insert(response_key.to_string(), Value::Null);
            return Ok(());
        };
        let entry =
            resolvers.evaluate(self.source, record.id(), field, &self.variables, self.owner)?;
        for (id, keys) in entry.deps.iter() {
            self.seen
                .entry(id.clone())
                .or_default()
                .extend(keys.iter().cloned());
        }
        if entry.is_missing_data {
            self.is_missing_data = true;
        }
        let value = match (&entry.value, &entry.output, &entry.output_root) {
            (Err(message), _, _) => {
                let mut path = self.path.clone();
                path.push(response_key.into());
                self.field_errors.push(FieldError {
                    message: message.clone(),
                    path,
                    kind: FieldErrorKind::Resolver,
                });
                Value::Null
            }
            (Ok(_), Some(output), Some(root)) if !field.selections.is_empty() => {
                let overlay = OverlaySource::new(output.as_ref(), self.source);
                let mut path = self.path.clone();
                path.push(response_key.into());
                let mut nested = Reader::new(
                    &overlay,
                    self.resolvers,
                    self.owner,
                    self.variables.clone(),
                    path,
                );
                let value = nested.read_record(root, &field.selections)?;
                for (id, keys) in nested.seen.into_iter() {
                    if output.has(&id) {
                        continue;
                    }
                    self.seen.entry(id).or_default().extend(keys);
                }
                self.is_missing_data |= nested.is_missing_data;
                self.field_errors.extend(nested.field_errors);
                self.missing_required_fields
                    .extend(nested.missing_required_fields);
                value
            }
            (Ok(value), _, _) => value.clone(),
        };
        out.insert(response_key.to_string(), value);
        Ok(())
    }

    fn collect_errors(&mut self, record: &Record, key: &str, response_key: &str) {
        let Some(errors) = record.errors(key) else {
            return;
        };
        let mut path = self.path.clone();
        path.push(response_key.into());
        for err in errors.iter() {
            self.field_errors.push(FieldError {
                message: err.message.clone(),
                path: path.clone(),
                kind: err.kind,
            });
        }
    }

    fn required_violation(
        &mut self,
        action: RequiredAction,
        response_key: &str,
    ) -> Result<(), StoreError> {
        let mut path = self.path.clone();
        path.push(response_key.into());
        let path = format_path(&path);
        match action {
            RequiredAction::Throw => Err(StoreError::MissingRequiredField {
                owner: self.owner.to_string(),
                path,
            }),
            RequiredAction::Log => {
                tracing::warn!(
                    "Required field `{path}` is null or missing while reading {}",
                    self.owner
                );
                self.missing_required_fields.push(path);
                Ok(())
            }
            RequiredAction::None => {
                self.missing_required_fields.push(path);
                Ok(())
            }
        }
    }
}
