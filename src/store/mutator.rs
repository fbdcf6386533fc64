//! Copy-on-write overlay over a read-only base source.
//!
//! Reads check the sink first and fall back to the base; writes always land in the sink. Sink
//! records are partial: they hold only the fields written during this pass, and are merged into
//! the base when the sink is published. Dropping the mutator discards every write.

use std::collections::BTreeSet;

use crate::{
    error::StoreError,
    record::{DataId, FieldValue, Record, CLIENT_ID_PREFIX},
    store::source::{
        MutableRecordSource, RecordBackup, RecordLookup, RecordMap, RecordSource, RecordState,
    },
};

pub struct RecordSourceMutator<'a> {
    base: &'a dyn RecordSource,
    sink: RecordMap,
    backup: Option<&'a mut RecordBackup>,
}

impl<'a> RecordSourceMutator<'a> {
    /// When `backup` is given, the base state of every record is captured before its first write
    /// so the writes can later be rolled back.
    pub fn new(base: &'a dyn RecordSource, backup: Option<&'a mut RecordBackup>) -> Self {
        RecordSourceMutator {
            base,
            sink: RecordMap::new(),
            backup,
        }
    }

    pub fn base(&self) -> &dyn RecordSource {
        self.base
    }

    pub fn sink(&self) -> &RecordMap {
        &self.sink
    }

    pub fn into_sink(self) -> RecordMap {
        self.sink
    }

    pub fn status(&self, id: &DataId) -> RecordState {
        match self.sink.get(id) {
            RecordLookup::Unknown => self.base.status(id),
            known => known.state(),
        }
    }

    pub fn get_type(&self, id: &DataId) -> Option<&str> {
        match self.sink.get(id) {
            RecordLookup::Existent(record) => Some(record.typename()),
            RecordLookup::Nonexistent => None,
            RecordLookup::Unknown => self.base.get(id).record().map(|record| record.typename()),
        }
    }

    /// Current value of a field: `None` when undefined (or the record doesn't exist).
    pub fn get_value(&self, id: &DataId, key: &str) -> Option<FieldValue> {
        match self.sink.get(id) {
            RecordLookup::Existent(record) if record.has(key) => {
                record.get(key).map(|value| value.into_owned())
            }
            RecordLookup::Nonexistent => None,
            _ => self
                .base
                .get(id)
                .record()
                .and_then(|record| record.get(key))
                .map(|value| value.into_owned()),
        }
    }

    pub fn get_linked_record_id(&self, id: &DataId, key: &str) -> Option<Option<DataId>> {
        match self.get_value(id, key)? {
            FieldValue::Link { id } => Some(Some(id)),
            FieldValue::Scalar(value) if value.is_null() => Some(None),
            other => {
                tracing::warn!("Expected {id}.{key} to be a linked record, found {other:?}");
                None
            }
        }
    }

    pub fn get_linked_record_ids(
        &self,
        id: &DataId,
        key: &str,
    ) -> Option<Option<Vec<Option<DataId>>>> {
        match self.get_value(id, key)? {
            FieldValue::Links { ids } => Some(Some(ids)),
            FieldValue::Scalar(value) if value.is_null() => Some(None),
            other => {
                tracing::warn!("Expected {id}.{key} to be plural linked records, found {other:?}");
                None
            }
        }
    }

    /// Every field known for a record, sink values overriding base values.
    pub fn merged_record(&self, id: &DataId) -> Option<Record> {
        let sink = self.sink.slot(id);
        if let Some(None) = sink {
            return None;
        }
        let mut merged = self.base.get(id).record().cloned();
        if let Some(Some(partial)) = sink {
            match merged.as_mut() {
                Some(record) => {
                    record.update(partial);
                }
                None => merged = Some(partial.clone()),
            }
        }
        merged
    }

    fn backup(&mut self, id: &DataId) {
        if let Some(backup) = self.backup.as_deref_mut() {
            backup.capture(id, self.base);
        }
    }

    /// The sink copy of a record, created (as an empty partial record) on first write.
    fn sink_record_mut(&mut self, id: &DataId) -> Result<&mut Record, StoreError> {
        match self.sink.slot(id) {
            Some(Some(_)) => {}
            Some(None) => {
                return Err(StoreError::NotFound(format!(
                    "Cannot write to deleted record {id}"
                )))
            }
            None => {
                let typename = match self.base.get(id) {
                    RecordLookup::Existent(record) => record.typename().to_string(),
                    _ => {
                        return Err(StoreError::NotFound(format!(
                            "Cannot write to unknown record {id}"
                        )))
                    }
                };
                self.backup(id);
                self.sink.set(id.clone(), Record::new(id.clone(), typename));
            }
        }
        self.sink
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("Record {id} vanished from the sink")))
    }

    pub fn create(&mut self, id: &DataId, typename: &str) -> Result<(), StoreError> {
        if self.status(id) == RecordState::Existent {
            return Err(StoreError::InvalidOperation(format!(
                "Cannot create record {id}, it already exists"
            )));
        }
        self.backup(id);
        self.sink.set(id.clone(), Record::new(id.clone(), typename));
        Ok(())
    }

    /// Create the record if it doesn't exist; otherwise leave it untouched.
    pub fn ensure(&mut self, id: &DataId, typename: &str) -> Result<(), StoreError> {
        match self.status(id) {
            RecordState::Existent => {
                if let Some(existing) = self.get_type(id) {
                    if existing != typename {
                        tracing::warn!(
                            "Record {id} was normalized as {typename} but is stored as {existing}"
                        );
                    }
                }
                Ok(())
            }
            _ => self.create(id, typename),
        }
    }

    pub fn delete(&mut self, id: &DataId) {
        self.backup(id);
        self.sink.delete(id);
    }

    pub fn set_value(
        &mut self,
        id: &DataId,
        key: &str,
        value: FieldValue,
    ) -> Result<(), StoreError> {
        self.sink_record_mut(id)?.set(key, value);
        Ok(())
    }

    pub fn set_errors(
        &mut self,
        id: &DataId,
        key: &str,
        errors: Vec<crate::record::FieldError>,
    ) -> Result<(), StoreError> {
        self.sink_record_mut(id)?.set_errors(key, errors);
        Ok(())
    }

    pub fn set_linked_record_id(
        &mut self,
        id: &DataId,
        key: &str,
        linked: &DataId,
    ) -> Result<(), StoreError> {
        self.set_value(id, key, FieldValue::link(linked.clone()))
    }

    pub fn set_linked_record_ids(
        &mut self,
        id: &DataId,
        key: &str,
        linked: Vec<Option<DataId>>,
    ) -> Result<(), StoreError> {
        self.set_value(id, key, FieldValue::links(linked))
    }

    /// Copy every field of `source_id` onto `sink_id`, leaving other fields of the sink alone.
    pub fn copy_fields(&mut self, source_id: &DataId, sink_id: &DataId) -> Result<(), StoreError> {
        let source = self
            .merged_record(source_id)
            .ok_or_else(|| StoreError::NotFound(format!("Cannot copy fields from {source_id}")))?;
        self.copy_fields_from_record(&source, sink_id)
    }

    pub fn copy_fields_from_record(
        &mut self,
        source: &Record,
        sink_id: &DataId,
    ) -> Result<(), StoreError> {
        let sink = self.sink_record_mut(sink_id)?;
        for (key, value) in source.fields().iter() {
            sink.set(key, value.clone());
            if let Some(errors) = source.errors(key) {
                sink.set_errors(key, errors.to_vec());
            }
        }
        Ok(())
    }

    /// Copy `source_id` onto `sink_id`, and re-derive every client-id record owned by the source
    /// (its id starts with `client:<source_id>:`) under the sink's namespace, copying it too and
    /// rewriting the links. Used when a record is renamed, such as an optimistic id replaced by a
    /// server id.
    pub fn copy_fields_with_linked_record_ids(
        &mut self,
        source_id: &DataId,
        sink_id: &DataId,
    ) -> Result<(), StoreError> {
        let mut visited = BTreeSet::new();
        self.copy_renamed(source_id, sink_id, source_id, sink_id, &mut visited)
    }

    fn copy_renamed(
        &mut self,
        from: &DataId,
        to: &DataId,
        root_from: &DataId,
        root_to: &DataId,
        visited: &mut BTreeSet<DataId>,
    ) -> Result<(), StoreError> {
        if !visited.insert(from.clone()) {
            return Ok(());
        }
        let source = self
            .merged_record(from)
            .ok_or_else(|| StoreError::NotFound(format!("Cannot copy fields from {from}")))?;
        let from_prefix = owned_prefix(root_from);
        let to_prefix = owned_prefix(root_to);
        let rename = |id: &DataId| -> Option<DataId> {
            id.as_str()
                .strip_prefix(&from_prefix)
                .filter(|rest| rest.starts_with(':'))
                .map(|rest| DataId::new(format!("{to_prefix}{rest}")))
        };

        self.ensure(to, source.typename())?;
        let mut children = Vec::new();
        for (key, value) in source.fields().iter() {
            let renamed = match value {
                FieldValue::Link { id } => match rename(id) {
                    Some(new_id) => {
                        children.push((id.clone(), new_id.clone()));
                        FieldValue::link(new_id)
                    }
                    None => value.clone(),
                },
                FieldValue::Links { ids } => FieldValue::links(
                    ids.iter()
                        .map(|maybe_id| {
                            maybe_id.as_ref().map(|id| match rename(id) {
                                Some(new_id) => {
                                    children.push((id.clone(), new_id.clone()));
                                    new_id
                                }
                                None => id.clone(),
                            })
                        })
                        .collect(),
                ),
                FieldValue::Scalar(_) => value.clone(),
            };
            self.set_value(to, key, renamed)?;
        }
        for (child_from, child_to) in children {
            if self.status(&child_from) == RecordState::Existent {
                self.copy_renamed(&child_from, &child_to, root_from, root_to, visited)?;
            }
        }
        Ok(())
    }

    /// Write every record of `source` through this mutator: tombstones delete, records merge
    /// field by field (creating records this mutator doesn't know yet).
    pub fn merge_source(&mut self, source: &RecordMap) -> Result<(), StoreError> {
        for (id, slot) in source.iter() {
            match slot {
                None => self.delete(id),
                Some(record) => {
                    if self.status(id) != RecordState::Existent {
                        self.create(id, record.typename())?;
                    } else if self.get_type(id) != Some(record.typename()) {
                        self.set_value(
                            id,
                            crate::record::TYPENAME_KEY,
                            FieldValue::Scalar(record.typename().into()),
                        )?;
                    }
                    self.copy_fields_from_record(record, id)?;
                }
            }
        }
        Ok(())
    }
}

/// Prefix shared by client ids derived from `id`: `client:<id>` (or `<id>` when `id` is itself a
/// client id).
fn owned_prefix(id: &DataId) -> String {
    if id.is_client() {
        id.to_string()
    } else {
        format!("{CLIENT_ID_PREFIX}{id}")
    }
}
