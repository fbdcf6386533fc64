//! Record sources: keyed tables of records.
//!
//! A source distinguishes three states per identifier. A record that was deleted is kept as a
//! tombstone so that readers can render links to it as null, while an identifier that was never
//! seen renders as missing data.

use serde::{Deserialize, Serialize};
use std::collections::{btree_map::Iter, BTreeMap, BTreeSet};

use crate::record::{DataId, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordState {
    Existent,
    Nonexistent,
    Unknown,
}

/// A record slot as seen through a source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecordLookup<'a> {
    Existent(&'a Record),
    /// Deleted: a tombstone.
    Nonexistent,
    /// Never seen.
    Unknown,
}

impl<'a> RecordLookup<'a> {
    pub fn state(&self) -> RecordState {
        match self {
            RecordLookup::Existent(_) => RecordState::Existent,
            RecordLookup::Nonexistent => RecordState::Nonexistent,
            RecordLookup::Unknown => RecordState::Unknown,
        }
    }

    pub fn record(&self) -> Option<&'a Record> {
        match self {
            RecordLookup::Existent(record) => Some(record),
            _ => None,
        }
    }
}

pub trait RecordSource {
    fn get(&self, id: &DataId) -> RecordLookup<'_>;

    fn record_ids(&self) -> BTreeSet<DataId>;

    fn size(&self) -> usize;

    fn status(&self, id: &DataId) -> RecordState {
        self.get(id).state()
    }

    /// True if the id is known to the source, either as a record or as a tombstone.
    fn has(&self, id: &DataId) -> bool {
        !matches!(self.get(id), RecordLookup::Unknown)
    }
}

pub trait MutableRecordSource: RecordSource {
    fn set(&mut self, id: DataId, record: Record);

    /// Replace the record with a tombstone.
    fn delete(&mut self, id: &DataId);

    /// Forget the id entirely, returning it to the unknown state.
    fn remove(&mut self, id: &DataId);

    fn clear(&mut self);
}

/// The in-memory record table. Serializes as a plain map of `id -> record | null`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordMap(BTreeMap<DataId, Option<Record>>);

impl RecordMap {
    pub fn new() -> Self {
        RecordMap(BTreeMap::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, DataId, Option<Record>> {
        self.0.iter()
    }

    pub fn get_mut(&mut self, id: &DataId) -> Option<&mut Record> {
        self.0.get_mut(id).and_then(|slot| slot.as_mut())
    }

    /// Raw slot access: `None` when unknown, `Some(None)` for a tombstone.
    pub(crate) fn slot(&self, id: &DataId) -> Option<&Option<Record>> {
        self.0.get(id)
    }

    pub fn to_json(&self) -> Result<serde_json::Value, crate::StoreError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self, crate::StoreError> {
        Ok(serde_json::from_value(value)?)
    }
}

impl FromIterator<Record> for RecordMap {
    fn from_iter<T: IntoIterator<Item = Record>>(iter: T) -> Self {
        RecordMap(
            iter.into_iter()
                .map(|record| (record.id().clone(), Some(record)))
                .collect(),
        )
    }
}

impl RecordSource for RecordMap {
    fn get(&self, id: &DataId) -> RecordLookup<'_> {
        match self.0.get(id) {
            Some(Some(record)) => RecordLookup::Existent(record),
            Some(None) => RecordLookup::Nonexistent,
            None => RecordLookup::Unknown,
        }
    }

    fn record_ids(&self) -> BTreeSet<DataId> {
        self.0.keys().cloned().collect()
    }

    fn size(&self) -> usize {
        self.0.len()
    }
}

impl MutableRecordSource for RecordMap {
    fn set(&mut self, id: DataId, record: Record) {
        self.0.insert(id, Some(record));
    }

    fn delete(&mut self, id: &DataId) {
        self.0.insert(id.clone(), None);
    }

    fn remove(&mut self, id: &DataId) {
        self.0.remove(id);
    }

    fn clear(&mut self) {
        self.0.clear();
    }
}

/// Reads `top` first and falls back to `base` for ids `top` doesn't know.
pub struct OverlaySource<'a> {
    top: &'a dyn RecordSource,
    base: &'a dyn RecordSource,
}

impl<'a> OverlaySource<'a> {
    pub fn new(top: &'a dyn RecordSource, base: &'a dyn RecordSource) -> Self {
        OverlaySource { top, base }
    }
}

impl RecordSource for OverlaySource<'_> {
    fn get(&self, id: &DataId) -> RecordLookup<'_> {
        match self.top.get(id) {
            RecordLookup::Unknown => self.base.get(id),
            known => known,
        }
    }

    fn record_ids(&self) -> BTreeSet<DataId> {
        let mut ids = self.base.record_ids();
        ids.extend(self.top.record_ids());
        ids
    }

    fn size(&self) -> usize {
        self.record_ids().len()
    }
}

/// Prior state of a record, captured the first time an optimistic write touches it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackupEntry {
    Existent(Record),
    Nonexistent,
    Unknown,
}

/// The pre-optimistic versions of every record touched by applied optimistic updates.
/// Restoring it returns those records to their server-confirmed state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordBackup(BTreeMap<DataId, BackupEntry>);

impl RecordBackup {
    pub fn new() -> Self {
        RecordBackup(BTreeMap::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: &DataId) -> bool {
        self.0.contains_key(id)
    }

    /// Capture the state of `id` in `source`, unless an earlier capture exists.
    pub fn capture(&mut self, id: &DataId, source: &dyn RecordSource) {
        if self.0.contains_key(id) {
            return;
        }
        let entry = match source.get(id) {
            RecordLookup::Existent(record) => BackupEntry::Existent(record.clone()),
            RecordLookup::Nonexistent => BackupEntry::Nonexistent,
            RecordLookup::Unknown => BackupEntry::Unknown,
        };
        self.0.insert(id.clone(), entry);
    }

    pub fn ids(&self) -> impl Iterator<Item = &DataId> {
        self.0.keys()
    }

    pub fn entries(&self) -> Iter<'_, DataId, BackupEntry> {
        self.0.iter()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}
