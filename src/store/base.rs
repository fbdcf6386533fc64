use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::Arc,
};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    check::{check, Availability},
    config::StoreConfig,
    error::StoreError,
    event::{EventOrigin, StoreEvent},
    marker::mark,
    operation::{OperationRequest, ReaderSelector, RequestIdentifier},
    reader::{read, read_snapshot, Dependencies, Snapshot},
    record::{DataId, Record, ROOT_ID, ROOT_TYPE},
    resolver::ResolverLayer,
    store::{
        source::{
            BackupEntry, MutableRecordSource, RecordBackup, RecordLookup, RecordMap, RecordSource,
        },
        subscriptions::{SnapshotCallback, SubscriptionId, SubscriptionTable},
    },
};

/// What changed about one record during a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeSet {
    /// The record was created, deleted, or replaced wholesale.
    All,
    /// Only these storage keys changed.
    Fields(BTreeSet<String>),
}

/// The union of record changes produced by one or more publishes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatedRecords(BTreeMap<DataId, ChangeSet>);

impl UpdatedRecords {
    pub fn new() -> Self {
        UpdatedRecords::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = &DataId> {
        self.0.keys()
    }

    pub fn get(&self, id: &DataId) -> Option<&ChangeSet> {
        self.0.get(id)
    }

    pub fn insert_all(&mut self, id: DataId) {
        self.0.insert(id, ChangeSet::All);
    }

    pub fn insert_fields<I: IntoIterator<Item = String>>(&mut self, id: DataId, keys: I) {
        let mut keys = keys.into_iter().peekable();
        if keys.peek().is_none() {
            return;
        }
        match self.0.entry(id).or_insert_with(|| ChangeSet::Fields(BTreeSet::new())) {
            ChangeSet::All => {}
            ChangeSet::Fields(fields) => fields.extend(keys),
        }
    }

    pub fn merge(&mut self, other: UpdatedRecords) {
        for (id, change) in other.0.into_iter() {
            match change {
                ChangeSet::All => self.insert_all(id),
                ChangeSet::Fields(fields) => self.insert_fields(id, fields),
            }
        }
    }

    /// True if any recorded dependency was touched. A dependency on a record with no specific
    /// fields (a link to a missing or deleted record) only matches wholesale changes.
    pub fn intersects(&self, deps: &Dependencies) -> bool {
        deps.iter().any(|(id, keys)| match self.0.get(id) {
            None => false,
            Some(ChangeSet::All) => true,
            Some(ChangeSet::Fields(fields)) => keys.iter().any(|key| fields.contains(key)),
        })
    }
}

#[derive(Debug, Clone)]
struct RetainedRoot {
    selector: ReaderSelector,
    request: OperationRequest,
    ref_count: usize,
}

/// The committed record store with its subscriptions, retained roots and resolver cache.
///
/// Writes only reach the store through [Store::publish] and [Store::restore_backup], both driven
/// by the publish queue; every write is followed by [Store::notify].
pub struct Store {
    source: RecordMap,
    subscriptions: SubscriptionTable,
    roots: BTreeMap<RequestIdentifier, RetainedRoot>,
    release_buffer: VecDeque<RequestIdentifier>,
    resolvers: Arc<ResolverLayer>,
    config: StoreConfig,
    tx: Option<UnboundedSender<StoreEvent>>,
    gc_hold: bool,
    gc_scheduled: bool,
}

impl Store {
    pub fn new(config: StoreConfig, tx: Option<UnboundedSender<StoreEvent>>) -> Self {
        Store::from_records(RecordMap::new(), config, tx)
    }

    /// Rehydrate a store from a persisted record table. The root record is created if the table
    /// doesn't contain one.
    pub fn from_records(
        mut source: RecordMap,
        config: StoreConfig,
        tx: Option<UnboundedSender<StoreEvent>>,
    ) -> Self {
        let root = DataId::root();
        if source.get(&root).record().is_none() {
            source.set(root.clone(), Record::new(root, ROOT_TYPE));
        }
        Store {
            source,
            subscriptions: SubscriptionTable::new(),
            roots: BTreeMap::new(),
            release_buffer: VecDeque::new(),
            resolvers: Arc::new(ResolverLayer::new()),
            config,
            tx,
            gc_hold: false,
            gc_scheduled: false,
        }
    }

    pub fn source(&self) -> &RecordMap {
        &self.source
    }

    /// The persisted form of the store.
    pub fn records(&self) -> &RecordMap {
        &self.source
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn resolvers(&self) -> &Arc<ResolverLayer> {
        &self.resolvers
    }

    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    pub fn lookup(&self, selector: &ReaderSelector) -> Result<Snapshot, StoreError> {
        read(&self.source, selector, Some(self.resolvers.as_ref()))
    }

    pub fn check(&self, request: &OperationRequest) -> Availability {
        check(
            &self.source,
            &request.root_id(),
            request.normalization_selections(),
            &request.variables,
        )
    }

    pub fn subscribe(&mut self, snapshot: Snapshot, callback: SnapshotCallback) -> SubscriptionId {
        let id = self.subscriptions.insert(snapshot, callback);
        tracing::debug!("Subscribed {id}");
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscriptions.remove(id)
    }

    /// Merge a sink of (possibly partial) records into the store.
    pub(crate) fn publish(&mut self, sink: &RecordMap) -> UpdatedRecords {
        let mut updated = UpdatedRecords::new();
        for (id, slot) in sink.iter() {
            match slot {
                None => {
                    if self.source.get(id) != RecordLookup::Nonexistent {
                        self.source.delete(id);
                        updated.insert_all(id.clone());
                    }
                }
                Some(partial) => match self.source.get_mut(id) {
                    Some(existing) => {
                        let changed = existing.update(partial);
                        updated.insert_fields(id.clone(), changed);
                    }
                    None => {
                        self.source.set(id.clone(), partial.clone());
                        updated.insert_all(id.clone());
                    }
                },
            }
        }
        updated
    }

    /// Put every record captured in `backup` back to its captured state.
    pub(crate) fn restore_backup(&mut self, backup: &RecordBackup) -> UpdatedRecords {
        let mut updated = UpdatedRecords::new();
        for (id, entry) in backup.entries() {
            let unchanged = match (entry, self.source.get(id)) {
                (BackupEntry::Existent(saved), RecordLookup::Existent(current)) => saved == current,
                (BackupEntry::Nonexistent, RecordLookup::Nonexistent) => true,
                (BackupEntry::Unknown, RecordLookup::Unknown) => true,
                _ => false,
            };
            if unchanged {
                continue;
            }
            match entry {
                BackupEntry::Existent(saved) => self.source.set(id.clone(), saved.clone()),
                BackupEntry::Nonexistent => self.source.delete(id),
                BackupEntry::Unknown => self.source.remove(id),
            }
            updated.insert_all(id.clone());
        }
        updated
    }

    /// Re-read every subscription affected by `updated` and deliver the snapshots that changed.
    pub(crate) fn notify(
        &mut self,
        updated: &UpdatedRecords,
        origin: EventOrigin,
    ) -> Vec<SubscriptionId> {
        if updated.is_empty() {
            return Vec::new();
        }
        self.resolvers.invalidate(updated);
        let mut notified = Vec::new();
        for id in self.subscriptions.affected(updated) {
            let Some(previous) = self.subscriptions.snapshot(id) else {
                continue;
            };
            let snapshot = read_snapshot(
                &self.source,
                &previous.selector,
                Some(self.resolvers.as_ref()),
            );
            if let Some(err) = snapshot.error.as_ref() {
                tracing::debug!("Re-read of {id} failed: {err}");
            }
            let changed = !snapshot.same_result(previous);
            self.subscriptions.replace(id, snapshot, changed);
            if changed {
                notified.push(id);
            }
        }
        tracing::debug!(
            "Published {} changed records, notified {} of {} subscriptions",
            updated.len(),
            notified.len(),
            self.subscriptions.len()
        );
        self.emit(StoreEvent::RecordsUpdated(
            updated.ids().cloned().collect(),
            origin,
        ));
        if !notified.is_empty() {
            self.emit(StoreEvent::SubscribersNotified(notified.clone()));
        }
        notified
    }

    /// Send `event` to the event channel, if any. Events never fail a write: once the receiver is
    /// gone the channel is dropped and later events are discarded.
    pub(crate) fn emit(&mut self, event: StoreEvent) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        if let Err(err) = tx.send(event) {
            tracing::warn!("Dropping the store event channel: {}", StoreError::from(err));
            self.tx = None;
        }
    }

    /// Keep the records reachable from `request` alive across garbage collection. Retaining the
    /// same request twice requires two releases.
    pub fn retain(&mut self, request: &OperationRequest) -> RequestIdentifier {
        let identifier = request.identifier.clone();
        let root = self
            .roots
            .entry(identifier.clone())
            .or_insert_with(|| RetainedRoot {
                selector: request.root_selector(),
                request: request.clone(),
                ref_count: 0,
            });
        root.ref_count += 1;
        self.release_buffer.retain(|buffered| buffered != &identifier);
        identifier
    }

    /// Drop one retain. Roots whose count reaches zero stay in the release buffer until it
    /// overflows; evicting a root schedules a collection.
    pub fn release(&mut self, identifier: &RequestIdentifier) {
        let Some(root) = self.roots.get_mut(identifier) else {
            tracing::warn!("Released {identifier}, which is not retained");
            return;
        };
        root.ref_count = root.ref_count.saturating_sub(1);
        if root.ref_count > 0 {
            return;
        }
        self.release_buffer.push_back(identifier.clone());
        let mut evicted = false;
        while self.release_buffer.len() > self.config.gc_release_buffer_size {
            if let Some(oldest) = self.release_buffer.pop_front() {
                if self.roots.get(&oldest).is_some_and(|root| root.ref_count == 0) {
                    self.roots.remove(&oldest);
                    evicted = true;
                }
            }
        }
        if evicted {
            self.gc();
        }
    }

    pub fn is_retained(&self, identifier: &RequestIdentifier) -> bool {
        self.roots.contains_key(identifier)
    }

    /// Hold collections while optimistic writes are in the store; a collection requested during
    /// the hold runs when it is lifted.
    pub(crate) fn set_gc_hold(&mut self, hold: bool) {
        self.gc_hold = hold;
        if !hold && self.gc_scheduled {
            self.gc();
        }
    }

    /// Remove every record not reachable from a retained root. Returns the collected ids.
    pub fn gc(&mut self) -> Vec<DataId> {
        if !self.config.gc_enabled {
            return Vec::new();
        }
        if self.gc_hold {
            tracing::debug!("Deferring garbage collection while optimistic updates are applied");
            self.gc_scheduled = true;
            return Vec::new();
        }
        self.gc_scheduled = false;
        let mut references = BTreeSet::from([DataId::from(ROOT_ID)]);
        for root in self.roots.values() {
            mark(
                &self.source,
                &root.selector.data_id,
                root.request.normalization_selections(),
                &root.request.variables,
                &mut references,
            );
        }
        let collected = self
            .source
            .record_ids()
            .into_iter()
            .filter(|id| !references.contains(id))
            .collect::<Vec<_>>();
        for id in collected.iter() {
            self.source.remove(id);
        }
        if !collected.is_empty() {
            tracing::debug!("Collected {} unreachable records", collected.len());
            self.emit(StoreEvent::RecordsCollected(collected.clone()));
        }
        collected
    }
}
