//! The publish queue: the only path by which writes reach the store.
//!
//! Writes are queued and applied together by [PublishQueue::run]. Optimistic updates are applied
//! on top of committed data with their original record states captured in a backup. When server
//! data arrives or an optimistic update is reverted, the store is first rolled back to the backup,
//! the committed work is applied, and the surviving optimistic updates are replayed in the order
//! they were applied. Subscribers are notified once per run.

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{Display, Formatter},
    sync::Arc,
};

use crate::{
    error::StoreError,
    event::EventOrigin,
    handlers::HandlerRegistry,
    normalize::ResponsePayload,
    record::DataId,
    store::{
        RecordBackup, RecordMap, RecordSourceMutator, RecordSourceProxy, Store, SubscriptionId,
        UpdatedRecords,
    },
};

/// A one-shot imperative write, run when its payload is committed.
pub type StoreUpdater =
    Box<dyn FnOnce(&mut RecordSourceProxy<'_>) -> Result<(), StoreError> + Send>;

/// A reversible write. It may run several times, once per rebase, so it must be repeatable.
pub type OptimisticUpdater =
    Arc<dyn Fn(&mut RecordSourceProxy<'_>) -> Result<(), StoreError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OptimisticUpdateId(u64);

impl Display for OptimisticUpdateId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "optimistic#{}", self.0)
    }
}

#[derive(Clone)]
pub enum OptimisticUpdate {
    Updater(OptimisticUpdater),
    /// A normalized optimistic response, optionally followed by an updater.
    Payload {
        payload: Arc<ResponsePayload>,
        updater: Option<OptimisticUpdater>,
    },
}

enum PendingWork {
    Payload {
        payload: ResponsePayload,
        updater: Option<StoreUpdater>,
    },
    Updater(StoreUpdater),
    Source(RecordMap),
}

impl PendingWork {
    fn origin(&self) -> EventOrigin {
        match self {
            PendingWork::Payload { .. } => EventOrigin::Server,
            PendingWork::Updater(_) | PendingWork::Source(_) => EventOrigin::Local,
        }
    }
}

/// What one run changed.
#[derive(Debug, Default)]
pub struct RunResult {
    pub updated: Vec<DataId>,
    pub notified: Vec<SubscriptionId>,
    /// Errors from individual writes. A failing write is discarded; the rest of the run proceeds.
    pub errors: Vec<StoreError>,
}

impl RunResult {
    pub fn merge(&mut self, other: RunResult) {
        for id in other.updated.into_iter() {
            if !self.updated.contains(&id) {
                self.updated.push(id);
            }
        }
        for id in other.notified.into_iter() {
            if !self.notified.contains(&id) {
                self.notified.push(id);
            }
        }
        self.errors.extend(other.errors);
    }
}

pub struct PublishQueue {
    store: Store,
    handlers: HandlerRegistry,
    backup: RecordBackup,
    applied: BTreeMap<OptimisticUpdateId, OptimisticUpdate>,
    newly_applied: BTreeSet<OptimisticUpdateId>,
    needs_rebase: bool,
    pending: Vec<PendingWork>,
    next_update: u64,
}

impl PublishQueue {
    pub fn new(store: Store) -> Self {
        PublishQueue::with_handlers(store, HandlerRegistry::default())
    }

    pub fn with_handlers(store: Store, handlers: HandlerRegistry) -> Self {
        PublishQueue {
            store,
            handlers,
            backup: RecordBackup::new(),
            applied: BTreeMap::new(),
            newly_applied: BTreeSet::new(),
            needs_rebase: false,
            pending: Vec::new(),
            next_update: 0,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn handlers_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.handlers
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || !self.newly_applied.is_empty() || self.needs_rebase
    }

    pub fn optimistic_updates(&self) -> impl Iterator<Item = &OptimisticUpdateId> {
        self.applied.keys()
    }

    /// Queue a normalized server payload, with an updater to run after its records and handle
    /// fields are written.
    pub fn commit_payload(&mut self, payload: ResponsePayload, updater: Option<StoreUpdater>) {
        self.pending.push(PendingWork::Payload { payload, updater });
    }

    pub fn commit_update(&mut self, updater: StoreUpdater) {
        self.pending.push(PendingWork::Updater(updater));
    }

    /// Queue raw records to merge into the store.
    pub fn commit_source(&mut self, source: RecordMap) {
        self.pending.push(PendingWork::Source(source));
    }

    pub fn apply_update(&mut self, update: OptimisticUpdate) -> OptimisticUpdateId {
        let id = OptimisticUpdateId(self.next_update);
        self.next_update += 1;
        self.applied.insert(id, update);
        self.newly_applied.insert(id);
        id
    }

    /// Forget an optimistic update. Its writes are rolled back on the next run. Returns false if
    /// the update was not applied.
    pub fn revert_update(&mut self, id: OptimisticUpdateId) -> bool {
        if self.applied.remove(&id).is_none() {
            return false;
        }
        if !self.newly_applied.remove(&id) {
            self.needs_rebase = true;
        }
        true
    }

    /// Apply everything queued since the last run and notify affected subscribers.
    pub fn run(&mut self) -> Result<RunResult, StoreError> {
        let mut result = RunResult::default();
        let mut updated = UpdatedRecords::new();
        let origin = self
            .pending
            .iter()
            .map(PendingWork::origin)
            .min_by_key(|origin| match origin {
                EventOrigin::Server => 0,
                EventOrigin::Local => 1,
                EventOrigin::Optimistic => 2,
            })
            .unwrap_or(EventOrigin::Optimistic);

        let rebase = self.needs_rebase || (!self.pending.is_empty() && !self.backup.is_empty());
        if rebase {
            tracing::debug!("Rolling back {} optimistic updates", self.applied.len());
            updated.merge(self.store.restore_backup(&self.backup));
            self.backup.clear();
        }

        for work in std::mem::take(&mut self.pending).into_iter() {
            match self.commit(work) {
                Ok(changes) => updated.merge(changes),
                Err(err) => {
                    tracing::error!("Discarding a write that failed to commit: {err}");
                    result.errors.push(err);
                }
            }
        }

        let replay = if rebase {
            self.applied.keys().copied().collect::<Vec<_>>()
        } else {
            self.newly_applied.iter().copied().collect::<Vec<_>>()
        };
        for id in replay.into_iter() {
            let Some(update) = self.applied.get(&id).cloned() else {
                continue;
            };
            match self.apply_optimistic(&update) {
                Ok(changes) => updated.merge(changes),
                Err(err) => {
                    tracing::error!("Dropping optimistic update {id}: {err}");
                    self.applied.remove(&id);
                    result.errors.push(err);
                }
            }
        }
        self.newly_applied.clear();
        self.needs_rebase = false;

        self.store.set_gc_hold(!self.applied.is_empty());
        result.updated = updated.ids().cloned().collect();
        result.notified = self.store.notify(&updated, origin);
        Ok(result)
    }

    fn commit(&mut self, work: PendingWork) -> Result<UpdatedRecords, StoreError> {
        let mut proxy = RecordSourceProxy::new(RecordSourceMutator::new(self.store.source(), None));
        let resolver_fields = match work {
            PendingWork::Payload { payload, updater } => {
                proxy.mutator().merge_source(&payload.source)?;
                self.handlers.apply(&mut proxy, &payload.field_payloads)?;
                if let Some(updater) = updater {
                    updater(&mut proxy).map_err(as_updater_error)?;
                }
                payload.resolver_fields
            }
            PendingWork::Updater(updater) => {
                updater(&mut proxy).map_err(as_updater_error)?;
                Vec::new()
            }
            PendingWork::Source(source) => {
                proxy.mutator().merge_source(&source)?;
                Vec::new()
            }
        };
        let sink = proxy.into_mutator().into_sink();
        self.store.resolvers().invalidate_fields(&resolver_fields);
        Ok(self.store.publish(&sink))
    }

    fn apply_optimistic(
        &mut self,
        update: &OptimisticUpdate,
    ) -> Result<UpdatedRecords, StoreError> {
        let mut proxy = RecordSourceProxy::new(RecordSourceMutator::new(
            self.store.source(),
            Some(&mut self.backup),
        ));
        match update {
            OptimisticUpdate::Updater(updater) => {
                updater(&mut proxy).map_err(as_updater_error)?;
            }
            OptimisticUpdate::Payload { payload, updater } => {
                proxy.mutator().merge_source(&payload.source)?;
                self.handlers.apply(&mut proxy, &payload.field_payloads)?;
                if let Some(updater) = updater {
                    updater(&mut proxy).map_err(as_updater_error)?;
                }
            }
        }
        let sink = proxy.into_mutator().into_sink();
        Ok(self.store.publish(&sink))
    }
}

fn as_updater_error(err: StoreError) -> StoreError {
    match err {
        StoreError::Updater(_) => err,
        other => StoreError::Updater(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::StoreConfig, record::ROOT_ID, storage_key::Variables, store::RecordSource};
    use serde_json::json;
    use test_log::test;

    fn queue() -> PublishQueue {
        PublishQueue::new(Store::new(StoreConfig::default(), None))
    }

    fn set_root_name(name: &'static str) -> StoreUpdater {
        Box::new(move |proxy: &mut RecordSourceProxy<'_>| {
            proxy.root()?.set_value("name", &Variables::new(), json!(name))?;
            Ok(())
        })
    }

    fn optimistic_root_name(name: &'static str) -> OptimisticUpdate {
        OptimisticUpdate::Updater(Arc::new(move |proxy: &mut RecordSourceProxy<'_>| {
            proxy.root()?.set_value("name", &Variables::new(), json!(name))?;
            Ok(())
        }))
    }

    fn root_name(queue: &PublishQueue) -> Option<serde_json::Value> {
        queue
            .store()
            .source()
            .get(&DataId::from(ROOT_ID))
            .record()
            .and_then(|record| record.field("name").cloned())
            .and_then(|value| value.as_scalar().cloned())
    }

    #[test]
    fn commit_update_writes_through_proxy() {
        let mut queue = queue();
        queue.commit_update(set_root_name("committed"));
        let result = queue.run().unwrap();
        assert_eq!(result.updated, vec![DataId::from(ROOT_ID)]);
        assert_eq!(root_name(&queue), Some(json!("committed")));
    }

    #[test]
    fn optimistic_update_reverts_to_committed_value() {
        let mut queue = queue();
        queue.commit_update(set_root_name("server"));
        queue.run().unwrap();

        let id = queue.apply_update(optimistic_root_name("optimistic"));
        queue.run().unwrap();
        assert_eq!(root_name(&queue), Some(json!("optimistic")));

        assert!(queue.revert_update(id));
        queue.run().unwrap();
        assert_eq!(root_name(&queue), Some(json!("server")));
        assert!(!queue.revert_update(id));
    }

    #[test]
    fn server_write_is_rebased_under_optimistic_update() {
        let mut queue = queue();
        let id = queue.apply_update(optimistic_root_name("optimistic"));
        queue.run().unwrap();

        queue.commit_update(set_root_name("server"));
        queue.run().unwrap();
        assert_eq!(root_name(&queue), Some(json!("optimistic")));

        queue.revert_update(id);
        queue.run().unwrap();
        assert_eq!(root_name(&queue), Some(json!("server")));
    }

    #[test]
    fn failing_updater_is_discarded() {
        let mut queue = queue();
        queue.commit_update(Box::new(|proxy: &mut RecordSourceProxy<'_>| {
            proxy.root()?.set_value("name", &Variables::new(), json!("partial"))?;
            Err(StoreError::Updater("boom".to_string()))
        }));
        queue.commit_update(set_root_name("kept"));
        let result = queue.run().unwrap();
        assert_eq!(result.errors, vec![StoreError::Updater("boom".to_string())]);
        assert_eq!(root_name(&queue), Some(json!("kept")));
    }

    #[test]
    fn revert_before_run_never_touches_store() {
        let mut queue = queue();
        let id = queue.apply_update(optimistic_root_name("never"));
        queue.revert_update(id);
        let result = queue.run().unwrap();
        assert!(result.updated.is_empty());
        assert_eq!(root_name(&queue), None);
    }

    #[test]
    fn committed_sources_merge_into_existing_records() {
        let mut queue = queue();
        queue.commit_update(set_root_name("server"));
        queue.run().unwrap();

        let mut root = crate::record::Record::new(DataId::from(ROOT_ID), "__Root");
        root.set("theme", crate::record::FieldValue::Scalar(json!("dark")));
        queue.commit_source([root].into_iter().collect());
        let result = queue.run().unwrap();
        assert_eq!(result.updated, vec![DataId::from(ROOT_ID)]);
        assert_eq!(root_name(&queue), Some(json!("server")));
        let theme = queue
            .store()
            .source()
            .get(&DataId::from(ROOT_ID))
            .record()
            .and_then(|record| record.field("theme").cloned());
        assert_eq!(theme, Some(crate::record::FieldValue::Scalar(json!("dark"))));
    }
}
