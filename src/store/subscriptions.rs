//! Dependency-indexed subscription table.
//!
//! Each subscription holds the last snapshot delivered to its callback. The table keeps a reverse
//! index from record id to the subscriptions whose snapshot read that record, so that a publish
//! only re-reads the subscriptions its changes can affect.

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Display},
};

use crate::{reader::Snapshot, record::DataId, store::UpdatedRecords};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

pub type SnapshotCallback = Box<dyn FnMut(&Snapshot) + Send>;

struct Subscription {
    snapshot: Snapshot,
    callback: SnapshotCallback,
}

#[derive(Default)]
pub struct SubscriptionTable {
    next_id: u64,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    by_record: BTreeMap<DataId, BTreeSet<SubscriptionId>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        SubscriptionTable::default()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.subscriptions.contains_key(&id)
    }

    pub fn insert(&mut self, snapshot: Snapshot, callback: SnapshotCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.index(id, &snapshot);
        self.subscriptions
            .insert(id, Subscription { snapshot, callback });
        id
    }

    /// Returns false if the subscription was already gone.
    pub fn remove(&mut self, id: SubscriptionId) -> bool {
        match self.subscriptions.remove(&id) {
            Some(subscription) => {
                self.unindex(id, &subscription.snapshot);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self, id: SubscriptionId) -> Option<&Snapshot> {
        self.subscriptions.get(&id).map(|sub| &sub.snapshot)
    }

    /// Subscriptions whose last snapshot read a field that changed.
    pub fn affected(&self, updated: &UpdatedRecords) -> Vec<SubscriptionId> {
        let mut candidates = BTreeSet::new();
        for id in updated.ids() {
            if let Some(subs) = self.by_record.get(id) {
                candidates.extend(subs.iter().copied());
            }
        }
        candidates
            .into_iter()
            .filter(|id| {
                self.subscriptions
                    .get(id)
                    .is_some_and(|sub| updated.intersects(&sub.snapshot.seen))
            })
            .collect()
    }

    /// Swap in a fresh snapshot, re-indexing its dependencies. When `deliver` is set the
    /// subscription's callback is invoked with the new snapshot.
    pub fn replace(&mut self, id: SubscriptionId, snapshot: Snapshot, deliver: bool) {
        let Some(mut subscription) = self.subscriptions.remove(&id) else {
            return;
        };
        self.unindex(id, &subscription.snapshot);
        self.index(id, &snapshot);
        if deliver {
            (subscription.callback)(&snapshot);
        }
        subscription.snapshot = snapshot;
        self.subscriptions.insert(id, subscription);
    }

    fn index(&mut self, id: SubscriptionId, snapshot: &Snapshot) {
        for record in snapshot.seen.keys() {
            self.by_record.entry(record.clone()).or_default().insert(id);
        }
    }

    fn unindex(&mut self, id: SubscriptionId, snapshot: &Snapshot) {
        for record in snapshot.seen.keys() {
            if let Some(subs) = self.by_record.get_mut(record) {
                subs.remove(&id);
                if subs.is_empty() {
                    self.by_record.remove(record);
                }
            }
        }
    }
}
