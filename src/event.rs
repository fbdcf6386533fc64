use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::{record::DataId, store::SubscriptionId};

/// Indicates which kind of source produced a change to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EventOrigin {
    /// A normalized server payload (query, mutation or subscription response, or an incremental
    /// chunk).
    #[default]
    Server,

    /// An optimistic update, or the rollback of one. These writes are layered above server data
    /// and can be reverted.
    Optimistic,

    /// An imperative updater or a locally committed record source.
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreEvent {
    /// Record ids whose contents changed during one publish run.
    RecordsUpdated(Vec<DataId>, EventOrigin),
    /// Records removed by garbage collection
    RecordsCollected(Vec<DataId>),
    /// Subscriptions whose snapshot changed and whose callback fired
    SubscribersNotified(Vec<SubscriptionId>),
    /// A deferred or streamed chunk was normalized into the store.
    IncrementalApplied { label: String, path: String },
}

impl StoreEvent {
    /// Returns the EventOrigin of this event, or None for events that don't describe writes.
    pub fn origin(&self) -> Option<EventOrigin> {
        match self {
            StoreEvent::RecordsUpdated(_, origin) => Some(*origin),
            StoreEvent::IncrementalApplied { .. } => Some(EventOrigin::Server),
            StoreEvent::RecordsCollected(_) | StoreEvent::SubscribersNotified(_) => None,
        }
    }
}

impl Display for StoreEvent {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            StoreEvent::RecordsUpdated(ids, _) => write!(f, "RecordsUpdated({})", ids.len()),
            StoreEvent::RecordsCollected(ids) => write!(f, "RecordsCollected({})", ids.len()),
            StoreEvent::SubscribersNotified(ids) => {
                write!(f, "SubscribersNotified({})", ids.len())
            }
            StoreEvent::IncrementalApplied { label, path } => {
                write!(f, "IncrementalApplied({label} @ {path})")
            }
        }
    }
}
