//! Store module: committed records and the copy-on-write layers used to change them.
//!
//! # Module Organization
//!
//! - [`source`]: Record sources (`RecordSource`, `RecordMap`, overlays, backups)
//! - [`mutator`]: Copy-on-write `RecordSourceMutator` over a read-only base
//! - [`proxy`]: Record accessors for updaters and field handlers
//! - [`subscriptions`]: Dependency-indexed subscription table
//! - [`base`]: The `Store` itself, with publish, notification, retention and GC

mod base;
pub mod mutator;
pub mod proxy;
pub mod source;
pub mod subscriptions;


pub use base::{ChangeSet, Store, UpdatedRecords};
pub use mutator::RecordSourceMutator;
pub use proxy::{RecordProxy, RecordSourceProxy};
pub use source::{
    BackupEntry, MutableRecordSource, OverlaySource, RecordBackup, RecordLookup, RecordMap,
    RecordSource, RecordState,
};
pub use subscriptions::{SnapshotCallback, SubscriptionId, SubscriptionTable};
