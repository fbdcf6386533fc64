//! # gql-store
//!
//! A normalized record store for GraphQL clients.
//!
//! ## Overview
//!
//! Tree-shaped GraphQL responses are flattened into a table of records keyed by identifier, one
//! record per entity, with links between records in place of nesting. Views read tree-shaped
//! snapshots back out of that table and subscribe to them; every write is matched against the
//! fields each snapshot read, so only the subscribers whose data actually changed are re-read and
//! notified.
//!
//! ### Key Features
//!
//! - **Normalization** of query, mutation and subscription payloads, including polymorphic
//!   fragments, field arguments, server field errors, and `@defer` / `@stream` chunks
//! - **Reading** with missing-data tracking, required-field policies, masked fragment references
//!   and throw-on-field-error reads
//! - **Copy-on-write writes**: every change is staged in a sink over the committed store and
//!   published in one step
//! - **Optimistic updates** layered above server data and rolled back exactly
//! - **Client resolvers** computed lazily and cached until their inputs change
//! - **Connections**: cursor pagination merged into a client-side connection record
//! - **Garbage collection** of records no retained operation can reach
//!
//! ## Architecture
//!
//! - **[`store`]**: Record sources, the copy-on-write mutator and proxies, the [`store::Store`]
//!   with its subscription table, retention and GC
//! - **[`normalize`]**: Response payload types and the normalizer
//! - **[`reader`]**: Snapshot reads and their dependency sets
//! - **[`publish`]**: The publish queue, the only path by which writes reach the store
//! - **[`environment`]**: Executions, incremental delivery and optimistic mutations
//! - **[`resolver`]**, **[`handlers`]**, **[`marker`]**, **[`check`]**: resolver fields, field
//!   handlers, reachability marking and availability checks
//! - **[`operation`]**, **[`record`]**, **[`storage_key`]**: the data model
//!
//! ## Quick Start
//!
//! ```rust
//! use gql_store::{
//!     config::StoreConfig,
//!     environment::Environment,
//!     normalize::GraphQLResponse,
//!     operation::OperationDescriptor,
//!     storage_key::Variables,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), gql_store::StoreError> {
//! let query = Arc::new(OperationDescriptor::from_json(json!({
//!     "name": "UserQuery",
//!     "kind": "query",
//!     "readSelections": [{
//!         "kind": "LinkedField", "name": "node",
//!         "args": [{"name": "id", "value": {"literal": "123"}}],
//!         "selections": [
//!             {"kind": "ScalarField", "name": "id"},
//!             {"kind": "ScalarField", "name": "name"}
//!         ]
//!     }],
//!     "normalizationSelections": [{
//!         "kind": "LinkedField", "name": "node",
//!         "args": [{"name": "id", "value": {"literal": "123"}}],
//!         "selections": [
//!             {"kind": "ScalarField", "name": "id"},
//!             {"kind": "ScalarField", "name": "__typename"},
//!             {"kind": "ScalarField", "name": "name"}
//!         ]
//!     }]
//! }))?);
//! let request = query.request(Variables::new())?;
//!
//! let mut environment = Environment::new(StoreConfig::default());
//! let execution = environment.execute(request.clone());
//! environment.on_payload(
//!     execution,
//!     GraphQLResponse::with_data(json!({
//!         "node": {"id": "123", "__typename": "User", "name": "Alice"}
//!     })),
//! )?;
//!
//! let snapshot = environment.lookup(&request.root_selector())?;
//! assert_eq!(snapshot.data, json!({"node": {"id": "123", "name": "Alice"}}));
//! assert!(!snapshot.is_missing_data);
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **default**: The library
//! - **bin**: The `gqlstore` command line tool

pub mod check;
pub mod config;
pub mod environment;
pub mod error;
pub mod event;
pub mod handlers;
pub mod incremental;
pub mod marker;
pub mod normalize;
pub mod operation;
pub mod publish;
pub mod reader;
pub mod record;
pub mod resolver;
pub mod storage_key;
pub mod store;
#[cfg(test)]
mod tests;

pub use error::*;
