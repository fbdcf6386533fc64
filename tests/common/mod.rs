//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use gql_store::{
    config::StoreConfig,
    environment::Environment,
    operation::{OperationDescriptor, OperationRequest},
    record::DataId,
    storage_key::Variables,
    store::RecordSource,
};
use serde_json::{json, Value};
use std::sync::Arc;

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times; subsequent calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

#[allow(dead_code)]
pub fn environment() -> Environment {
    init_logging();
    Environment::new(StoreConfig::default())
}

/// Build a descriptor from JSON. When `normalizationSelections` is omitted the read selections
/// are used for both.
#[allow(dead_code)]
pub fn operation(mut value: Value) -> Arc<OperationDescriptor> {
    if value.get("normalizationSelections").is_none() {
        let read = value["readSelections"].clone();
        value["normalizationSelections"] = read;
    }
    Arc::new(OperationDescriptor::from_json(value).unwrap())
}

#[allow(dead_code)]
pub fn request(operation: &Arc<OperationDescriptor>, vars: Value) -> OperationRequest {
    let vars: Variables = vars.as_object().cloned().unwrap_or_default();
    operation.request(vars).unwrap()
}

/// `query UserQuery($id: ID!) { node(id: $id) { id __typename name } }`, with `name` optionally
/// annotated `@required(action: ...)`.
#[allow(dead_code)]
pub fn user_query(required: Option<&str>) -> Arc<OperationDescriptor> {
    let mut name = json!({"kind": "ScalarField", "name": "name"});
    if let Some(action) = required {
        name["required"] = json!(action);
    }
    operation(json!({
        "name": "UserQuery",
        "argumentDefinitions": [{"name": "id", "type": "ID!"}],
        "readSelections": [{
            "kind": "LinkedField", "name": "node",
            "args": [{"name": "id", "value": {"variable": "id"}}],
            "selections": [
                {"kind": "ScalarField", "name": "id"},
                name
            ]
        }],
        "normalizationSelections": [{
            "kind": "LinkedField", "name": "node",
            "args": [{"name": "id", "value": {"variable": "id"}}],
            "selections": [
                {"kind": "ScalarField", "name": "id"},
                {"kind": "ScalarField", "name": "__typename"},
                {"kind": "ScalarField", "name": "name"}
            ]
        }]
    }))
}

/// Current value of a scalar field, `None` when the record or the field is absent.
#[allow(dead_code)]
pub fn field(environment: &Environment, id: &str, key: &str) -> Option<Value> {
    environment
        .store()
        .source()
        .get(&DataId::from(id))
        .record()
        .and_then(|record| record.field(key).cloned())
        .and_then(|value| value.as_scalar().cloned())
}
