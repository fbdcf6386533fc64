//! Shared fixtures for unit tests

use crate::{
    config::StoreConfig,
    normalize::{normalize_response, GraphQLResponse, NormalizationSelector, NormalizeOptions},
    operation::{OperationDescriptor, OperationRequest},
    record::ROOT_TYPE,
    storage_key::Variables,
    store::{RecordMap, Store, UpdatedRecords},
};
use serde_json::{json, Value};
use std::sync::Arc;

/// Initialize logging for tests
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

pub fn operation(value: Value) -> Arc<OperationDescriptor> {
    Arc::new(OperationDescriptor::from_json(value).unwrap())
}

/// `query { node(id: $id) { id __typename name } }`, read without `__typename`.
pub fn node_query() -> Arc<OperationDescriptor> {
    operation(json!({
        "name": "NodeQuery",
        "argumentDefinitions": [{"name": "id", "type": "ID!"}],
        "readSelections": [{
            "kind": "LinkedField", "name": "node",
            "args": [{"name": "id", "value": {"variable": "id"}}],
            "selections": [
                {"kind": "ScalarField", "name": "id"},
                {"kind": "ScalarField", "name": "name"}
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

pub fn variables(value: Value) -> Variables {
    match value {
        Value::Object(map) => map,
        _ => Variables::new(),
    }
}

pub fn request(operation: &Arc<OperationDescriptor>, vars: Value) -> OperationRequest {
    operation.request(variables(vars)).unwrap()
}

pub fn root_selector(request: &OperationRequest) -> NormalizationSelector {
    NormalizationSelector {
        data_id: request.root_id(),
        typename: ROOT_TYPE.to_string(),
        selections: request.normalization_selections().to_vec(),
        variables: request.variables.clone(),
    }
}

pub fn new_store() -> Store {
    init_logging();
    Store::new(StoreConfig::default(), None)
}

pub fn store_from(records: Value) -> Store {
    init_logging();
    Store::from_records(
        RecordMap::from_json(records).unwrap(),
        StoreConfig::default(),
        None,
    )
}

/// Normalize `data` for `request` and publish it straight into `store`.
pub fn publish_data(store: &mut Store, request: &OperationRequest, data: Value) -> UpdatedRecords {
    let options = NormalizeOptions::for_operation(store.config(), &request.operation);
    let payload = normalize_response(
        store.source(),
        &GraphQLResponse::with_data(data),
        &root_selector(request),
        &options,
    )
    .unwrap();
    store.publish(&payload.source)
}
