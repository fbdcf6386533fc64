//! Environment integration tests: retention, collection, events and client resolvers.

mod common;

use common::*;
use gql_store::{
    check::Availability,
    config::StoreConfig,
    environment::Environment,
    event::{EventOrigin, StoreEvent},
    normalize::GraphQLResponse,
    operation::OperationRequest,
    reader::Snapshot,
    record::DataId,
    resolver::ResolverContext,
    storage_key::Variables,
    store::{RecordSource, RecordSourceProxy, RecordState},
    StoreError,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use test_log::test;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

fn user(id: &str, name: &str) -> GraphQLResponse {
    GraphQLResponse::with_data(json!({"node": {"id": id, "__typename": "User", "name": name}}))
}

fn user_request(id: &str) -> OperationRequest {
    request(&user_query(None), json!({"id": id}))
}

fn drain(rx: &mut UnboundedReceiver<StoreEvent>) -> Vec<StoreEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[test]
fn retained_operations_survive_collection() {
    init_logging();
    let config = StoreConfig {
        gc_release_buffer_size: 0,
        ..StoreConfig::default()
    };
    let mut environment = Environment::new(config);
    let kept = user_request("1");
    let dropped = user_request("2");
    environment.commit_payload(&kept, &user("1", "Ann")).unwrap();
    environment.commit_payload(&dropped, &user("2", "Bob")).unwrap();

    let identifier = environment.retain(&kept);
    let collected = environment.gc();
    assert_eq!(collected, vec![DataId::from("2")]);
    assert_eq!(field(&environment, "1", "name"), Some(json!("Ann")));
    assert_eq!(environment.check(&dropped), Availability::Missing);
    assert_eq!(environment.check(&kept), Availability::Available);

    // With no release buffer the last release collects straight away.
    environment.release(&identifier);
    assert!(!environment.store().is_retained(&identifier));
    assert_eq!(
        environment.store().source().status(&DataId::from("1")),
        RecordState::Unknown
    );
    assert_eq!(
        environment.store().source().status(&DataId::from("client:root")),
        RecordState::Existent
    );
}

#[test]
fn released_operations_wait_in_the_release_buffer() {
    let mut environment = environment();
    let request = user_request("1");
    environment.commit_payload(&request, &user("1", "Ann")).unwrap();
    let first = environment.retain(&request);
    let second = environment.retain(&request);
    assert_eq!(first, second);

    environment.release(&first);
    environment.release(&second);
    assert!(environment.store().is_retained(&first));
    assert!(environment.gc().is_empty());
    assert_eq!(field(&environment, "1", "name"), Some(json!("Ann")));
}

#[test]
fn collection_waits_for_optimistic_updates_to_finish() {
    let mut environment = environment();
    let request = user_request("1");
    environment.commit_payload(&request, &user("1", "Ann")).unwrap();
    let (optimistic, _) = environment
        .apply_update(Arc::new(|proxy: &mut RecordSourceProxy<'_>| {
            proxy
                .get(&DataId::from("1"))
                .ok_or_else(|| StoreError::NotFound("1".to_string()))?
                .set_value("name", &Variables::new(), json!("Annie"))?;
            Ok(())
        }))
        .unwrap();

    assert!(environment.gc().is_empty());
    assert_eq!(field(&environment, "1", "name"), Some(json!("Annie")));

    environment.revert_update(optimistic).unwrap();
    assert_eq!(
        environment.store().source().status(&DataId::from("1")),
        RecordState::Unknown
    );
}

#[test]
fn events_name_the_origin_of_each_write() {
    init_logging();
    let (tx, mut rx) = unbounded_channel();
    let mut environment = Environment::with_events(StoreConfig::default(), tx);
    let request = user_request("1");

    environment.commit_payload(&request, &user("1", "Ann")).unwrap();
    let events = drain(&mut rx);
    assert!(matches!(
        events.as_slice(),
        [StoreEvent::RecordsUpdated(ids, EventOrigin::Server)] if ids.contains(&DataId::from("1"))
    ));

    let (optimistic, _) = environment
        .apply_update(Arc::new(|proxy: &mut RecordSourceProxy<'_>| {
            proxy
                .get(&DataId::from("1"))
                .ok_or_else(|| StoreError::NotFound("1".to_string()))?
                .set_value("name", &Variables::new(), json!("Annie"))?;
            Ok(())
        }))
        .unwrap();
    assert_eq!(
        drain(&mut rx),
        vec![StoreEvent::RecordsUpdated(
            vec![DataId::from("1")],
            EventOrigin::Optimistic
        )]
    );

    environment.revert_update(optimistic).unwrap();
    environment
        .commit_update(Box::new(|proxy: &mut RecordSourceProxy<'_>| {
            proxy
                .get(&DataId::from("1"))
                .ok_or_else(|| StoreError::NotFound("1".to_string()))?
                .set_value("nickname", &Variables::new(), json!("A"))?;
            Ok(())
        }))
        .unwrap();
    let origins = drain(&mut rx)
        .iter()
        .filter_map(StoreEvent::origin)
        .collect::<Vec<_>>();
    assert_eq!(origins, vec![EventOrigin::Optimistic, EventOrigin::Local]);
}

#[test]
fn subscribers_see_resolver_output_change_with_its_inputs() {
    let mut environment = environment();
    environment.register_resolver("fullName", |ctx: &ResolverContext<'_>| {
        let first = ctx.data["first"].as_str().unwrap_or_default();
        let last = ctx.data["last"].as_str().unwrap_or_default();
        Ok(json!(format!("{first} {last}")))
    });

    let write = request(
        &operation(json!({
            "name": "MeWrite",
            "readSelections": [{"kind": "LinkedField", "name": "me", "selections": [
                {"kind": "ScalarField", "name": "id"},
                {"kind": "ScalarField", "name": "__typename"},
                {"kind": "ScalarField", "name": "first"},
                {"kind": "ScalarField", "name": "last"}
            ]}]
        })),
        json!({}),
    );
    let read = request(
        &operation(json!({
            "name": "MeQuery",
            "readSelections": [{"kind": "LinkedField", "name": "me", "selections": [{
                "kind": "Resolver", "name": "fullName", "resolver": "fullName",
                "fragment": {"name": "UserFullName", "selections": [
                    {"kind": "ScalarField", "name": "first"},
                    {"kind": "ScalarField", "name": "last"}
                ]}
            }]}]
        })),
        json!({}),
    );
    let me = |last: &str| {
        GraphQLResponse::with_data(json!({"me": {
            "id": "1", "__typename": "User", "first": "Ada", "last": last
        }}))
    };
    environment.commit_payload(&write, &me("Byron")).unwrap();

    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let (initial, _) = environment
        .subscribe(&read.root_selector(), move |snapshot: &Snapshot| {
            sink.lock().push(snapshot.data["me"]["fullName"].clone())
        })
        .unwrap();
    assert_eq!(initial.data, json!({"me": {"fullName": "Ada Byron"}}));

    environment.commit_payload(&write, &me("Lovelace")).unwrap();
    assert_eq!(seen.lock().as_slice(), &[json!("Ada Lovelace")]);
}

#[test]
fn an_unknown_operation_is_missing_until_its_data_arrives() {
    let mut environment = environment();
    let request = user_request("7");
    assert_eq!(environment.check(&request), Availability::Missing);
    environment.commit_payload(&request, &user("7", "Gus")).unwrap();
    assert_eq!(environment.check(&request), Availability::Available);
}

#[test]
fn a_closed_event_channel_does_not_fail_writes() {
    init_logging();
    let (tx, rx) = unbounded_channel();
    drop(rx);
    let mut environment = Environment::with_events(StoreConfig::default(), tx);
    let request = user_request("1");
    let execution = environment.execute(request);

    environment.on_payload(execution, user("1", "Ann")).unwrap();
    assert_eq!(field(&environment, "1", "name"), Some(json!("Ann")));
    assert!(!environment.is_active(execution));

    environment.commit_payload(&user_request("1"), &user("1", "Bea")).unwrap();
    assert_eq!(field(&environment, "1", "name"), Some(json!("Bea")));
    assert_eq!(environment.gc(), vec![DataId::from("1")]);
}
