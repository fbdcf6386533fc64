use super::*;
use crate::{
    error::StoreError,
    operation::Selection,
    record::{DataId, FieldErrorKind, FieldValue, PathSegment, Record, ROOT_ID, ROOT_TYPE},
    store::{RecordMap, RecordSource},
    tests::helpers::*,
};
use serde_json::{json, Value};
use test_log::test;

fn selections(value: Value) -> Vec<Selection> {
    serde_json::from_value(value).unwrap()
}

fn root(selections_json: Value, vars: Value) -> NormalizationSelector {
    NormalizationSelector {
        data_id: DataId::root(),
        typename: ROOT_TYPE.to_string(),
        selections: selections(selections_json),
        variables: variables(vars),
    }
}

fn normalize(
    selector: &NormalizationSelector,
    response: GraphQLResponse,
) -> Result<ResponsePayload, StoreError> {
    init_logging();
    normalize_response(&RecordMap::new(), &response, selector, &NormalizeOptions::default())
}

fn record<'a>(payload: &'a ResponsePayload, id: &str) -> &'a Record {
    payload.source.get(&DataId::from(id)).record().unwrap()
}

fn viewer_selections() -> Value {
    json!([{
        "kind": "LinkedField", "name": "viewer",
        "selections": [
            {"kind": "ScalarField", "name": "__typename"},
            {"kind": "LinkedField", "name": "friends", "plural": true,
             "args": [{"name": "first", "value": {"variable": "count"}}],
             "selections": [
                 {"kind": "ScalarField", "name": "id"},
                 {"kind": "ScalarField", "name": "__typename"},
                 {"kind": "ScalarField", "name": "name"}
             ]}
        ]
    }])
}

#[test]
fn node_payload_becomes_linked_records() {
    let request = request(&node_query(), json!({"id": "123"}));
    let payload = normalize(
        &root_selector(&request),
        GraphQLResponse::with_data(json!({
            "node": {"id": "123", "__typename": "User", "name": "Alice"}
        })),
    )
    .unwrap();

    let root = record(&payload, ROOT_ID);
    assert_eq!(
        root.field(r#"node(id:"123")"#),
        Some(&FieldValue::link(DataId::from("123")))
    );
    let user = record(&payload, "123");
    assert_eq!(user.typename(), "User");
    assert_eq!(user.field("name"), Some(&FieldValue::Scalar(json!("Alice"))));
    assert!(payload.is_final);
    assert!(payload.incremental.is_empty());
}

#[test]
fn objects_without_ids_get_stable_client_ids() {
    let selector = root(viewer_selections(), json!({"count": 2}));
    let data = json!({"viewer": {
        "__typename": "Viewer",
        "friends": [
            {"id": "u1", "__typename": "User", "name": "Ann"},
            null,
            {"id": "u2", "__typename": "User", "name": "Bob"}
        ]
    }});
    let first = normalize(&selector, GraphQLResponse::with_data(data.clone())).unwrap();
    let second = normalize(&selector, GraphQLResponse::with_data(data)).unwrap();
    assert_eq!(first.source, second.source);

    let viewer_id = DataId::from("client:root:viewer");
    assert_eq!(
        record(&first, ROOT_ID).field("viewer"),
        Some(&FieldValue::link(viewer_id.clone()))
    );
    assert_eq!(
        record(&first, viewer_id.as_str()).field("friends(first:2)"),
        Some(&FieldValue::links(vec![
            Some(DataId::from("u1")),
            None,
            Some(DataId::from("u2"))
        ]))
    );
}

#[test]
fn plural_items_without_ids_are_keyed_by_position() {
    let selector = root(
        json!([{
            "kind": "LinkedField", "name": "tags", "plural": true, "concreteType": "Tag",
            "selections": [{"kind": "ScalarField", "name": "label"}]
        }]),
        json!({}),
    );
    let payload = normalize(
        &selector,
        GraphQLResponse::with_data(json!({"tags": [{"label": "a"}, {"label": "b"}]})),
    )
    .unwrap();
    let second = record(&payload, "client:root:tags:1");
    assert_eq!(second.typename(), "Tag");
    assert_eq!(second.field("label"), Some(&FieldValue::Scalar(json!("b"))));
}

#[test]
fn absent_fields_stay_undefined_and_nulls_are_written() {
    let request = request(&node_query(), json!({"id": "1"}));
    let payload = normalize(
        &root_selector(&request),
        GraphQLResponse::with_data(json!({"node": {"id": "1", "__typename": "User"}})),
    )
    .unwrap();
    assert!(!record(&payload, "1").has("name"));

    let payload = normalize(
        &root_selector(&request),
        GraphQLResponse::with_data(json!({
            "node": {"id": "1", "__typename": "User", "name": null}
        })),
    )
    .unwrap();
    assert_eq!(record(&payload, "1").field("name"), Some(&FieldValue::null()));

    let payload = normalize(
        &root_selector(&request),
        GraphQLResponse::with_data(json!({"node": null})),
    )
    .unwrap();
    assert_eq!(
        record(&payload, ROOT_ID).field(r#"node(id:"1")"#),
        Some(&FieldValue::null())
    );
}

#[test]
fn server_errors_attach_to_the_field_at_their_path() {
    let request = request(&node_query(), json!({"id": "1"}));
    let response = GraphQLResponse::from_json(json!({
        "data": {"node": {"id": "1", "__typename": "User", "name": null}},
        "errors": [{"message": "name is private", "path": ["node", "name"]}]
    }))
    .unwrap();
    let payload = normalize(&root_selector(&request), response).unwrap();
    let errors = record(&payload, "1").errors("name").unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message, "name is private");
    assert_eq!(errors[0].kind, FieldErrorKind::Server);
    assert_eq!(payload.errors.len(), 1);
}

#[test]
fn null_parent_collects_errors_from_beneath_it() {
    let request = request(&node_query(), json!({"id": "1"}));
    let response = GraphQLResponse::from_json(json!({
        "data": {"node": null},
        "errors": [{"message": "boom", "path": ["node", "name"]}]
    }))
    .unwrap();
    let payload = normalize(&root_selector(&request), response).unwrap();
    let errors = record(&payload, ROOT_ID).errors(r#"node(id:"1")"#).unwrap();
    assert_eq!(errors[0].message, "boom");
}

#[test]
fn scalar_where_an_object_is_expected_fails() {
    let request = request(&node_query(), json!({"id": "1"}));
    let err = normalize(
        &root_selector(&request),
        GraphQLResponse::with_data(json!({"node": "not an object"})),
    )
    .unwrap_err();
    assert!(matches!(err, StoreError::Normalization(_)));

    let selector = root(viewer_selections(), json!({"count": 1}));
    let err = normalize(
        &selector,
        GraphQLResponse::with_data(json!({
            "viewer": {"__typename": "Viewer", "friends": {"id": "u1"}}
        })),
    )
    .unwrap_err();
    assert!(matches!(err, StoreError::Normalization(_)));
}

#[test]
fn missing_typename_without_a_concrete_type_fails() {
    let request = request(&node_query(), json!({"id": "1"}));
    let err = normalize(
        &root_selector(&request),
        GraphQLResponse::with_data(json!({"node": {"id": "1", "name": "Ann"}})),
    )
    .unwrap_err();
    assert!(matches!(err, StoreError::Normalization(_)));
}

#[test]
fn responses_without_data_fail() {
    let request = request(&node_query(), json!({"id": "1"}));
    let response = GraphQLResponse::from_json(json!({
        "data": null,
        "errors": [{"message": "unauthorized"}]
    }))
    .unwrap();
    let err = normalize(&root_selector(&request), response).unwrap_err();
    assert!(matches!(err, StoreError::Response(message) if message == "unauthorized"));

    let err = normalize(&root_selector(&request), GraphQLResponse::default()).unwrap_err();
    assert!(matches!(err, StoreError::Normalization(_)));
}

#[test]
fn abstract_fragments_record_type_membership() {
    let selector = root(
        json!([{
            "kind": "LinkedField", "name": "actor",
            "selections": [
                {"kind": "ScalarField", "name": "id"},
                {"kind": "ScalarField", "name": "__typename"},
                {"kind": "InlineFragment", "typeCondition": "Actor", "abstractKey": "__isActor",
                 "selections": [{"kind": "ScalarField", "name": "name"}]},
                {"kind": "InlineFragment", "typeCondition": "Page",
                 "selections": [{"kind": "ScalarField", "name": "likes"}]}
            ]
        }]),
        json!({}),
    );
    let mut options = NormalizeOptions::default();
    options
        .abstract_type_memberships
        .insert("__isActor".to_string(), ["User".to_string()].into_iter().collect());

    let payload = normalize_response(
        &RecordMap::new(),
        &GraphQLResponse::with_data(json!({
            "actor": {"id": "7", "__typename": "User", "name": "Ann", "likes": 3}
        })),
        &selector,
        &options,
    )
    .unwrap();
    let actor = record(&payload, "7");
    assert_eq!(actor.field("__isActor"), Some(&FieldValue::Scalar(json!(true))));
    assert_eq!(actor.field("name"), Some(&FieldValue::Scalar(json!("Ann"))));
    assert!(!actor.has("likes"));
}

#[test]
fn handle_fields_emit_handle_payloads() {
    let selector = root(
        json!([{
            "kind": "LinkedField", "name": "comments", "concreteType": "CommentConnection",
            "args": [{"name": "first", "value": {"literal": 2}}],
            "handle": {"handle": "connection", "key": "Feed_comments", "filters": []},
            "selections": [{"kind": "ScalarField", "name": "totalCount"}]
        }]),
        json!({}),
    );
    let payload = normalize(
        &selector,
        GraphQLResponse::with_data(json!({"comments": {"totalCount": 4}})),
    )
    .unwrap();
    assert_eq!(payload.field_payloads.len(), 1);
    let handle = &payload.field_payloads[0];
    assert_eq!(handle.data_id, DataId::root());
    assert_eq!(handle.field_key, "comments(first:2)");
    assert_eq!(handle.handle_key, "__Feed_comments_connection");
    assert_eq!(handle.args.get("first"), Some(&json!(2)));
}

#[test]
fn absent_deferred_fields_leave_a_placeholder() {
    let selector = root(
        json!([{
            "kind": "LinkedField", "name": "viewer", "concreteType": "Viewer",
            "selections": [
                {"kind": "ScalarField", "name": "handle"},
                {"kind": "Defer", "label": "Viewer$defer$bio",
                 "selections": [{"kind": "ScalarField", "name": "bio"}]}
            ]
        }]),
        json!({}),
    );
    let mut response = GraphQLResponse::with_data(json!({"viewer": {"handle": "ann"}}));
    response.has_next = true;
    let payload = normalize(&selector, response).unwrap();
    assert!(!payload.is_final);
    assert_eq!(payload.incremental.len(), 1);
    match &payload.incremental[0] {
        IncrementalPlaceholder::Defer { label, path, selector } => {
            assert_eq!(label, "Viewer$defer$bio");
            assert_eq!(path, &vec![PathSegment::from("viewer")]);
            assert_eq!(selector.data_id, DataId::from("client:root:viewer"));
            assert_eq!(selector.typename, "Viewer");
        }
        other => panic!("expected a defer placeholder, got {other:?}"),
    }

    // Data already present for the deferred selection is written inline.
    let payload = normalize(
        &selector,
        GraphQLResponse::with_data(json!({"viewer": {"handle": "ann", "bio": "hi"}})),
    )
    .unwrap();
    assert!(payload.incremental.is_empty());
    assert_eq!(
        record(&payload, "client:root:viewer").field("bio"),
        Some(&FieldValue::Scalar(json!("hi")))
    );
}

#[test]
fn streamed_lists_record_the_next_index() {
    let selector = root(
        json!([{
            "kind": "Stream", "label": "Feed$stream$items", "initialCount": 1,
            "selections": [{
                "kind": "LinkedField", "name": "items", "plural": true,
                "selections": [
                    {"kind": "ScalarField", "name": "id"},
                    {"kind": "ScalarField", "name": "__typename"}
                ]
            }]
        }]),
        json!({}),
    );
    let payload = normalize(
        &selector,
        GraphQLResponse::with_data(json!({"items": [{"id": "i0", "__typename": "Item"}]})),
    )
    .unwrap();
    match &payload.incremental[..] {
        [IncrementalPlaceholder::Stream { label, path, next_index, parent_id, .. }] => {
            assert_eq!(label, "Feed$stream$items");
            assert_eq!(path, &vec![PathSegment::from("items")]);
            assert_eq!(*next_index, 1);
            assert_eq!(parent_id, &DataId::root());
        }
        other => panic!("expected one stream placeholder, got {other:?}"),
    }
    assert_eq!(
        record(&payload, ROOT_ID).field("items"),
        Some(&FieldValue::links(vec![Some(DataId::from("i0"))]))
    );
}

#[test]
fn resolver_fields_are_reported_not_written() {
    let selector = root(
        json!([{
            "kind": "LinkedField", "name": "me", "concreteType": "User",
            "selections": [
                {"kind": "ScalarField", "name": "id"},
                {"kind": "Resolver", "name": "greeting", "resolver": "greeting"}
            ]
        }]),
        json!({}),
    );
    let payload =
        normalize(&selector, GraphQLResponse::with_data(json!({"me": {"id": "1"}}))).unwrap();
    assert_eq!(
        payload.resolver_fields,
        vec![(DataId::from("1"), "greeting".to_string())]
    );
    assert!(!record(&payload, "1").has("greeting"));
}

#[test]
fn existing_records_supply_the_typename() {
    let base = store_from(json!({
        "1": {"__id": "1", "__typename": "User", "name": "Ann"}
    }));
    let request = request(&node_query(), json!({"id": "1"}));
    let payload = normalize_response(
        base.source(),
        &GraphQLResponse::with_data(json!({"node": {"id": "1", "name": "Annie"}})),
        &root_selector(&request),
        &NormalizeOptions::default(),
    )
    .unwrap();
    assert_eq!(record(&payload, "1").typename(), "User");
}

fn viewer_with(extra: Value) -> Value {
    json!([{
        "kind": "LinkedField", "name": "viewer", "concreteType": "Viewer",
        "selections": [{"kind": "ScalarField", "name": "handle"}, extra]
    }])
}

#[test]
fn failed_conditions_write_nothing() {
    let condition = json!({
        "kind": "Condition", "condition": "withBio", "passingValue": true,
        "selections": [{"kind": "ScalarField", "name": "bio"}]
    });
    let response =
        || GraphQLResponse::with_data(json!({"viewer": {"handle": "ann", "bio": "hi"}}));

    let skipped = root(viewer_with(condition.clone()), json!({"withBio": false}));
    let payload = normalize(&skipped, response()).unwrap();
    let viewer = record(&payload, "client:root:viewer");
    assert_eq!(viewer.field("handle"), Some(&FieldValue::Scalar(json!("ann"))));
    assert!(!viewer.has("bio"));
    assert!(payload.incremental.is_empty());

    let included = root(viewer_with(condition), json!({"withBio": true}));
    let payload = normalize(&included, response()).unwrap();
    assert_eq!(
        record(&payload, "client:root:viewer").field("bio"),
        Some(&FieldValue::Scalar(json!("hi")))
    );
}

#[test]
fn aliased_fragments_write_under_their_field_keys() {
    let selector = root(
        json!([{
            "kind": "LinkedField", "name": "me", "concreteType": "User",
            "selections": [
                {"kind": "ScalarField", "name": "id"},
                {"kind": "FragmentSpread", "alias": "profile", "fragment": {
                    "name": "UserProfile",
                    "selections": [{"kind": "ScalarField", "name": "name"}]
                }},
                {"kind": "InlineFragment", "typeCondition": "User", "alias": "asUser",
                 "selections": [{"kind": "ScalarField", "name": "email"}]}
            ]
        }]),
        json!({}),
    );
    let payload = normalize(
        &selector,
        GraphQLResponse::with_data(json!({
            "me": {"id": "1", "name": "Ann", "email": "ann@example.com"}
        })),
    )
    .unwrap();
    let me = record(&payload, "1");
    assert_eq!(me.field("name"), Some(&FieldValue::Scalar(json!("Ann"))));
    assert_eq!(
        me.field("email"),
        Some(&FieldValue::Scalar(json!("ann@example.com")))
    );
    assert!(!me.has("profile") && !me.has("asUser"));
}

#[test]
fn type_discriminators_write_membership_without_a_fragment() {
    let selector = root(
        json!([{
            "kind": "LinkedField", "name": "actor",
            "selections": [
                {"kind": "ScalarField", "name": "id"},
                {"kind": "ScalarField", "name": "__typename"},
                {"kind": "TypeDiscriminator", "abstractKey": "__isNode"}
            ]
        }]),
        json!({}),
    );
    let mut options = NormalizeOptions::default();
    options
        .abstract_type_memberships
        .insert("__isNode".to_string(), ["User".to_string()].into_iter().collect());
    let membership = |typename: &str| {
        let payload = normalize_response(
            &RecordMap::new(),
            &GraphQLResponse::with_data(json!({"actor": {"id": "7", "__typename": typename}})),
            &selector,
            &options,
        )
        .unwrap();
        record(&payload, "7").field("__isNode").cloned()
    };
    assert_eq!(membership("User"), Some(FieldValue::Scalar(json!(true))));
    assert_eq!(membership("Page"), Some(FieldValue::Scalar(json!(false))));
}

#[test]
fn disabled_defer_and_stream_normalize_inline() {
    let selector = root(
        json!([{
            "kind": "LinkedField", "name": "viewer", "concreteType": "Viewer",
            "selections": [
                {"kind": "ScalarField", "name": "handle"},
                {"kind": "Defer", "label": "Viewer$defer$bio", "if": "deferBio",
                 "selections": [{"kind": "ScalarField", "name": "bio"}]},
                {"kind": "Stream", "label": "Viewer$stream$items", "if": "streamItems",
                 "selections": [{
                    "kind": "LinkedField", "name": "items", "plural": true,
                    "selections": [
                        {"kind": "ScalarField", "name": "id"},
                        {"kind": "ScalarField", "name": "__typename"}
                    ]
                 }]}
            ]
        }]),
        json!({"deferBio": false, "streamItems": false}),
    );
    let payload = normalize(
        &selector,
        GraphQLResponse::with_data(json!({"viewer": {
            "handle": "ann",
            "items": [{"id": "i0", "__typename": "Item"}]
        }})),
    )
    .unwrap();
    assert!(payload.incremental.is_empty());
    let viewer = record(&payload, "client:root:viewer");
    assert!(!viewer.has("bio"));
    assert_eq!(
        viewer.field("items"),
        Some(&FieldValue::links(vec![Some(DataId::from("i0"))]))
    );
}
