//! Reference marking: which records a selection would reach from a root.
//!
//! Used by garbage collection to find what retained operations still need. The walk follows
//! links without building output. Each `(record, selection list)` pair is visited at most once,
//! so cyclic links terminate and a record reached through differently-shaped selections still has
//! all of its reachable fields followed.

use std::collections::BTreeSet;

use crate::{
    operation::Selection,
    record::{DataId, FieldValue},
    storage_key::Variables,
    store::RecordSource,
};

/// Add every record id reachable from `root` through `selections` to `references`.
pub fn mark(
    source: &dyn RecordSource,
    root: &DataId,
    selections: &[Selection],
    variables: &Variables,
    references: &mut BTreeSet<DataId>,
) {
    let mut marker = ReferenceMarker {
        source,
        variables: variables.clone(),
        references,
        visited: BTreeSet::new(),
    };
    marker.mark_record(root, selections);
}

struct ReferenceMarker<'a> {
    source: &'a dyn RecordSource,
    variables: Variables,
    references: &'a mut BTreeSet<DataId>,
    visited: BTreeSet<(DataId, usize)>,
}

impl ReferenceMarker<'_> {
    fn mark_record(&mut self, id: &DataId, selections: &[Selection]) {
        self.references.insert(id.clone());
        if !self.visited.insert((id.clone(), selections.as_ptr() as usize)) {
            return;
        }
        if self.source.get(id).record().is_none() {
            return;
        }
        self.traverse(id, selections);
    }

    fn traverse(&mut self, id: &DataId, selections: &[Selection]) {
        for selection in selections.iter() {
            match selection {
                Selection::ScalarField(_) | Selection::TypeDiscriminator(_) => {}
                Selection::LinkedField(field) => {
                    let mut keys = vec![field.storage_key(&self.variables)];
                    keys.extend(field.handle_key(&self.variables));
                    for key in keys.iter() {
                        self.follow(id, key, &field.selections);
                    }
                }
                Selection::InlineFragment(fragment) => self.traverse(id, &fragment.selections),
                Selection::FragmentSpread(spread) => {
                    let scoped = spread.fragment_variables(&self.variables);
                    let outer = std::mem::replace(&mut self.variables, scoped);
                    self.traverse(id, &spread.fragment.selections);
                    self.variables = outer;
                }
                Selection::Condition(condition) => {
                    if condition.passes(&self.variables) {
                        self.traverse(id, &condition.selections);
                    }
                }
                Selection::Defer(defer) => self.traverse(id, &defer.selections),
                Selection::Stream(stream) => self.traverse(id, &stream.selections),
                Selection::ClientExtension(extension) => self.traverse(id, &extension.selections),
                Selection::Resolver(field) => {
                    if let Some(fragment) = field.fragment.as_ref() {
                        self.traverse(id, &fragment.selections);
                    }
                }
            }
        }
    }

    fn follow(&mut self, id: &DataId, key: &str, selections: &[Selection]) {
        let linked = match self.source.get(id).record().and_then(|record| record.field(key)) {
            Some(FieldValue::Link { id }) => vec![id.clone()],
            Some(FieldValue::Links { ids }) => ids.iter().flatten().cloned().collect(),
            _ => return,
        };
        for child in linked.iter() {
            self.mark_record(child, selections);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{operation::Selection, tests::helpers::*};
    use serde_json::json;
    use test_log::test;

    fn selections(value: serde_json::Value) -> Vec<Selection> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn cycles_terminate_and_every_reachable_record_is_marked() {
        let store = store_from(json!({
            "client:root": {"__id": "client:root", "__typename": "__Root", "me": {"__ref": "1"}},
            "1": {"__id": "1", "__typename": "User", "friends": {"__refs": ["2", null, "3"]}},
            "2": {"__id": "2", "__typename": "User", "friends": {"__refs": ["1"]}},
            "3": {"__id": "3", "__typename": "User", "friends": {"__refs": []}},
            "4": {"__id": "4", "__typename": "User"}
        }));
        let friends = selections(json!([{
            "kind": "LinkedField", "name": "me",
            "selections": [{
                "kind": "LinkedField", "name": "friends", "plural": true,
                "selections": [{
                    "kind": "LinkedField", "name": "friends", "plural": true,
                    "selections": [{"kind": "ScalarField", "name": "id"}]
                }]
            }]
        }]));
        let mut references = BTreeSet::new();
        mark(store.source(), &DataId::root(), &friends, &Variables::new(), &mut references);
        let expected = ["1", "2", "3", "client:root"]
            .into_iter()
            .map(DataId::from)
            .collect::<BTreeSet<_>>();
        assert_eq!(references, expected);
    }

    #[test]
    fn handle_fields_are_followed_too() {
        let store = store_from(json!({
            "client:root": {
                "__id": "client:root", "__typename": "__Root",
                "__Feed_items_connection": {"__ref": "client:root:__Feed_items_connection"}
            },
            "client:root:__Feed_items_connection": {
                "__id": "client:root:__Feed_items_connection", "__typename": "ItemConnection"
            }
        }));
        let items = selections(json!([{
            "kind": "LinkedField", "name": "items",
            "handle": {"handle": "connection", "key": "Feed_items", "filters": []},
            "selections": [{"kind": "ScalarField", "name": "__typename"}]
        }]));
        let mut references = BTreeSet::new();
        mark(store.source(), &DataId::root(), &items, &Variables::new(), &mut references);
        assert!(references.contains(&DataId::from("client:root:__Feed_items_connection")));
    }

    #[test]
    fn a_record_reached_through_two_selections_follows_both() {
        let store = store_from(json!({
            "client:root": {
                "__id": "client:root", "__typename": "__Root",
                "me": {"__ref": "1"}, "owner": {"__ref": "1"}
            },
            "1": {
                "__id": "1", "__typename": "User",
                "bestFriend": {"__ref": "2"}, "pet": {"__ref": "3"}, "rival": {"__ref": "4"}
            },
            "2": {"__id": "2", "__typename": "User"},
            "3": {"__id": "3", "__typename": "Pet"},
            "4": {"__id": "4", "__typename": "User"}
        }));
        let query = selections(json!([
            {"kind": "LinkedField", "name": "me", "selections": [
                {"kind": "LinkedField", "name": "bestFriend", "selections": [
                    {"kind": "ScalarField", "name": "id"}
                ]}
            ]},
            {"kind": "LinkedField", "name": "owner", "selections": [
                {"kind": "LinkedField", "name": "pet", "selections": [
                    {"kind": "ScalarField", "name": "id"}
                ]}
            ]}
        ]));
        let mut references = BTreeSet::new();
        mark(store.source(), &DataId::root(), &query, &Variables::new(), &mut references);
        let expected = ["1", "2", "3", "client:root"]
            .into_iter()
            .map(DataId::from)
            .collect::<BTreeSet<_>>();
        assert_eq!(references, expected);
    }
}
