//! Availability checks: can an operation be fulfilled from the store without a network request?

use serde::{Deserialize, Serialize};

use crate::{
    operation::Selection,
    record::{DataId, FieldValue},
    storage_key::Variables,
    store::{RecordLookup, RecordSource},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Availability {
    Available,
    Missing,
}

/// Walk `selections` from `root` and report whether every field they select is present.
/// Explicit nulls and deleted records count as present; deferred selections are not required.
pub fn check(
    source: &dyn RecordSource,
    root: &DataId,
    selections: &[Selection],
    variables: &Variables,
) -> Availability {
    let mut checker = DataChecker {
        source,
        variables: variables.clone(),
    };
    if checker.check_record(root, selections) {
        Availability::Available
    } else {
        Availability::Missing
    }
}

struct DataChecker<'a> {
    source: &'a dyn RecordSource,
    variables: Variables,
}

impl DataChecker<'_> {
    fn check_record(&mut self, id: &DataId, selections: &[Selection]) -> bool {
        match self.source.get(id) {
            RecordLookup::Existent(_) => self.traverse(id, selections),
            RecordLookup::Nonexistent => true,
            RecordLookup::Unknown => {
                tracing::debug!("{id} is unknown to the store");
                false
            }
        }
    }

    fn traverse(&mut self, id: &DataId, selections: &[Selection]) -> bool {
        let source = self.source;
        let Some(record) = source.get(id).record() else {
            return false;
        };
        for selection in selections.iter() {
            let available = match selection {
                Selection::ScalarField(field) => record.has(&field.storage_key(&self.variables)),
                Selection::LinkedField(field) => {
                    match record.field(&field.storage_key(&self.variables)) {
                        None => false,
                        Some(FieldValue::Link { id }) => self.check_record(id, &field.selections),
                        Some(FieldValue::Links { ids }) => ids
                            .iter()
                            .flatten()
                            .all(|child| self.check_record(child, &field.selections)),
                        Some(FieldValue::Scalar(_)) => true,
                    }
                }
                Selection::InlineFragment(fragment) => match fragment.abstract_key.as_deref() {
                    Some(abstract_key) => match record.field(abstract_key) {
                        None => false,
                        Some(FieldValue::Scalar(serde_json::Value::Bool(true))) => {
                            self.traverse(id, &fragment.selections)
                        }
                        Some(_) => true,
                    },
                    None if record.typename() == fragment.type_condition => {
                        self.traverse(id, &fragment.selections)
                    }
                    None => true,
                },
                Selection::FragmentSpread(spread) => {
                    let scoped = spread.fragment_variables(&self.variables);
                    let outer = std::mem::replace(&mut self.variables, scoped);
                    let available = self.traverse(id, &spread.fragment.selections);
                    self.variables = outer;
                    available
                }
                Selection::Condition(condition) => {
                    !condition.passes(&self.variables) || self.traverse(id, &condition.selections)
                }
                Selection::Defer(_)
                | Selection::ClientExtension(_)
                | Selection::Resolver(_) => true,
                Selection::Stream(stream) => self.traverse(id, &stream.selections),
                Selection::TypeDiscriminator(discriminator) => {
                    record.has(&discriminator.abstract_key)
                }
            };
            if !available {
                tracing::debug!("{id} is missing data for {selection:?}");
                return false;
            }
        }
        true
    }
}
