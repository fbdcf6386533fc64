//! Ergonomic record accessors over a [RecordSourceMutator], handed to updaters and field handlers.

use serde_json::Value;

use crate::{
    error::StoreError,
    record::{DataId, FieldValue, ROOT_ID, ROOT_TYPE},
    storage_key::{format_storage_key, Variables},
    store::{mutator::RecordSourceMutator, source::RecordState},
};

pub struct RecordSourceProxy<'a> {
    mutator: RecordSourceMutator<'a>,
}

impl<'a> RecordSourceProxy<'a> {
    pub fn new(mutator: RecordSourceMutator<'a>) -> Self {
        RecordSourceProxy { mutator }
    }

    pub fn mutator(&mut self) -> &mut RecordSourceMutator<'a> {
        &mut self.mutator
    }

    pub fn mutator_ref(&self) -> &RecordSourceMutator<'a> {
        &self.mutator
    }

    pub fn into_mutator(self) -> RecordSourceMutator<'a> {
        self.mutator
    }

    pub fn status(&self, id: &DataId) -> RecordState {
        self.mutator.status(id)
    }

    pub fn get(&mut self, id: &DataId) -> Option<RecordProxy<'_, 'a>> {
        if self.mutator.status(id) == RecordState::Existent {
            Some(RecordProxy {
                source: self,
                id: id.clone(),
            })
        } else {
            None
        }
    }

    pub fn create(
        &mut self,
        id: &DataId,
        typename: &str,
    ) -> Result<RecordProxy<'_, 'a>, StoreError> {
        self.mutator.create(id, typename)?;
        Ok(RecordProxy {
            source: self,
            id: id.clone(),
        })
    }

    pub fn delete(&mut self, id: &DataId) {
        self.mutator.delete(id);
    }

    /// The root record, created if the store doesn't have one yet.
    pub fn root(&mut self) -> Result<RecordProxy<'_, 'a>, StoreError> {
        let root = DataId::from(ROOT_ID);
        self.mutator.ensure(&root, ROOT_TYPE)?;
        Ok(RecordProxy {
            source: self,
            id: root,
        })
    }

    pub fn copy_fields(&mut self, source_id: &DataId, sink_id: &DataId) -> Result<(), StoreError> {
        self.mutator.copy_fields(source_id, sink_id)
    }

    pub fn copy_fields_with_linked_record_ids(
        &mut self,
        source_id: &DataId,
        sink_id: &DataId,
    ) -> Result<(), StoreError> {
        self.mutator
            .copy_fields_with_linked_record_ids(source_id, sink_id)
    }
}

/// A handle on one record inside a [RecordSourceProxy]. Fields are addressed by schema name plus
/// argument values, from which the storage key is derived.
pub struct RecordProxy<'p, 'a> {
    source: &'p mut RecordSourceProxy<'a>,
    id: DataId,
}

impl<'p, 'a> RecordProxy<'p, 'a> {
    pub fn data_id(&self) -> &DataId {
        &self.id
    }

    pub fn type_name(&self) -> Option<String> {
        self.source.mutator.get_type(&self.id).map(str::to_string)
    }

    /// `None` when the field is undefined.
    pub fn get_value(&self, name: &str, args: &Variables) -> Option<Value> {
        let key = format_storage_key(name, args);
        match self.source.mutator.get_value(&self.id, &key)? {
            FieldValue::Scalar(value) => Some(value),
            other => {
                tracing::warn!("{}.{key} holds a link, not a scalar: {other:?}", self.id);
                None
            }
        }
    }

    pub fn set_value(
        &mut self,
        name: &str,
        args: &Variables,
        value: Value,
    ) -> Result<&mut Self, StoreError> {
        let key = format_storage_key(name, args);
        self.source
            .mutator
            .set_value(&self.id, &key, FieldValue::Scalar(value))?;
        Ok(self)
    }

    /// `None` when undefined, `Some(None)` when explicitly null.
    pub fn get_linked_record_id(&self, name: &str, args: &Variables) -> Option<Option<DataId>> {
        let key = format_storage_key(name, args);
        self.source.mutator.get_linked_record_id(&self.id, &key)
    }

    pub fn get_linked_record(
        &mut self,
        name: &str,
        args: &Variables,
    ) -> Option<RecordProxy<'_, 'a>> {
        let linked = self.get_linked_record_id(name, args)??;
        self.source.get(&linked)
    }

    pub fn get_linked_record_ids(
        &self,
        name: &str,
        args: &Variables,
    ) -> Option<Option<Vec<Option<DataId>>>> {
        let key = format_storage_key(name, args);
        self.source.mutator.get_linked_record_ids(&self.id, &key)
    }

    pub fn set_linked_record(
        &mut self,
        name: &str,
        args: &Variables,
        linked: &DataId,
    ) -> Result<&mut Self, StoreError> {
        let key = format_storage_key(name, args);
        self.source
            .mutator
            .set_linked_record_id(&self.id, &key, linked)?;
        Ok(self)
    }

    pub fn set_linked_records(
        &mut self,
        name: &str,
        args: &Variables,
        linked: Vec<Option<DataId>>,
    ) -> Result<&mut Self, StoreError> {
        let key = format_storage_key(name, args);
        self.source
            .mutator
            .set_linked_record_ids(&self.id, &key, linked)?;
        Ok(self)
    }

    /// Follow a singular link, creating the linked record (with a client id derived from this
    /// record and the field's storage key) when the link is undefined or null.
    pub fn get_or_create_linked_record(
        &mut self,
        name: &str,
        typename: &str,
        args: &Variables,
    ) -> Result<RecordProxy<'_, 'a>, StoreError> {
        let key = format_storage_key(name, args);
        let linked = match self.source.mutator.get_linked_record_id(&self.id, &key) {
            Some(Some(linked)) if self.source.status(&linked) == RecordState::Existent => linked,
            _ => {
                let linked = DataId::client(&self.id, &key, None);
                self.source.mutator.ensure(&linked, typename)?;
                self.source
                    .mutator
                    .set_linked_record_id(&self.id, &key, &linked)?;
                linked
            }
        };
        Ok(RecordProxy {
            source: &mut *self.source,
            id: linked,
        })
    }

    /// Borrow the owning source proxy, e.g. to look up another record.
    pub fn source(&mut self) -> &mut RecordSourceProxy<'a> {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::source::{RecordMap, RecordSource};
    use serde_json::json;
    use test_log::test;

    #[test]
    fn proxy_reads_and_writes_through_arguments() {
        let base = RecordMap::new();
        let mut proxy = RecordSourceProxy::new(RecordSourceMutator::new(&base, None));
        let args = json!({"size": 32}).as_object().cloned().unwrap();
        {
            let mut user = proxy.create(&DataId::from("4"), "User").unwrap();
            user.set_value("profilePicture", &args, json!("https://pic/32"))
                .unwrap();
            assert_eq!(
                user.get_value("profilePicture", &args),
                Some(json!("https://pic/32"))
            );
            assert_eq!(user.get_value("profilePicture", &Variables::new()), None);
        }
        let sink = proxy.into_mutator().into_sink();
        let record = sink.get(&DataId::from("4")).record().unwrap();
        assert!(record.field("profilePicture(size:32)").is_some());
    }

    #[test]
    fn get_or_create_linked_record_derives_client_ids() {
        let base = RecordMap::new();
        let mut proxy = RecordSourceProxy::new(RecordSourceMutator::new(&base, None));
        let mut root = proxy.root().unwrap();
        let viewer_id = {
            let viewer = root
                .get_or_create_linked_record("viewer", "Viewer", &Variables::new())
                .unwrap();
            viewer.data_id().clone()
        };
        assert_eq!(viewer_id.as_str(), "client:root:viewer");

        let again = root
            .get_or_create_linked_record("viewer", "Viewer", &Variables::new())
            .unwrap();
        assert_eq!(again.data_id(), &viewer_id);
    }
}
