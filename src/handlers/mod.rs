//! Field handlers maintain client-side fields next to server fields. A linked field carrying a
//! `handle` makes the normalizer emit a [HandleFieldPayload]; when the payload is committed the
//! registered handler of that name updates the handle field through the record proxy.

pub mod connection;

use std::{collections::BTreeMap, sync::Arc};

use crate::{
    error::StoreError, normalize::HandleFieldPayload, operation::CONNECTION_HANDLE,
    store::RecordSourceProxy,
};

pub use connection::ConnectionHandler;

pub trait FieldHandler: Send + Sync {
    fn update(
        &self,
        proxy: &mut RecordSourceProxy<'_>,
        payload: &HandleFieldPayload,
    ) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct HandlerRegistry(BTreeMap<String, Arc<dyn FieldHandler>>);

impl Default for HandlerRegistry {
    fn default() -> Self {
        let mut registry = HandlerRegistry::empty();
        registry.register(CONNECTION_HANDLE, Arc::new(ConnectionHandler));
        registry
    }
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        HandlerRegistry(BTreeMap::new())
    }

    pub fn register(&mut self, name: &str, handler: Arc<dyn FieldHandler>) {
        self.0.insert(name.to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn FieldHandler>> {
        self.0.get(name)
    }

    pub fn apply(
        &self,
        proxy: &mut RecordSourceProxy<'_>,
        payloads: &[HandleFieldPayload],
    ) -> Result<(), StoreError> {
        for payload in payloads.iter() {
            match self.get(&payload.handle) {
                Some(handler) => handler.update(proxy, payload)?,
                None => tracing::warn!(
                    "No handler registered for `{}`, skipping {}.{}",
                    payload.handle,
                    payload.data_id,
                    payload.handle_key
                ),
            }
        }
        Ok(())
    }
}
