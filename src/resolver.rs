//! Client resolvers: fields computed locally from other fields.
//!
//! Resolvers are evaluated lazily, the first time a reader reaches a resolver field, and the
//! result is cached per `(record id, storage key)` together with the dependencies of the backing
//! fragment read. A publish that touches any of those dependencies drops the entry, so the next
//! read recomputes it. Resolvers returning a record have their output normalized into a private
//! record source that readers overlay on the store.

use parking_lot::RwLock;
use serde_json::Value;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use crate::{
    error::StoreError,
    normalize::{normalize_data, NormalizationSelector, NormalizeOptions},
    operation::{ReaderSelector, RequestIdentifier, ResolverField},
    reader::{read, Dependencies},
    record::DataId,
    storage_key::{argument_values, Variables},
    store::{RecordMap, RecordSource, UpdatedRecords},
};

/// Input handed to a resolver function.
pub struct ResolverContext<'a> {
    pub record_id: &'a DataId,
    /// The backing fragment's data, or null if the resolver declares none.
    pub data: &'a Value,
    pub args: &'a Variables,
}

pub type ResolverFn = Arc<dyn Fn(&ResolverContext<'_>) -> Result<Value, StoreError> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ResolverEntry {
    /// The computed value, or the message of the error the resolver raised.
    pub value: Result<Value, String>,
    pub output: Option<Arc<RecordMap>>,
    pub output_root: Option<DataId>,
    pub deps: Dependencies,
    pub is_missing_data: bool,
}

type CacheKey = (DataId, String);

#[derive(Default)]
pub struct ResolverLayer {
    registry: RwLock<BTreeMap<String, ResolverFn>>,
    cache: RwLock<BTreeMap<CacheKey, Arc<ResolverEntry>>>,
}

impl ResolverLayer {
    pub fn new() -> Self {
        ResolverLayer::default()
    }

    /// Register (or replace) the function behind resolver `name`. Cached values are dropped.
    pub fn register<F>(&self, name: &str, resolver: F)
    where
        F: Fn(&ResolverContext<'_>) -> Result<Value, StoreError> + Send + Sync + 'static,
    {
        self.registry
            .write()
            .insert(name.to_string(), Arc::new(resolver));
        self.cache.write().clear();
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registry.read().contains_key(name)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_cached(&self, id: &DataId, storage_key: &str) -> bool {
        self.cache
            .read()
            .contains_key(&(id.clone(), storage_key.to_string()))
    }

    /// Drop every entry whose dependencies intersect `updated`.
    pub fn invalidate(&self, updated: &UpdatedRecords) {
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|_, entry| !updated.intersects(&entry.deps));
        if cache.len() != before {
            tracing::debug!("Invalidated {} resolver values", before - cache.len());
        }
    }

    /// Drop the entries for specific resolver fields, e.g. ones a payload just re-normalized.
    pub fn invalidate_fields(&self, fields: &[(DataId, String)]) {
        if fields.is_empty() {
            return;
        }
        let mut cache = self.cache.write();
        for key in fields.iter() {
            cache.remove(key);
        }
    }

    pub(crate) fn evaluate(
        &self,
        source: &dyn RecordSource,
        record_id: &DataId,
        field: &ResolverField,
        variables: &Variables,
        owner: &RequestIdentifier,
    ) -> Result<Arc<ResolverEntry>, StoreError> {
        let storage_key = field.storage_key(variables);
        let cache_key = (record_id.clone(), storage_key.clone());
        if let Some(entry) = self.cache.read().get(&cache_key) {
            return Ok(Arc::clone(entry));
        }

        let (data, deps, is_missing_data) = match field.fragment.as_ref() {
            Some(fragment) => {
                let selector = ReaderSelector {
                    data_id: record_id.clone(),
                    fragment: Arc::clone(fragment),
                    variables: variables.clone(),
                    owner: owner.clone(),
                };
                let snapshot = read(source, &selector, Some(self))?;
                (snapshot.data, snapshot.seen, snapshot.is_missing_data)
            }
            None => (
                Value::Null,
                Dependencies::from([(record_id.clone(), BTreeSet::new())]),
                false,
            ),
        };

        let args = argument_values(&field.args, variables);
        let resolver = self.registry.read().get(&field.resolver).cloned();
        let value = match resolver {
            Some(resolver) => resolver(&ResolverContext {
                record_id,
                data: &data,
                args: &args,
            })
            .map_err(|err| err.to_string()),
            None => Err(format!("No resolver registered as `{}`", field.resolver)),
        };

        let (value, output, output_root) = match (value, field.output_type.as_ref()) {
            (Ok(returned), Some(output_type)) if !returned.is_null() => {
                let root = DataId::client(record_id, &storage_key, None);
                let selector = NormalizationSelector {
                    data_id: root.clone(),
                    typename: output_type.concrete_type.clone(),
                    selections: output_type.normalization.clone(),
                    variables: variables.clone(),
                };
                let empty = RecordMap::new();
                match normalize_data(
                    &empty,
                    &selector,
                    &returned,
                    Vec::new(),
                    &[],
                    &NormalizeOptions::default(),
                ) {
                    Ok(payload) => (Ok(returned), Some(Arc::new(payload.source)), Some(root)),
                    Err(err) => (Err(err.to_string()), None, None),
                }
            }
            (value, _) => (value, None, None),
        };
        if let Err(message) = &value {
            tracing::warn!(
                "Resolver `{}` failed for {record_id}.{storage_key}: {message}",
                field.resolver
            );
        }

        let entry = Arc::new(ResolverEntry {
            value,
            output,
            output_root,
            deps,
            is_missing_data,
        });
        self.cache.write().insert(cache_key, Arc::clone(&entry));
        Ok(entry)
    }
}
