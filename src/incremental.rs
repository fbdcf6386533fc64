//! Deferred and streamed payloads.
//!
//! Each placeholder an initial payload leaves behind is tracked under `(label, path)`. A deferred
//! placeholder goes from pending to applied exactly once, when its chunk arrives. A streamed list
//! accepts items in index order; items that arrive ahead of a gap are buffered until the gap is
//! filled. Chunks that arrive before the payload announcing their placeholder are kept as orphans
//! and handed back once the placeholder is registered.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::{
    error::StoreError,
    normalize::{
        normalize_data, GraphQLResponse, IncrementalPlaceholder, NormalizationSelector,
        NormalizeOptions, Normalizer, ResponsePayload,
    },
    operation::LinkedField,
    record::{format_path, DataId, PathSegment},
    storage_key::Variables,
    store::{RecordSource, RecordSourceMutator},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaceholderState {
    Pending,
    Applied,
}

type PlaceholderKey = (String, String);

/// How far past the next expected item a streamed chunk may reach. Items further ahead are
/// rejected rather than buffered.
pub const MAX_STREAM_LOOKAHEAD: usize = 1024;

#[derive(Debug)]
struct DeferEntry {
    path: Vec<PathSegment>,
    selector: NormalizationSelector,
    state: PlaceholderState,
}

#[derive(Debug)]
struct StreamEntry {
    path: Vec<PathSegment>,
    parent_id: DataId,
    field: LinkedField,
    variables: Variables,
    next_index: usize,
    buffered: BTreeMap<usize, Value>,
}

#[derive(Debug, Default)]
pub struct IncrementalState {
    defers: BTreeMap<PlaceholderKey, DeferEntry>,
    streams: BTreeMap<PlaceholderKey, StreamEntry>,
    orphans: Vec<GraphQLResponse>,
}

impl IncrementalState {
    pub fn new() -> Self {
        IncrementalState::default()
    }

    /// Start tracking `placeholders`. Returns previously orphaned chunks that now have a
    /// placeholder to land in.
    pub fn register(&mut self, placeholders: Vec<IncrementalPlaceholder>) -> Vec<GraphQLResponse> {
        for placeholder in placeholders.into_iter() {
            let key = placeholder.key();
            match placeholder {
                IncrementalPlaceholder::Defer { path, selector, .. } => {
                    tracing::debug!("Tracking deferred `{}` at `{}`", key.0, key.1);
                    self.defers.insert(
                        key,
                        DeferEntry {
                            path,
                            selector,
                            state: PlaceholderState::Pending,
                        },
                    );
                }
                IncrementalPlaceholder::Stream {
                    path,
                    parent_id,
                    field,
                    variables,
                    next_index,
                    ..
                } => {
                    tracing::debug!(
                        "Tracking stream `{}` at `{}` from index {next_index}",
                        key.0,
                        key.1
                    );
                    self.streams.insert(
                        key,
                        StreamEntry {
                            path,
                            parent_id,
                            field,
                            variables,
                            next_index,
                            buffered: BTreeMap::new(),
                        },
                    );
                }
            }
        }
        let (ready, orphans): (Vec<_>, Vec<_>) = std::mem::take(&mut self.orphans)
            .into_iter()
            .partition(|chunk| self.accepts(chunk));
        self.orphans = orphans;
        ready
    }

    /// Deferred placeholders still waiting for data, as `(label, path)`.
    pub fn pending(&self) -> Vec<(String, String)> {
        self.defers
            .iter()
            .filter(|(_, entry)| entry.state == PlaceholderState::Pending)
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn accepts(&self, chunk: &GraphQLResponse) -> bool {
        let Some(label) = chunk.label.as_deref() else {
            return false;
        };
        let path = chunk.path.as_deref().unwrap_or_default();
        if self
            .defers
            .contains_key(&(label.to_string(), format_path(path)))
        {
            return true;
        }
        match split_index(path) {
            Some((list_path, _)) => self
                .streams
                .contains_key(&(label.to_string(), format_path(list_path))),
            None => false,
        }
    }

    /// Normalize one incremental chunk. Returns `None` when the chunk produced no writes yet: it
    /// was a duplicate, it is buffered behind a gap, or its placeholder is unknown so far.
    pub fn process(
        &mut self,
        base: &dyn RecordSource,
        chunk: &GraphQLResponse,
        options: &NormalizeOptions,
    ) -> Result<Option<ResponsePayload>, StoreError> {
        let label = chunk
            .label
            .clone()
            .ok_or_else(|| StoreError::Incremental("Chunk carries no label".to_string()))?;
        let path = chunk.path.clone().unwrap_or_default();

        let defer_key = (label.clone(), format_path(&path));
        if self.defers.contains_key(&defer_key) {
            return self.process_defer(base, &defer_key, chunk, options);
        }
        if let Some((list_path, start)) = split_index(&path) {
            let stream_key = (label.clone(), format_path(list_path));
            if self.streams.contains_key(&stream_key) {
                let items = match (&chunk.items, &chunk.data) {
                    (Some(items), _) => items.clone(),
                    (None, Some(item)) => vec![item.clone()],
                    (None, None) => {
                        return Err(StoreError::Incremental(format!(
                            "Stream chunk `{label}` at `{}` has no items",
                            format_path(&path)
                        )))
                    }
                };
                return self.process_stream(base, &stream_key, start, items, chunk, options);
            }
        }

        tracing::debug!(
            "Holding chunk `{label}` at `{}` until its placeholder is known",
            format_path(&path)
        );
        self.orphans.push(chunk.clone());
        Ok(None)
    }

    fn process_defer(
        &mut self,
        base: &dyn RecordSource,
        key: &PlaceholderKey,
        chunk: &GraphQLResponse,
        options: &NormalizeOptions,
    ) -> Result<Option<ResponsePayload>, StoreError> {
        let Some(entry) = self.defers.get_mut(key) else {
            return Ok(None);
        };
        if entry.state == PlaceholderState::Applied {
            tracing::warn!("Ignoring duplicate chunk for `{}` at `{}`", key.0, key.1);
            return Ok(None);
        }
        let data = match chunk.data.as_ref() {
            Some(data) if !data.is_null() => data,
            _ if !chunk.errors.is_empty() => {
                return Err(StoreError::Response(chunk.error_summary()))
            }
            _ => {
                return Err(StoreError::Incremental(format!(
                    "Deferred chunk `{}` at `{}` has no data",
                    key.0, key.1
                )))
            }
        };
        let mut payload = normalize_data(
            base,
            &entry.selector,
            data,
            entry.path.clone(),
            &chunk.errors,
            options,
        )?;
        entry.state = PlaceholderState::Applied;
        payload.is_final = !chunk.has_next;
        Ok(Some(payload))
    }

    fn process_stream(
        &mut self,
        base: &dyn RecordSource,
        key: &PlaceholderKey,
        start: usize,
        items: Vec<Value>,
        chunk: &GraphQLResponse,
        options: &NormalizeOptions,
    ) -> Result<Option<ResponsePayload>, StoreError> {
        let Some(entry) = self.streams.get_mut(key) else {
            return Ok(None);
        };
        let last = start
            .checked_add(items.len().saturating_sub(1))
            .ok_or_else(|| {
                StoreError::Incremental(format!(
                    "Stream chunk `{}` at `{}` starts at an out of range index {start}",
                    key.0, key.1
                ))
            })?;
        if last.saturating_sub(entry.next_index) >= MAX_STREAM_LOOKAHEAD {
            return Err(StoreError::Incremental(format!(
                "Stream chunk `{}` at `{}` ends at item {last}, more than {MAX_STREAM_LOOKAHEAD} \
                 items past the next expected item {}",
                key.0, key.1, entry.next_index
            )));
        }
        for (offset, item) in items.into_iter().enumerate() {
            let index = start + offset;
            if index < entry.next_index {
                tracing::warn!(
                    "Ignoring duplicate item {index} of stream `{}` at `{}`",
                    key.0,
                    key.1
                );
                continue;
            }
            entry.buffered.insert(index, item);
        }

        let mut ready = Vec::new();
        let mut next = entry.next_index;
        while let Some(item) = entry.buffered.get(&next) {
            ready.push((next, item));
            next += 1;
        }
        if ready.is_empty() {
            tracing::debug!(
                "Stream `{}` at `{}` is waiting for item {}",
                key.0,
                key.1,
                entry.next_index
            );
            return Ok(None);
        }

        let mut mutator = RecordSourceMutator::new(base, None);
        let mut normalizer = Normalizer::new(
            &mut mutator,
            options,
            &chunk.errors,
            entry.variables.clone(),
            entry.path.clone(),
        );
        for (index, item) in ready.iter() {
            normalizer.normalize_stream_item(&entry.parent_id, &entry.field, *index, item)?;
        }
        let parts = normalizer.finish();

        for index in entry.next_index..next {
            entry.buffered.remove(&index);
        }
        entry.next_index = next;
        Ok(Some(ResponsePayload {
            source: mutator.into_sink(),
            field_payloads: parts.field_payloads,
            incremental: parts.incremental,
            resolver_fields: parts.resolver_fields,
            errors: chunk.errors.clone(),
            is_final: !chunk.has_next,
        }))
    }
}

/// Split a stream item path into the list field's path and the item index.
fn split_index(path: &[PathSegment]) -> Option<(&[PathSegment], usize)> {
    match path.split_last() {
        Some((PathSegment::Index(index), list_path)) => Some((list_path, *index)),
        _ => None,
    }
}
