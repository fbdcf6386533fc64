//! Cursor connections.
//!
//! The handler keeps one client connection record per `(record, handle key)`, with client-owned
//! edge records and a client `pageInfo`. Each server page is merged into it: a page without
//! cursor arguments replaces the edges, an `after` page appends, a `before` page prepends, and an
//! edge whose node is already present is dropped.

use serde_json::Value;
use std::collections::BTreeSet;

use crate::{
    error::StoreError,
    handlers::FieldHandler,
    normalize::HandleFieldPayload,
    operation::CONNECTION_HANDLE,
    record::{DataId, FieldValue},
    storage_key::{format_storage_key, handle_field_name, Variables},
    store::{RecordSourceMutator, RecordSourceProxy, RecordState},
};

pub const EDGES: &str = "edges";
pub const NODE: &str = "node";
pub const CURSOR: &str = "cursor";
pub const PAGE_INFO: &str = "pageInfo";
pub const PAGE_INFO_TYPE: &str = "PageInfo";
pub const END_CURSOR: &str = "endCursor";
pub const START_CURSOR: &str = "startCursor";
pub const HAS_NEXT_PAGE: &str = "hasNextPage";
pub const HAS_PREVIOUS_PAGE: &str = "hasPreviousPage";
pub const AFTER: &str = "after";
pub const BEFORE: &str = "before";
const NEXT_EDGE_INDEX: &str = "__connection_next_edge_index";

#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectionHandler;

impl FieldHandler for ConnectionHandler {
    fn update(
        &self,
        proxy: &mut RecordSourceProxy<'_>,
        payload: &HandleFieldPayload,
    ) -> Result<(), StoreError> {
        let mutator = proxy.mutator();
        let record = &payload.data_id;
        let server_connection = match mutator.get_linked_record_id(record, &payload.field_key) {
            Some(Some(id)) => id,
            Some(None) => {
                return mutator.set_value(record, &payload.handle_key, FieldValue::null());
            }
            None => return Ok(()),
        };
        let connection = DataId::client(record, &payload.handle_key, None);
        let page_info = DataId::client(&connection, PAGE_INFO, None);
        let server_edges = linked_ids(mutator, &server_connection, EDGES);
        let server_page_info = mutator
            .get_linked_record_id(&server_connection, PAGE_INFO)
            .flatten();
        let existing = mutator.get_linked_record_id(record, &payload.handle_key)
            == Some(Some(connection.clone()))
            && mutator.status(&connection) == RecordState::Existent;

        if !existing {
            let typename = mutator
                .get_type(&server_connection)
                .unwrap_or("Connection")
                .to_string();
            mutator.ensure(&connection, &typename)?;
            mutator.copy_fields(&server_connection, &connection)?;
            let edges = copy_edges(mutator, &connection, &server_edges)?;
            let edges = dedupe(mutator, edges);
            mutator.set_linked_record_ids(&connection, EDGES, edges)?;
            mutator.ensure(&page_info, PAGE_INFO_TYPE)?;
            if let Some(server_page_info) = server_page_info.as_ref() {
                mutator.copy_fields(server_page_info, &page_info)?;
            }
            mutator.set_linked_record_id(&connection, PAGE_INFO, &page_info)?;
            mutator.set_linked_record_id(record, &payload.handle_key, &connection)?;
            return Ok(());
        }

        let after = cursor_arg(&payload.args, AFTER);
        let before = cursor_arg(&payload.args, BEFORE);
        let previous = linked_ids(mutator, &connection, EDGES);
        let mut page_info_fields: &[&str] = &[
            START_CURSOR,
            END_CURSOR,
            HAS_NEXT_PAGE,
            HAS_PREVIOUS_PAGE,
        ];
        let merged = if let Some(after) = after.as_ref() {
            let end_cursor = mutator.get_value(&page_info, END_CURSOR);
            if end_cursor.as_ref().and_then(FieldValue::as_scalar) != Some(after) {
                tracing::warn!(
                    "Ignoring page of {connection} after {after}, \
                     the connection ends at {end_cursor:?}"
                );
                return Ok(());
            }
            page_info_fields = &[END_CURSOR, HAS_NEXT_PAGE];
            let mut edges = previous;
            edges.extend(copy_edges(mutator, &connection, &server_edges)?);
            edges
        } else if let Some(before) = before.as_ref() {
            let start_cursor = mutator.get_value(&page_info, START_CURSOR);
            if start_cursor.as_ref().and_then(FieldValue::as_scalar) != Some(before) {
                tracing::warn!(
                    "Ignoring page of {connection} before {before}, \
                     the connection starts at {start_cursor:?}"
                );
                return Ok(());
            }
            page_info_fields = &[START_CURSOR, HAS_PREVIOUS_PAGE];
            let mut edges = copy_edges(mutator, &connection, &server_edges)?;
            edges.extend(previous);
            edges
        } else {
            copy_edges(mutator, &connection, &server_edges)?
        };

        mutator.copy_fields(&server_connection, &connection)?;
        let merged = dedupe(mutator, merged);
        mutator.set_linked_record_ids(&connection, EDGES, merged)?;
        mutator.set_linked_record_id(&connection, PAGE_INFO, &page_info)?;
        if let Some(server_page_info) = server_page_info.as_ref() {
            for key in page_info_fields.iter() {
                if let Some(value) = mutator.get_value(server_page_info, key) {
                    mutator.set_value(&page_info, key, value)?;
                }
            }
        }
        Ok(())
    }
}

fn cursor_arg(args: &Variables, name: &str) -> Option<Value> {
    args.get(name).filter(|value| !value.is_null()).cloned()
}

fn linked_ids(mutator: &RecordSourceMutator<'_>, id: &DataId, key: &str) -> Vec<DataId> {
    mutator
        .get_linked_record_ids(id, key)
        .flatten()
        .unwrap_or_default()
        .into_iter()
        .flatten()
        .collect()
}

fn next_edge_id(
    mutator: &mut RecordSourceMutator<'_>,
    connection: &DataId,
) -> Result<DataId, StoreError> {
    let index = mutator
        .get_value(connection, NEXT_EDGE_INDEX)
        .and_then(|value| value.as_scalar().and_then(Value::as_u64))
        .unwrap_or(0);
    mutator.set_value(
        connection,
        NEXT_EDGE_INDEX,
        FieldValue::Scalar(index.saturating_add(1).into()),
    )?;
    Ok(DataId::client(connection, EDGES, Some(index as usize)))
}

/// Copy server edges into client edge records owned by the connection.
fn copy_edges(
    mutator: &mut RecordSourceMutator<'_>,
    connection: &DataId,
    server_edges: &[DataId],
) -> Result<Vec<DataId>, StoreError> {
    let mut edges = Vec::with_capacity(server_edges.len());
    for server_edge in server_edges.iter() {
        let Some(typename) = mutator.get_type(server_edge).map(str::to_string) else {
            continue;
        };
        let edge = next_edge_id(mutator, connection)?;
        mutator.ensure(&edge, &typename)?;
        mutator.copy_fields(server_edge, &edge)?;
        edges.push(edge);
    }
    Ok(edges)
}

fn node_of(mutator: &RecordSourceMutator<'_>, edge: &DataId) -> Option<DataId> {
    mutator.get_linked_record_id(edge, NODE).flatten()
}

/// Keep the first edge for each node; edges without a node are kept as they are.
fn dedupe(mutator: &RecordSourceMutator<'_>, edges: Vec<DataId>) -> Vec<Option<DataId>> {
    let mut nodes = BTreeSet::new();
    edges
        .into_iter()
        .filter(|edge| match node_of(mutator, edge) {
            Some(node) => nodes.insert(node),
            None => true,
        })
        .map(Some)
        .collect()
}

/// The client connection stored on `record` under the connection `key` and filter arguments.
pub fn get_connection(
    proxy: &RecordSourceProxy<'_>,
    record: &DataId,
    key: &str,
    filters: &Variables,
) -> Option<DataId> {
    let name = handle_field_name(CONNECTION_HANDLE, Some(key), "");
    let storage_key = format_storage_key(&name, filters);
    proxy
        .mutator_ref()
        .get_linked_record_id(record, &storage_key)
        .flatten()
}

/// Create an edge record for `node` owned by `connection`. The edge isn't part of the connection
/// until inserted.
pub fn create_edge(
    proxy: &mut RecordSourceProxy<'_>,
    connection: &DataId,
    node: &DataId,
    edge_type: &str,
) -> Result<DataId, StoreError> {
    let mutator = proxy.mutator();
    let edge = next_edge_id(mutator, connection)?;
    mutator.ensure(&edge, edge_type)?;
    mutator.set_linked_record_id(&edge, NODE, node)?;
    Ok(edge)
}

fn edge_cursor(mutator: &RecordSourceMutator<'_>, edge: &DataId) -> Option<Value> {
    mutator
        .get_value(edge, CURSOR)
        .and_then(|value| value.as_scalar().cloned())
}

fn cursor_position(
    mutator: &RecordSourceMutator<'_>,
    edges: &[DataId],
    cursor: Option<&str>,
) -> Option<usize> {
    let cursor = cursor?;
    edges.iter().position(|existing| {
        edge_cursor(mutator, existing).as_ref().and_then(Value::as_str) == Some(cursor)
    })
}

/// Insert `edge` after the edge with `cursor`, or at the end when no cursor is given or found.
pub fn insert_edge_after(
    proxy: &mut RecordSourceProxy<'_>,
    connection: &DataId,
    edge: &DataId,
    cursor: Option<&str>,
) -> Result<(), StoreError> {
    let mutator = proxy.mutator();
    let mut edges = linked_ids(mutator, connection, EDGES);
    let position = cursor_position(mutator, &edges, cursor)
        .map(|index| index + 1)
        .unwrap_or(edges.len());
    edges.insert(position, edge.clone());
    mutator.set_linked_record_ids(connection, EDGES, edges.into_iter().map(Some).collect())
}

/// Insert `edge` before the edge with `cursor`, or at the start when no cursor is given or found.
pub fn insert_edge_before(
    proxy: &mut RecordSourceProxy<'_>,
    connection: &DataId,
    edge: &DataId,
    cursor: Option<&str>,
) -> Result<(), StoreError> {
    let mutator = proxy.mutator();
    let mut edges = linked_ids(mutator, connection, EDGES);
    let position = cursor_position(mutator, &edges, cursor).unwrap_or(0);
    edges.insert(position, edge.clone());
    mutator.set_linked_record_ids(connection, EDGES, edges.into_iter().map(Some).collect())
}

/// Remove every edge of `connection` pointing at `node`.
pub fn delete_node(
    proxy: &mut RecordSourceProxy<'_>,
    connection: &DataId,
    node: &DataId,
) -> Result<(), StoreError> {
    let mutator = proxy.mutator();
    let edges = linked_ids(mutator, connection, EDGES);
    let before = edges.len();
    let kept = edges
        .into_iter()
        .filter(|edge| node_of(mutator, edge).as_ref() != Some(node))
        .map(Some)
        .collect::<Vec<_>>();
    if kept.len() != before {
        mutator.set_linked_record_ids(connection, EDGES, kept)?;
    }
    Ok(())
}
