use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::error::SendError as TokioSendError;

use serde_json::Error as JsonError;

use crate::event::StoreEvent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum StoreError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Field error at {owner}/{path}: {message}")]
    FieldError {
        owner: String,
        path: String,
        message: String,
    },
    #[error("Incremental payload error: {0}")]
    Incremental(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Missing data while reading {owner} with throw-on-field-error enabled")]
    MissingData { owner: String },
    #[error("Missing required field at {owner}/{path}")]
    MissingRequiredField { owner: String, path: String },
    #[error("Structural normalization error: {0}")]
    Normalization(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("Resolver error: {0}")]
    Resolver(String),
    #[error("GraphQL response error: {0}")]
    Response(String),
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    #[error("Updater error: {0}")]
    Updater(String),
}

impl StoreError {
    /// Errors produced while reading a snapshot rather than while writing to the store.
    pub fn is_read_error(&self) -> bool {
        matches!(
            self,
            StoreError::FieldError { .. }
                | StoreError::MissingData { .. }
                | StoreError::MissingRequiredField { .. }
        )
    }
}

impl From<toml::de::Error> for StoreError {
    fn from(src: toml::de::Error) -> StoreError {
        StoreError::Serialization(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for StoreError {
    fn from(src: toml::ser::Error) -> StoreError {
        StoreError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<JsonError> for StoreError {
    fn from(src: JsonError) -> StoreError {
        StoreError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<io::Error> for StoreError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(format!("{x}")),
            _ => StoreError::Io(format!("IOError: {}", x.kind())),
        }
    }
}

impl From<TokioSendError<StoreEvent>> for StoreError {
    fn from(x: TokioSendError<StoreEvent>) -> Self {
        StoreError::Io(format!(
            "Channel update send Error, could not transmit store event {:?}",
            x.0
        ))
    }
}
