//! Normalization of server responses into record writes.
//!
//! - [`payload`]: Response, error and payload types exchanged with the publish queue
//! - [`normalizer`]: The selection-driven walk itself

pub mod normalizer;
pub mod payload;

#[cfg(test)]
mod tests;

pub use normalizer::{normalize_data, normalize_response, NormalizedParts, Normalizer};
pub use payload::{
    GraphQLError, GraphQLResponse, HandleFieldPayload, IncrementalPlaceholder,
    NormalizationSelector, NormalizeOptions, ResponsePayload,
};
