//! # Payload Transformer
//!
//! Hook for (de)serializing the `input` and `data` fields of envelopes.
//! The envelope shape never changes; only those two values pass through it.

use serde_json::Value;

/// A transformer rejected a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformError(pub String);

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transform failed: {}", self.0)
    }
}

impl std::error::Error for TransformError {}

/// Converts payload values to and from their wire representation.
///
/// Both endpoints of a channel must agree on the transformer.
pub trait Transformer: Send + Sync + 'static {
    /// Native value to wire value.
    fn serialize(&self, value: Value) -> Result<Value, TransformError>;
    /// Wire value to native value.
    fn deserialize(&self, value: Value) -> Result<Value, TransformError>;
}

/// Passes values through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Transformer for Identity {
    fn serialize(&self, value: Value) -> Result<Value, TransformError> {
        Ok(value)
    }

    fn deserialize(&self, value: Value) -> Result<Value, TransformError> {
        Ok(value)
    }
}
