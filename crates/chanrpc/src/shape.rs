//! # Error Shaping
//!
//! Every per-item failure on the server goes through `report`: the observer
//! hook sees it first, then it becomes the `ErrorShape` of the response.
//! The hook can watch; it cannot change what is sent.

use std::sync::Arc;

use serde_json::Value;

use chanwire::ErrorShape;
use chanwire::OperationKind;

use crate::procedure::ProcedureError;

/// What the error hook is told about a failure.
#[derive(Debug, Clone, Copy)]
pub struct ErrorEvent<'a> {
    pub error: &'a ProcedureError,
    /// `None` when the failing item could not be decoded far enough to know.
    pub kind: Option<OperationKind>,
    pub path: Option<&'a str>,
    pub input: Option<&'a Value>,
}

pub type ErrorHook = Arc<dyn Fn(&ErrorEvent<'_>) + Send + Sync>;

/// Builds the wire shape of a failure.
pub fn shape_error(error: &ProcedureError, path: Option<&str>) -> ErrorShape {
    let message = if error.message.is_empty() {
        error.code.as_str().to_string()
    } else {
        error.message.clone()
    };
    ErrorShape::new(error.code, message, path.map(str::to_string))
}

/// Runs the hook, then shapes the failure.
pub fn report(hook: Option<&ErrorHook>, event: ErrorEvent<'_>) -> ErrorShape {
    tracing::debug!(code = %event.error.code, path = ?event.path, kind = ?event.kind, "Shaping procedure failure: {}", event.error);
    if let Some(hook) = hook {
        hook(&event);
    }
    shape_error(event.error, event.path)
}
