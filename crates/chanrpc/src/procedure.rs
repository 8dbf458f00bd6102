//! # Procedure Executor Interface
//!
//! The dispatcher does not know what a procedure is. It hands each call to an
//! `Executor` and gets back a single value, a live stream, or a failure.

use futures::stream::BoxStream;
use serde_json::Value;

use chanwire::Call;
use chanwire::ErrorCode;
use chanwire::TransformError;

/// A failure raised by the executor (or by the dispatcher on its behalf).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureError {
    pub code: ErrorCode,
    pub message: String,
    pub cause: Option<String>,
}

impl ProcedureError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), cause: None }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalServerError, message)
    }

    pub fn with_cause(mut self, cause: impl std::fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }
}

impl std::fmt::Display for ProcedureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {} ({})", self.code, self.message, cause),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for ProcedureError {}

impl From<TransformError> for ProcedureError {
    fn from(e: TransformError) -> Self {
        Self::internal("Failed to transform value").with_cause(e)
    }
}

/// The live output of a subscription. Dropping it cancels the subscription.
pub type ProcedureStream = BoxStream<'static, Result<Value, ProcedureError>>;

/// What a procedure produced.
pub enum Outcome {
    /// The result of a query or mutation.
    Value(Value),
    /// The live stream of a subscription.
    Stream(ProcedureStream),
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Resolves a call to business logic.
///
/// # invariants
/// - Unknown paths, invalid input and handler failures are reported as
///   `Err(ProcedureError)`, never as panics.
/// - `call.input` has already been through the transformer.
#[async_trait::async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn execute(&self, call: Call) -> Result<Outcome, ProcedureError>;
}
