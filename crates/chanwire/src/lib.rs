//! # chanwire
//!
//! The wire protocol for running RPC over a channel that only moves opaque,
//! asynchronous messages.
//!
//! ## Architecture
//!
//! - `envelope`: the request, stop, response and reconnect shapes.
//! - `codec`: wire text in and out, with structural validation on decode.
//! - `error`: codec failures, plus the error codes and error shape that
//!   travel inside responses.
//! - `transform`: the payload hook applied to `input` and `data` only.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod transform;

#[cfg(test)]
mod tests;

pub use codec::decode_client_batch;
pub use codec::decode_server_batch;
pub use codec::encode;
pub use codec::encode_outgoing;
pub use codec::Inbound;
pub use codec::InboundAction;
pub use envelope::Call;
pub use envelope::ClientMessage;
pub use envelope::JsonRpc;
pub use envelope::OperationKind;
pub use envelope::RequestEnvelope;
pub use envelope::RequestId;
pub use envelope::ResponseBody;
pub use envelope::ResponseEnvelope;
pub use envelope::ResultPayload;
pub use envelope::ServerMessage;
pub use envelope::StopEnvelope;
pub use error::Error;
pub use error::ErrorCode;
pub use error::ErrorShape;
pub use error::Result;
pub use transform::Identity;
pub use transform::TransformError;
pub use transform::Transformer;
