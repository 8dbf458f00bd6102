//! # Wire Codec
//!
//! Turns envelopes into wire text and back.
//!
//! A single `send` carries either one envelope (an object) or a batch (an
//! array of objects). Decoding is two-level:
//!
//! - The outer `Result` fails when the text as a whole is unusable: invalid
//!   JSON, or a top level that is neither an object nor an array.
//! - The inner `Result`s fail per item, so one malformed item in a batch never
//!   hides its well-formed siblings.
//!
//! The codec checks structure only. `input` and `data` are passed through
//! untouched; their meaning belongs to the `Transformer`.

use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::envelope::Call;
use crate::envelope::ClientMessage;
use crate::envelope::JsonRpc;
use crate::envelope::OperationKind;
use crate::envelope::RequestId;
use crate::envelope::ResponseBody;
use crate::envelope::ResponseEnvelope;
use crate::envelope::ResultPayload;
use crate::envelope::ServerMessage;
use crate::envelope::JSON_RPC_VERSION;
use crate::envelope::RECONNECT_METHOD;
use crate::envelope::STOP_METHOD;
use crate::error::Error;
use crate::error::ErrorShape;
use crate::error::Result;

/// Encodes a single envelope.
pub fn encode<T: Serialize>(message: &T) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Encodes an outgoing buffer: one envelope as an object, several as an array.
pub fn encode_outgoing(messages: &[ClientMessage]) -> Result<String> {
    match messages {
        [single] => encode(single),
        many => encode(&many),
    }
}

/// A decoded client-to-server item.
///
/// `id` is `None` when the sender wrote `null`; rejecting that is the
/// dispatcher's job, not the codec's.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub id: Option<RequestId>,
    pub jsonrpc: Option<JsonRpc>,
    pub action: InboundAction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundAction {
    Call(Call),
    Stop,
}

/// Decodes client-to-server wire text.
pub fn decode_client_batch(text: &str) -> Result<Vec<Result<Inbound>>> {
    let items = split_batch(text)?;
    Ok(items.into_iter().map(decode_client_item).collect())
}

/// Decodes one client-to-server item.
pub fn decode_client_item(raw: Value) -> Result<Inbound> {
    let obj = as_object(&raw)?;
    let id = read_id(obj, &raw)?;
    let jsonrpc = read_jsonrpc(obj, &raw)?;

    let method = match obj.get("method") {
        Some(Value::String(method)) => method.as_str(),
        Some(_) => return Err(Error::shape("method is not a string", &raw)),
        None => return Err(Error::shape("missing method", &raw)),
    };

    if method == STOP_METHOD {
        return Ok(Inbound { id, jsonrpc, action: InboundAction::Stop });
    }

    let kind = OperationKind::from_method(method)
        .ok_or_else(|| Error::shape(format!("unknown method {:?}", method), &raw))?;

    let params = match obj.get("params") {
        Some(Value::Object(params)) => params,
        _ => return Err(Error::shape("params is not an object", &raw)),
    };
    let path = match params.get("path") {
        Some(Value::String(path)) => path.clone(),
        _ => return Err(Error::shape("params.path is not a string", &raw)),
    };
    let input = params.get("input").cloned();

    Ok(Inbound {
        id,
        jsonrpc,
        action: InboundAction::Call(Call { kind, path, input }),
    })
}

/// Decodes server-to-client wire text.
pub fn decode_server_batch(text: &str) -> Result<Vec<Result<ServerMessage>>> {
    let items = split_batch(text)?;
    Ok(items.into_iter().map(decode_server_item).collect())
}

/// Decodes one server-to-client item.
pub fn decode_server_item(raw: Value) -> Result<ServerMessage> {
    let obj = as_object(&raw)?;

    if let Some(method) = obj.get("method") {
        return match method {
            Value::String(m) if m == RECONNECT_METHOD => Ok(ServerMessage::Reconnect),
            _ => Err(Error::shape("unexpected method on server message", &raw)),
        };
    }

    let id = read_id(obj, &raw)?;
    let jsonrpc = read_jsonrpc(obj, &raw)?;

    let body = match (obj.get("result"), obj.get("error")) {
        (Some(result), None) => {
            let payload: ResultPayload = serde_json::from_value(result.clone())
                .map_err(|e| Error::shape(format!("bad result: {}", e), &raw))?;
            ResponseBody::Result(payload)
        }
        (None, Some(error)) => {
            let shape: ErrorShape = serde_json::from_value(error.clone())
                .map_err(|e| Error::shape(format!("bad error: {}", e), &raw))?;
            ResponseBody::Error(shape)
        }
        (Some(_), Some(_)) => return Err(Error::shape("both result and error", &raw)),
        (None, None) => return Err(Error::shape("neither result nor error", &raw)),
    };

    Ok(ServerMessage::Response(ResponseEnvelope { id, jsonrpc, body }))
}

// Helper functions

fn split_batch(text: &str) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_str(text)?;
    match value {
        Value::Array(items) => Ok(items),
        obj @ Value::Object(_) => Ok(vec![obj]),
        other => Err(Error::shape("top level is neither an object nor an array", &other)),
    }
}

fn as_object(raw: &Value) -> Result<&Map<String, Value>> {
    raw.as_object().ok_or_else(|| Error::shape("not an object", raw))
}

fn read_id(obj: &Map<String, Value>, raw: &Value) -> Result<Option<RequestId>> {
    let id = obj.get("id").ok_or_else(|| Error::shape("missing id", raw))?;
    RequestId::from_value(id).map_err(|_| Error::shape("id is neither an integer, a string nor null", raw))
}

fn read_jsonrpc(obj: &Map<String, Value>, raw: &Value) -> Result<Option<JsonRpc>> {
    match obj.get("jsonrpc") {
        None => Ok(None),
        Some(Value::String(v)) if v == JSON_RPC_VERSION => Ok(Some(JsonRpc)),
        Some(_) => Err(Error::shape("jsonrpc must be \"2.0\"", raw)),
    }
}
