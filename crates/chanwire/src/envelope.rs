//! # Protocol Envelopes
//!
//! Defines the fixed, transformer-independent shapes that cross the channel.
//!
//! Client to server:
//! - Request: `{"id":1,"method":"query","params":{"path":"greet","input":…}}`
//! - Stop: `{"id":1,"method":"subscription.stop"}`
//!
//! Server to client:
//! - Response: `{"id":1,"result":{"type":"data","data":…}}` or `{"id":1,"error":{…}}`
//! - Reconnect: `{"id":null,"method":"reconnect"}`
//!
//! ## Invariants
//! - Field order on the wire is stable: `id`, `jsonrpc`, then the body.
//! - `input` is omitted, never written as `null`, when the call has no input.

use serde::ser::SerializeMap;
use serde::Deserialize;
use serde::Serialize;
use serde::Serializer;
use serde_json::Value;

use crate::error::ErrorCode;
use crate::error::ErrorShape;

/// Method name of the stop envelope.
pub const STOP_METHOD: &str = "subscription.stop";
/// Method name of the out-of-band reconnect notification.
pub const RECONNECT_METHOD: &str = "reconnect";
/// The only accepted value of the optional `jsonrpc` field.
pub const JSON_RPC_VERSION: &str = "2.0";

/// Correlates a response with the request that caused it.
///
/// `null` ids are modelled as `Option<RequestId>::None` at the places where
/// the wire allows them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// Reads an id from a raw JSON value.
    ///
    /// - `Ok(None)` for `null`.
    /// - `Err(())` for anything that is neither an integer nor a string.
    pub(crate) fn from_value(value: &Value) -> std::result::Result<Option<Self>, ()> {
        match value {
            Value::Null => Ok(None),
            Value::Number(n) => n.as_i64().map(|n| Some(Self::Number(n))).ok_or(()),
            Value::String(s) => Ok(Some(Self::String(s.clone()))),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::String(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Number(n) => serializer.serialize_i64(*n),
            Self::String(s) => serializer.serialize_str(s),
        }
    }
}

/// The `"jsonrpc":"2.0"` marker. Carries no data; its presence is echoed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsonRpc;

impl Serialize for JsonRpc {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(JSON_RPC_VERSION)
    }
}

/// The kind of a procedure call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Subscription => "subscription",
        }
    }

    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "query" => Some(Self::Query),
            "mutation" => Some(Self::Mutation),
            "subscription" => Some(Self::Subscription),
            _ => None,
        }
    }

    /// Query and mutation produce exactly one result.
    pub fn is_single_shot(self) -> bool {
        !matches!(self, Self::Subscription)
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A procedure invocation: which procedure, how, with what input.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub kind: OperationKind,
    pub path: String,
    pub input: Option<Value>,
}

impl Call {
    pub fn new(kind: OperationKind, path: impl Into<String>, input: Option<Value>) -> Self {
        Self { kind, path: path.into(), input }
    }
}

#[derive(Serialize)]
struct ParamsRef<'a> {
    path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    input: Option<&'a Value>,
}

/// A request for a procedure call.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub id: RequestId,
    pub jsonrpc: Option<JsonRpc>,
    pub call: Call,
}

impl RequestEnvelope {
    pub fn new(id: RequestId, call: Call) -> Self {
        Self { id, jsonrpc: None, call }
    }
}

impl Serialize for RequestEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("id", &self.id)?;
        if let Some(marker) = &self.jsonrpc {
            map.serialize_entry("jsonrpc", marker)?;
        }
        map.serialize_entry("method", &self.call.kind)?;
        map.serialize_entry("params", &ParamsRef {
            path: &self.call.path,
            input: self.call.input.as_ref(),
        })?;
        map.end()
    }
}

/// Cancels a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct StopEnvelope {
    pub id: RequestId,
    pub jsonrpc: Option<JsonRpc>,
}

impl StopEnvelope {
    pub fn new(id: RequestId) -> Self {
        Self { id, jsonrpc: None }
    }
}

impl Serialize for StopEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("id", &self.id)?;
        if let Some(marker) = &self.jsonrpc {
            map.serialize_entry("jsonrpc", marker)?;
        }
        map.serialize_entry("method", STOP_METHOD)?;
        map.end()
    }
}

/// Anything a client puts on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Request(RequestEnvelope),
    Stop(StopEnvelope),
}

impl ClientMessage {
    pub fn id(&self) -> &RequestId {
        match self {
            Self::Request(req) => &req.id,
            Self::Stop(stop) => &stop.id,
        }
    }
}

impl Serialize for ClientMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Request(req) => req.serialize(serializer),
            Self::Stop(stop) => stop.serialize(serializer),
        }
    }
}

/// The successful payload of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResultPayload {
    Data { data: Value },
    Started,
    Stopped,
}

impl ResultPayload {
    pub fn data(data: Value) -> Self {
        Self::Data { data }
    }
}

/// Either side of a response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Result(ResultPayload),
    Error(ErrorShape),
}

impl ResponseBody {
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Result(ResultPayload::Stopped))
    }
}

/// A response to a request (or, with `id: None`, to an unreadable message).
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub id: Option<RequestId>,
    pub jsonrpc: Option<JsonRpc>,
    pub body: ResponseBody,
}

impl ResponseEnvelope {
    pub fn new(id: Option<RequestId>, jsonrpc: Option<JsonRpc>, body: ResponseBody) -> Self {
        Self { id, jsonrpc, body }
    }

    pub fn result(id: RequestId, jsonrpc: Option<JsonRpc>, payload: ResultPayload) -> Self {
        Self::new(Some(id), jsonrpc, ResponseBody::Result(payload))
    }

    pub fn error(id: Option<RequestId>, jsonrpc: Option<JsonRpc>, shape: ErrorShape) -> Self {
        Self::new(id, jsonrpc, ResponseBody::Error(shape))
    }

    /// The untargeted response to a message that could not be decoded.
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::error(None, None, ErrorShape::new(ErrorCode::ParseError, message, None))
    }
}

impl Serialize for ResponseEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("id", &self.id)?;
        if let Some(marker) = &self.jsonrpc {
            map.serialize_entry("jsonrpc", marker)?;
        }
        match &self.body {
            ResponseBody::Result(payload) => map.serialize_entry("result", payload)?,
            ResponseBody::Error(shape) => map.serialize_entry("error", shape)?,
        }
        map.end()
    }
}

/// Anything a server puts on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Response(ResponseEnvelope),
    /// Out-of-band request for the client to re-establish its session.
    Reconnect,
}

impl Serialize for ServerMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Response(resp) => resp.serialize(serializer),
            Self::Reconnect => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("id", &Value::Null)?;
                map.serialize_entry("method", RECONNECT_METHOD)?;
                map.end()
            }
        }
    }
}
