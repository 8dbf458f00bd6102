//! # Server Dispatcher
//!
//! Decodes inbound traffic, runs procedures through the `Executor`, keeps the
//! table of live subscriptions and answers every request with well-formed
//! response envelopes.
//!
//! ## Invariants
//! - Unreadable wire text gets exactly one `PARSE_ERROR` response with a
//!   `null` id, and no executor call. So does each malformed item of an
//!   array; its siblings still run.
//! - Items of a batch run concurrently. Each reports its own outcome under its
//!   own id; one failing item never blocks its siblings.
//! - At most one live subscription per id. A second request for a live id
//!   stops the first and is rejected; the new stream is never polled.
//! - Every subscription ends with exactly one `stopped` or error response,
//!   unless the channel closes first.
//! - After the channel closes nothing more is sent.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use futures::future::join_all;
use serde_json::Value;
use tokio::task::AbortHandle;
use tokio::task::JoinHandle;

use chanwire::Call;
use chanwire::ErrorCode;
use chanwire::ErrorShape;
use chanwire::Identity;
use chanwire::Inbound;
use chanwire::InboundAction;
use chanwire::JsonRpc;
use chanwire::OperationKind;
use chanwire::RequestId;
use chanwire::ResponseEnvelope;
use chanwire::ResultPayload;
use chanwire::ServerMessage;
use chanwire::Transformer;

use crate::config::ServerConfig;
use crate::procedure::Executor;
use crate::procedure::Outcome;
use crate::procedure::ProcedureError;
use crate::procedure::ProcedureStream;
use crate::shape;
use crate::shape::ErrorEvent;
use crate::transport;
use crate::transport::Port;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    Transport(transport::Error),
    Wire(chanwire::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Wire(e) => write!(f, "Wire error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Wire(e) => Some(e),
        }
    }
}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<chanwire::Error> for Error {
    fn from(e: chanwire::Error) -> Self {
        Self::Wire(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

struct ActiveSubscription {
    /// Distinguishes this registration from a later one under the same id.
    serial: u64,
    cancel: AbortHandle,
}

/// Where a failure happened, for shaping and for the error hook.
struct Site<'a> {
    id: Option<RequestId>,
    jsonrpc: Option<JsonRpc>,
    kind: Option<OperationKind>,
    path: Option<&'a str>,
    input: Option<&'a Value>,
}

struct Inner {
    config: ServerConfig,
    transport: Arc<dyn Transport>,
    executor: Arc<dyn Executor>,
    transformer: Arc<dyn Transformer>,
    subscriptions: DashMap<RequestId, ActiveSubscription>,
    next_serial: AtomicU64,
    closed: AtomicBool,
}

/// The server end of a channel session.
///
/// Dropping the server stops its pump and cancels every live subscription.
pub struct Server {
    inner: Arc<Inner>,
    pump: JoinHandle<()>,
}

impl Server {
    /// Creates a server and spawns the background pump task.
    pub fn new(transport: Arc<dyn Transport>, executor: Arc<dyn Executor>, config: ServerConfig) -> Self {
        Self::with_transformer(transport, executor, Arc::new(Identity), config)
    }

    pub fn with_transformer(
        transport: Arc<dyn Transport>,
        executor: Arc<dyn Executor>,
        transformer: Arc<dyn Transformer>,
        config: ServerConfig,
    ) -> Self {
        let inner = Arc::new(Inner {
            config,
            transport,
            executor,
            transformer,
            subscriptions: DashMap::new(),
            next_serial: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        let pump = tokio::spawn(Inner::pump(Arc::clone(&inner)));

        Self { inner, pump }
    }

    /// Creates a server on top of a channel primitive.
    pub fn from_port(port: Port, executor: Arc<dyn Executor>, config: ServerConfig) -> Self {
        Self::new(port.into_transport(), executor, config)
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Sends the out-of-band reconnect notification.
    pub async fn broadcast_reconnect_notification(&self) -> Result<()> {
        let text = chanwire::encode(&ServerMessage::Reconnect)?;
        tracing::info!(server = %self.inner.config.name, "Broadcasting reconnect notification");
        self.inner.transport.send(text).await?;
        Ok(())
    }

    pub fn active_subscriptions(&self) -> usize {
        self.inner.subscriptions.len()
    }

    pub fn is_subscribed(&self, id: &RequestId) -> bool {
        self.inner.subscriptions.contains_key(id)
    }

    /// Whether the channel has signalled closure.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.pump.abort();
        self.inner.teardown();
    }
}

impl Inner {
    async fn pump(inner: Arc<Self>) {
        loop {
            match inner.transport.recv().await {
                Ok(Some(text)) => {
                    let inner = Arc::clone(&inner);
                    tokio::spawn(async move { inner.handle_message(&text).await });
                }
                Ok(None) => {
                    tracing::info!(server = %inner.config.name, "Channel closed, tearing down subscriptions");
                    break;
                }
                Err(e) => {
                    tracing::warn!(server = %inner.config.name, "Transport error in pump: {}", e);
                    break;
                }
            }
        }

        inner.teardown();
    }

    async fn handle_message(self: &Arc<Self>, text: &str) {
        tracing::trace!(server = %self.config.name, bytes = text.len(), "Received");

        let items = match chanwire::decode_client_batch(text) {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(server = %self.config.name, "Undecodable message: {}", e);
                self.respond(ResponseEnvelope::parse_error(e.to_string())).await;
                return;
            }
        };

        if !self.config.batching && items.len() > 1 {
            tracing::warn!(server = %self.config.name, items = items.len(), "Rejecting batch, batching is disabled");
            let shape = ErrorShape::new(ErrorCode::BadRequest, "Batching is not enabled on this server", None);
            self.respond(ResponseEnvelope::error(None, None, shape)).await;
            return;
        }

        join_all(items.into_iter().map(|item| self.handle_item(item))).await;
    }

    async fn handle_item(self: &Arc<Self>, item: chanwire::Result<Inbound>) {
        let Inbound { id, jsonrpc, action } = match item {
            Ok(inbound) => inbound,
            Err(e) => {
                // An item that failed to decode has no trustworthy id.
                tracing::warn!(server = %self.config.name, "Undecodable item: {}", e);
                let error = ProcedureError::new(ErrorCode::ParseError, e.to_string());
                let site = Site { id: None, jsonrpc: None, kind: None, path: None, input: None };
                self.fail(site, &error).await;
                return;
            }
        };

        let Some(id) = id else {
            match action {
                InboundAction::Stop => {
                    tracing::warn!(server = %self.config.name, "Ignoring stop without id");
                }
                InboundAction::Call(call) => {
                    let error = ProcedureError::bad_request("`id` is required");
                    let site = Site {
                        id: None,
                        jsonrpc,
                        kind: Some(call.kind),
                        path: Some(&call.path),
                        input: call.input.as_ref(),
                    };
                    self.fail(site, &error).await;
                }
            }
            return;
        };

        match action {
            InboundAction::Stop => self.stop(id, jsonrpc).await,
            InboundAction::Call(call) => self.call(id, jsonrpc, call).await,
        }
    }

    async fn stop(&self, id: RequestId, jsonrpc: Option<JsonRpc>) {
        match self.subscriptions.remove(&id) {
            Some((_, sub)) => {
                sub.cancel.abort();
                tracing::debug!(server = %self.config.name, %id, "Subscription stopped by client");
                self.respond(ResponseEnvelope::result(id, jsonrpc, ResultPayload::Stopped)).await;
            }
            None => {
                tracing::warn!(server = %self.config.name, %id, "Stop for unknown subscription");
            }
        }
    }

    async fn call(self: &Arc<Self>, id: RequestId, jsonrpc: Option<JsonRpc>, call: Call) {
        let Call { kind, path, input } = call;

        let input = match input.map(|v| self.transformer.deserialize(v)).transpose() {
            Ok(input) => input,
            Err(e) => {
                let error = ProcedureError::new(ErrorCode::ParseError, "Failed to deserialize input").with_cause(e);
                let site = Site { id: Some(id), jsonrpc, kind: Some(kind), path: Some(&path), input: None };
                self.fail(site, &error).await;
                return;
            }
        };

        tracing::debug!(server = %self.config.name, %id, %kind, %path, "Executing");
        let outcome = self.executor.execute(Call::new(kind, path.clone(), input.clone())).await;

        let site = Site {
            id: Some(id.clone()),
            jsonrpc,
            kind: Some(kind),
            path: Some(&path),
            input: input.as_ref(),
        };

        match (kind, outcome) {
            (_, Err(error)) => self.fail(site, &error).await,
            (OperationKind::Subscription, Ok(Outcome::Stream(stream))) => {
                self.subscribe(id, jsonrpc, path.clone(), input.clone(), stream).await;
            }
            (OperationKind::Subscription, Ok(Outcome::Value(_))) => {
                let error = ProcedureError::internal(format!("Subscription {} did not return a stream", path));
                self.fail(site, &error).await;
            }
            (_, Ok(Outcome::Value(value))) => match self.transformer.serialize(value) {
                Ok(data) => {
                    self.respond(ResponseEnvelope::result(id, jsonrpc, ResultPayload::data(data))).await;
                }
                Err(e) => self.fail(site, &ProcedureError::from(e)).await,
            },
            (_, Ok(Outcome::Stream(_))) => {
                let error = ProcedureError::internal(format!("{} {} returned a stream", kind, path));
                self.fail(site, &error).await;
            }
        }
    }

    async fn subscribe(
        self: &Arc<Self>,
        id: RequestId,
        jsonrpc: Option<JsonRpc>,
        path: String,
        input: Option<Value>,
        stream: ProcedureStream,
    ) {
        let existing = match self.subscriptions.entry(id.clone()) {
            Entry::Occupied(entry) => Some(entry.remove()),
            Entry::Vacant(entry) => {
                let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
                let task = tokio::spawn(Arc::clone(self).forward(
                    id.clone(),
                    jsonrpc,
                    serial,
                    path.clone(),
                    input.clone(),
                    stream,
                ));
                entry.insert(ActiveSubscription { serial, cancel: task.abort_handle() });
                None
            }
        };

        let Some(existing) = existing else {
            tracing::debug!(server = %self.config.name, %id, %path, "Subscription registered");
            return;
        };

        tracing::warn!(server = %self.config.name, %id, "Duplicate subscription id, stopping the existing one");
        existing.cancel.abort();
        self.respond(ResponseEnvelope::result(id.clone(), jsonrpc, ResultPayload::Stopped)).await;

        let error = ProcedureError::bad_request(format!("Duplicate id {}", id));
        let site = Site {
            id: Some(id),
            jsonrpc,
            kind: Some(OperationKind::Subscription),
            path: Some(&path),
            input: input.as_ref(),
        };
        self.fail(site, &error).await;
    }

    /// Drives one live subscription until it ends or is cancelled.
    async fn forward(
        self: Arc<Self>,
        id: RequestId,
        jsonrpc: Option<JsonRpc>,
        serial: u64,
        path: String,
        input: Option<Value>,
        mut stream: ProcedureStream,
    ) {
        self.respond(ResponseEnvelope::result(id.clone(), jsonrpc, ResultPayload::Started)).await;

        let failure = loop {
            match stream.next().await {
                None => break None,
                Some(Err(error)) => break Some(error),
                Some(Ok(value)) => match self.transformer.serialize(value) {
                    Ok(data) => {
                        self.respond(ResponseEnvelope::result(id.clone(), jsonrpc, ResultPayload::data(data))).await;
                    }
                    Err(e) => break Some(ProcedureError::from(e)),
                },
            }
        };
        drop(stream);

        let owned = self
            .subscriptions
            .remove_if(&id, |_, sub| sub.serial == serial)
            .is_some();
        if !owned {
            return;
        }

        match failure {
            None => {
                tracing::debug!(server = %self.config.name, %id, "Subscription completed");
                self.respond(ResponseEnvelope::result(id, jsonrpc, ResultPayload::Stopped)).await;
            }
            Some(error) => {
                let site = Site {
                    id: Some(id),
                    jsonrpc,
                    kind: Some(OperationKind::Subscription),
                    path: Some(&path),
                    input: input.as_ref(),
                };
                self.fail(site, &error).await;
            }
        }
    }

    async fn fail(&self, site: Site<'_>, error: &ProcedureError) {
        let shape = shape::report(self.config.on_error.as_ref(), ErrorEvent {
            error,
            kind: site.kind,
            path: site.path,
            input: site.input,
        });
        self.respond(ResponseEnvelope::error(site.id, site.jsonrpc, shape)).await;
    }

    async fn respond(&self, response: ResponseEnvelope) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let text = match chanwire::encode(&response) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(server = %self.config.name, "Failed to encode response: {}", e);
                return;
            }
        };

        tracing::trace!(server = %self.config.name, id = ?response.id, bytes = text.len(), "Responding");
        if let Err(e) = self.transport.send(text).await {
            tracing::warn!(server = %self.config.name, id = ?response.id, "Failed to send response: {}", e);
        }
    }

    /// Cancels every live subscription. Nothing is sent afterwards.
    fn teardown(&self) {
        self.closed.store(true, Ordering::Release);

        let ids: Vec<RequestId> = self.subscriptions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, sub)) = self.subscriptions.remove(&id) {
                sub.cancel.abort();
            }
        }
    }
}
