//! # Client Correlation Table
//!
//! The `Client` turns issued operations into batched wire traffic and routes
//! every response back to the observer that is waiting for it.
//!
//! A background pump task reads from the transport and demultiplexes
//! responses by request id. Arrival order is irrelevant: the id is the only
//! thing that links a response to its operation.
//!
//! ## Invariants
//! - Ids come from a per-client counter and are never reused, so a late
//!   response can never reach an unrelated, newer operation.
//! - At most one pending operation per id. Only the table inserts or removes.
//! - Observers are never called while a table guard is held.
//! - Unsubscribe is idempotent.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use chanwire::Call;
use chanwire::ClientMessage;
use chanwire::ErrorShape;
use chanwire::OperationKind;
use chanwire::RequestEnvelope;
use chanwire::RequestId;
use chanwire::ResponseBody;
use chanwire::ResponseEnvelope;
use chanwire::ServerMessage;
use chanwire::StopEnvelope;
use chanwire::TransformError;

use crate::config::ClientConfig;
use crate::outbox;
use crate::outbox::Outbox;
use crate::transport;
use crate::transport::Port;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The channel failed to carry the request.
    Transport(transport::Error),
    /// The request could not be encoded.
    Wire(chanwire::Error),
    /// The server answered with an error.
    Remote(ErrorShape),
    /// A payload was rejected by the transformer.
    Transform(TransformError),
    /// The operation completed without a result or a stop from the server.
    EndedPrematurely,
    /// The channel closed while the operation was pending.
    ConnectionClosed,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Wire(e) => write!(f, "Wire error: {}", e),
            Self::Remote(shape) => write!(f, "Remote failure: {}", shape),
            Self::Transform(e) => write!(f, "{}", e),
            Self::EndedPrematurely => write!(f, "Operation ended prematurely"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Wire(e) => Some(e),
            Self::Transform(e) => Some(e),
            _ => None,
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

impl From<TransformError> for Error {
    fn from(e: TransformError) -> Self {
        Self::Transform(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Receives the lifecycle of one operation.
///
/// `next` sees every response for the id, including `started`, `stopped`
/// and error responses. `complete` runs once when the table lets go of the
/// operation, whether because of `stopped` or a local unsubscribe. `error`
/// runs instead of `complete` when the channel fails.
pub trait Observer: Send + Sync + 'static {
    fn next(&self, body: ResponseBody);
    fn error(&self, error: Error);
    fn complete(&self);
}

struct PendingOperation {
    kind: OperationKind,
    observer: Arc<dyn Observer>,
}

struct Inner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    pending: DashMap<RequestId, PendingOperation>,
    outbox: Mutex<Outbox>,
    next_id: AtomicU64,
    reconnects: broadcast::Sender<()>,
}

/// The client end of a channel session.
///
/// Owns the pending table for its transport exclusively. Dropping the client
/// stops its pump and fails every pending operation with `ConnectionClosed`.
pub struct Client {
    inner: Arc<Inner>,
    pump: JoinHandle<()>,
}

impl Client {
    /// Creates a client and spawns the background pump task.
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let (reconnects, _) = broadcast::channel(16);
        let inner = Arc::new(Inner {
            config,
            transport,
            pending: DashMap::new(),
            outbox: Mutex::new(Outbox::new()),
            next_id: AtomicU64::new(1),
            reconnects,
        });

        let pump = tokio::spawn(Inner::pump(Arc::clone(&inner)));

        Self { inner, pump }
    }

    /// Creates a client on top of a channel primitive.
    pub fn from_port(port: Port, config: ClientConfig) -> Self {
        Self::new(port.into_transport(), config)
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Registers an operation and queues its request for the next flush.
    pub fn issue(&self, call: Call, observer: Arc<dyn Observer>) -> RequestHandle {
        self.inner.issue(call, observer)
    }

    /// Cancels an operation locally and, for subscriptions, tells the server.
    pub fn unsubscribe(&self, id: &RequestId) {
        self.inner.unsubscribe(id);
    }

    pub fn is_pending(&self, id: &RequestId) -> bool {
        self.inner.pending.contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Fires once per reconnect notification from the server.
    pub fn reconnect_notifications(&self) -> broadcast::Receiver<()> {
        self.inner.reconnects.subscribe()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.pump.abort();
        self.inner.fail_all(Error::ConnectionClosed);
    }
}

/// Maps a counter value to a wire id. Values past `i64::MAX` become string
/// ids, so the counter never yields the same id twice.
fn request_id(n: u64) -> RequestId {
    match i64::try_from(n) {
        Ok(n) => RequestId::Number(n),
        Err(_) => RequestId::String(n.to_string()),
    }
}

/// Cancellation handle for one issued operation.
#[derive(Clone)]
pub struct RequestHandle {
    id: RequestId,
    inner: Weak<Inner>,
}

impl RequestHandle {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// See `Client::unsubscribe`. A no-op once the client is gone.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.unsubscribe(&self.id);
        }
    }
}

impl std::fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle").field("id", &self.id).finish()
    }
}

impl Inner {
    fn issue(self: &Arc<Self>, call: Call, observer: Arc<dyn Observer>) -> RequestHandle {
        let id = request_id(self.next_id.fetch_add(1, Ordering::Relaxed));
        let kind = call.kind;

        self.pending.insert(id.clone(), PendingOperation { kind, observer });
        tracing::debug!(client = %self.config.name, %id, %kind, path = %call.path, "Issued operation");

        self.enqueue(ClientMessage::Request(RequestEnvelope::new(id.clone(), call)));

        RequestHandle { id, inner: Arc::downgrade(self) }
    }

    fn unsubscribe(self: &Arc<Self>, id: &RequestId) {
        let Some((_, op)) = self.pending.remove(id) else {
            return;
        };
        let purged = self.outbox().purge(id);
        tracing::debug!(client = %self.config.name, %id, purged, "Unsubscribed operation");

        op.observer.complete();

        if op.kind == OperationKind::Subscription {
            self.enqueue(ClientMessage::Stop(StopEnvelope::new(id.clone())));
        }
    }

    fn enqueue(self: &Arc<Self>, message: ClientMessage) {
        let schedule = self.outbox().push(message);
        if schedule {
            self.schedule_flush();
        }
    }

    fn schedule_flush(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        let window = self.config.batch_window();
        tokio::spawn(async move {
            if window.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(window).await;
            }
            inner.flush().await;
        });
    }

    async fn flush(&self) {
        let messages = self.outbox().take();
        for batch in outbox::batches(messages, self.config.batching) {
            let text = match chanwire::encode_outgoing(&batch) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(client = %self.config.name, "Failed to encode outgoing batch: {}", e);
                    self.fail_batch(&batch, Error::Wire(e));
                    continue;
                }
            };

            tracing::trace!(client = %self.config.name, envelopes = batch.len(), bytes = text.len(), "Flushing");
            if let Err(e) = self.transport.send(text).await {
                tracing::warn!(client = %self.config.name, "Failed to send batch: {}", e);
                self.fail_batch(&batch, Error::Transport(e));
            }
        }
    }

    /// Terminates the operations whose requests were in a failed send.
    fn fail_batch(&self, batch: &[ClientMessage], error: Error) {
        for message in batch {
            let ClientMessage::Request(req) = message else { continue };
            if let Some((_, op)) = self.pending.remove(&req.id) {
                op.observer.error(error.clone());
            }
        }
    }

    async fn pump(inner: Arc<Self>) {
        loop {
            match inner.transport.recv().await {
                Ok(Some(text)) => inner.handle_incoming(&text),
                Ok(None) => {
                    tracing::info!(client = %inner.config.name, "Channel closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(client = %inner.config.name, "Transport error in pump: {}", e);
                    break;
                }
            }
        }

        inner.fail_all(Error::ConnectionClosed);
    }

    fn handle_incoming(&self, text: &str) {
        tracing::trace!(client = %self.config.name, bytes = text.len(), "Received");

        let items = match chanwire::decode_server_batch(text) {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(client = %self.config.name, "Discarding undecodable message: {}", e);
                return;
            }
        };

        for item in items {
            match item {
                Ok(ServerMessage::Response(response)) => self.route(response),
                Ok(ServerMessage::Reconnect) => {
                    tracing::info!(client = %self.config.name, "Server requested reconnect");
                    let _ = self.reconnects.send(());
                }
                Err(e) => {
                    tracing::warn!(client = %self.config.name, "Discarding malformed item: {}", e);
                }
            }
        }
    }

    fn route(&self, response: ResponseEnvelope) {
        let Some(id) = response.id else {
            tracing::warn!(client = %self.config.name, body = ?response.body, "Untargeted response");
            return;
        };

        let observer = self.pending.get(&id).map(|op| Arc::clone(&op.observer));
        let Some(observer) = observer else {
            tracing::warn!(client = %self.config.name, %id, "Discarding response for unknown id");
            return;
        };

        let stopped = response.body.is_stopped();
        observer.next(response.body);

        if stopped {
            if let Some((_, op)) = self.pending.remove(&id) {
                tracing::debug!(client = %self.config.name, %id, "Operation stopped by server");
                op.observer.complete();
            }
        }
    }

    /// Notify all pending operations with the given error.
    fn fail_all(&self, error: Error) {
        self.outbox().take();

        let ids: Vec<RequestId> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, op)) = self.pending.remove(&id) {
                op.observer.error(error.clone());
            }
        }
    }

    fn outbox(&self) -> MutexGuard<'_, Outbox> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
