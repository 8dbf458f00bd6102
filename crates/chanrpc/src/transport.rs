//! # Transport Abstraction
//!
//! A minimal, async interface for moving wire text between two endpoints.
//!
//! ## Philosophy
//!
//! - **Text-Oriented**: The Transport knows nothing about envelopes, ids, or
//!   procedures. It moves opaque strings.
//! - **Fire-and-Forget**: `send` does not wait for, or imply, any reply.
//!   Correlation is built on top of this, not defined here.
//! - **Two Port Flavors**: Real channel primitives come either as
//!   listener-registration ports (`EventPort`) or as emitter ports with a close
//!   notification (`EmitterPort`). `Port` picks the adapter once, at
//!   construction; nothing probes the primitive after that.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::sync::Mutex;
use tokio::sync::mpsc;

/// Errors that occur at the channel layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// The port was closed; nothing more can be sent on it.
    Closed,
    /// Generic failure inside the underlying primitive.
    Io(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Closed => write!(f, "Port closed"),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Receives each inbound message.
pub type MessageHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Runs once when the remote end disconnects.
pub type CloseHandler = Box<dyn FnOnce() + Send>;

/// Identifies a registered listener on an `EventPort`.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct ListenerId(pub u64);

/// A duplex channel for wire text.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one message. No delivery acknowledgment.
    ///
    /// # invariants
    /// - Must not interpret the payload.
    /// - A single call is delivered as a single message, never split.
    async fn send(&self, payload: String) -> Result<()>;

    /// Waits for the next inbound message.
    ///
    /// Returns `Ok(None)` once the channel has signalled closure. Channels that
    /// cannot signal closure never return `Ok(None)`.
    async fn recv(&self) -> Result<Option<String>>;
}

/// A port in the listener-registration style:
/// `postMessage` + `addEventListener("message")` / `removeEventListener`.
pub trait EventPort: Send + Sync + 'static {
    fn post_message(&self, message: String) -> Result<()>;
    fn add_message_listener(&self, handler: MessageHandler) -> ListenerId;
    fn remove_message_listener(&self, id: ListenerId);
}

/// A port in the emitter style:
/// `postMessage` + `on("message")` / `off("message")` / `once("close")`.
pub trait EmitterPort: Send + Sync + 'static {
    fn post_message(&self, message: String) -> Result<()>;
    fn on_message(&self, handler: MessageHandler) -> ListenerId;
    fn off_message(&self, id: ListenerId);
    fn once_close(&self, handler: CloseHandler);
}

/// A channel primitive of either flavor.
#[derive(Clone)]
pub enum Port {
    Event(Arc<dyn EventPort>),
    Emitter(Arc<dyn EmitterPort>),
}

impl Port {
    /// Wraps the primitive in the matching adapter.
    pub fn into_transport(self) -> Arc<dyn Transport> {
        match self {
            Self::Event(port) => Arc::new(EventPortTransport::new(port)),
            Self::Emitter(port) => Arc::new(EmitterPortTransport::new(port)),
        }
    }
}

enum Delivery {
    Message(String),
    Closed,
}

/// Bridges callback-style delivery into `recv().await`.
struct Inbox {
    rx: Mutex<mpsc::UnboundedReceiver<Delivery>>,
    closed: AtomicBool,
}

impl Inbox {
    fn new() -> (mpsc::UnboundedSender<Delivery>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inbox = Self { rx: Mutex::new(rx), closed: AtomicBool::new(false) };
        (tx, inbox)
    }

    async fn recv(&self) -> Result<Option<String>> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(Delivery::Message(msg)) => Ok(Some(msg)),
            Some(Delivery::Closed) => {
                self.closed.store(true, Ordering::Release);
                Ok(None)
            }
            // Every sender lives inside a registered handler; losing all of them
            // means the port dropped its listeners.
            None => Err(Error::ConnectionLost("Port dropped its listeners".into())),
        }
    }
}

fn forward_to(tx: mpsc::UnboundedSender<Delivery>) -> MessageHandler {
    Arc::new(move |msg| {
        let _ = tx.send(Delivery::Message(msg));
    })
}

/// Adapter for `EventPort`. Has no close notification.
pub struct EventPortTransport {
    port: Arc<dyn EventPort>,
    listener: ListenerId,
    inbox: Inbox,
}

impl EventPortTransport {
    pub fn new(port: Arc<dyn EventPort>) -> Self {
        let (tx, inbox) = Inbox::new();
        let listener = port.add_message_listener(forward_to(tx));
        Self { port, listener, inbox }
    }
}

impl Drop for EventPortTransport {
    fn drop(&mut self) {
        self.port.remove_message_listener(self.listener);
    }
}

#[async_trait::async_trait]
impl Transport for EventPortTransport {
    async fn send(&self, payload: String) -> Result<()> {
        self.port.post_message(payload)
    }

    async fn recv(&self) -> Result<Option<String>> {
        self.inbox.recv().await
    }
}

/// Adapter for `EmitterPort`. Surfaces the close notification as `Ok(None)`.
pub struct EmitterPortTransport {
    port: Arc<dyn EmitterPort>,
    listener: ListenerId,
    inbox: Inbox,
}

impl EmitterPortTransport {
    pub fn new(port: Arc<dyn EmitterPort>) -> Self {
        let (tx, inbox) = Inbox::new();
        let close_tx = tx.clone();
        let listener = port.on_message(forward_to(tx));
        port.once_close(Box::new(move || {
            let _ = close_tx.send(Delivery::Closed);
        }));
        Self { port, listener, inbox }
    }
}

impl Drop for EmitterPortTransport {
    fn drop(&mut self) {
        self.port.off_message(self.listener);
    }
}

#[async_trait::async_trait]
impl Transport for EmitterPortTransport {
    async fn send(&self, payload: String) -> Result<()> {
        self.port.post_message(payload)
    }

    async fn recv(&self) -> Result<Option<String>> {
        self.inbox.recv().await
    }
}
