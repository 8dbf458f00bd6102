//! # Client Link
//!
//! Maps "issue an operation, get a stream of results" onto the correlation
//! table.
//!
//! - Query and mutation are single-shot: the first data result is terminal.
//!   The link forwards it and unsubscribes at once, without waiting for the
//!   server to say `stopped`.
//! - A subscription forwards every result until the server stops it, the
//!   caller cancels, or an error arrives.
//! - A completion the link did not ask for, and that was not preceded by a
//!   server `stopped`, surfaces as `Error::EndedPrematurely`.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::task::Context;
use std::task::Poll;

use futures::Stream;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use chanwire::Call;
use chanwire::Identity;
use chanwire::OperationKind;
use chanwire::RequestId;
use chanwire::ResponseBody;
use chanwire::ResultPayload;
use chanwire::Transformer;

use crate::client::Client;
use crate::client::Error;
use crate::client::Observer;
use crate::client::RequestHandle;
use crate::client::Result;

/// One item of an operation's result stream.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationEvent {
    /// The server registered the subscription.
    Started,
    /// A result, already through the transformer.
    Data(Value),
}

/// Caller-facing access to a `Client`.
#[derive(Clone)]
pub struct Link {
    client: Arc<Client>,
    transformer: Arc<dyn Transformer>,
}

impl Link {
    pub fn new(client: Arc<Client>) -> Self {
        Self::with_transformer(client, Arc::new(Identity))
    }

    pub fn with_transformer(client: Arc<Client>, transformer: Arc<dyn Transformer>) -> Self {
        Self { client, transformer }
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Issues an operation of any kind and returns its result stream.
    pub fn operation(&self, kind: OperationKind, path: impl Into<String>, input: Option<Value>) -> OperationStream {
        let (tx, rx) = mpsc::unbounded_channel();

        let input = match input.map(|v| self.transformer.serialize(v)).transpose() {
            Ok(input) => input,
            Err(e) => {
                let _ = tx.send(Err(Error::Transform(e)));
                return OperationStream { rx, id: None, observer: None };
            }
        };

        let observer = Arc::new(LinkObserver {
            kind,
            transformer: Arc::clone(&self.transformer),
            state: Mutex::new(LinkState {
                done: false,
                tx: Some(tx),
                handle: None,
                release_requested: false,
            }),
        });

        let handle = self.client.issue(Call::new(kind, path, input), observer.clone());
        let id = handle.id().clone();
        observer.attach(handle);

        OperationStream { rx, id: Some(id), observer: Some(observer) }
    }

    pub async fn query(&self, path: impl Into<String>, input: Option<Value>) -> Result<Value> {
        self.single_shot(OperationKind::Query, path.into(), input).await
    }

    pub async fn mutation(&self, path: impl Into<String>, input: Option<Value>) -> Result<Value> {
        self.single_shot(OperationKind::Mutation, path.into(), input).await
    }

    pub fn subscription(&self, path: impl Into<String>, input: Option<Value>) -> OperationStream {
        self.operation(OperationKind::Subscription, path, input)
    }

    async fn single_shot(&self, kind: OperationKind, path: String, input: Option<Value>) -> Result<Value> {
        let mut stream = self.operation(kind, path, input);
        while let Some(item) = stream.next().await {
            match item? {
                OperationEvent::Data(value) => return Ok(value),
                OperationEvent::Started => continue,
            }
        }
        Err(Error::EndedPrematurely)
    }
}

/// The result stream of one operation.
///
/// Ends after the last result. Dropping it cancels the operation.
pub struct OperationStream {
    rx: mpsc::UnboundedReceiver<Result<OperationEvent>>,
    id: Option<RequestId>,
    observer: Option<Arc<LinkObserver>>,
}

impl OperationStream {
    /// The request id, if the operation was issued.
    pub fn id(&self) -> Option<&RequestId> {
        self.id.as_ref()
    }

    /// Cancels the operation. The stream ends; the server is told for subscriptions.
    pub fn unsubscribe(&self) {
        if let Some(observer) = &self.observer {
            observer.cancel();
        }
    }
}

impl Stream for OperationStream {
    type Item = Result<OperationEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for OperationStream {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

struct LinkState {
    done: bool,
    /// Taken when the stream must end.
    tx: Option<mpsc::UnboundedSender<Result<OperationEvent>>>,
    handle: Option<RequestHandle>,
    /// Set when a release was needed before `attach` ran.
    release_requested: bool,
}

impl LinkState {
    fn emit(&self, item: Result<OperationEvent>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(item);
        }
    }

    fn finish(&mut self, last: Option<Result<OperationEvent>>) {
        self.done = true;
        if let Some(tx) = self.tx.take() {
            if let Some(item) = last {
                let _ = tx.send(item);
            }
        }
    }
}

struct LinkObserver {
    kind: OperationKind,
    transformer: Arc<dyn Transformer>,
    state: Mutex<LinkState>,
}

impl LinkObserver {
    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attach(&self, handle: RequestHandle) {
        let mut state = self.lock();
        if state.release_requested {
            drop(state);
            handle.unsubscribe();
        } else {
            state.handle = Some(handle);
        }
    }

    /// Removes the operation from the table. Must run without the state lock.
    fn release(&self) {
        let handle = {
            let mut state = self.lock();
            let handle = state.handle.take();
            if handle.is_none() {
                state.release_requested = true;
            }
            handle
        };
        if let Some(handle) = handle {
            handle.unsubscribe();
        }
    }

    fn cancel(&self) {
        self.lock().finish(None);
        self.release();
    }
}

impl Observer for LinkObserver {
    fn next(&self, body: ResponseBody) {
        let release = {
            let mut state = self.lock();
            if state.done {
                return;
            }

            match body {
                ResponseBody::Error(shape) => {
                    state.finish(Some(Err(Error::Remote(shape))));
                    true
                }
                ResponseBody::Result(ResultPayload::Started) => {
                    if !self.kind.is_single_shot() {
                        state.emit(Ok(OperationEvent::Started));
                    }
                    false
                }
                ResponseBody::Result(ResultPayload::Stopped) => {
                    // The table completes the operation right after this.
                    state.done = true;
                    false
                }
                ResponseBody::Result(ResultPayload::Data { data }) => match self.transformer.deserialize(data) {
                    Err(e) => {
                        state.finish(Some(Err(Error::Transform(e))));
                        true
                    }
                    Ok(value) if self.kind.is_single_shot() => {
                        state.finish(Some(Ok(OperationEvent::Data(value))));
                        true
                    }
                    Ok(value) => {
                        state.emit(Ok(OperationEvent::Data(value)));
                        false
                    }
                },
            }
        };

        if release {
            self.release();
        }
    }

    fn error(&self, error: Error) {
        {
            let mut state = self.lock();
            if state.done {
                return;
            }
            state.finish(Some(Err(error)));
        }
        self.release();
    }

    fn complete(&self) {
        let mut state = self.lock();
        if state.done {
            state.finish(None);
        } else {
            state.finish(Some(Err(Error::EndedPrematurely)));
        }
    }
}
