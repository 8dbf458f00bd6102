//! Integration tests: a client and a server talking over an in-process port pair.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use futures::StreamExt;
use futures::channel::mpsc;
use futures::future::join_all;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use serde_json::json;

use chanrpc::Client;
use chanrpc::ClientConfig;
use chanrpc::Executor;
use chanrpc::Link;
use chanrpc::MemoryPort;
use chanrpc::OperationEvent;
use chanrpc::Outcome;
use chanrpc::ProcedureError;
use chanrpc::Server;
use chanrpc::ServerConfig;
use chanrpc::client::Error;
use chanwire::Call;
use chanwire::ErrorCode;
use chanwire::OperationKind;
use chanwire::TransformError;
use chanwire::Transformer;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    name: String,
    email: String,
}

#[derive(Debug, Deserialize)]
struct UserId {
    id: u64,
}

type FeedSender = mpsc::UnboundedSender<Result<Value, ProcedureError>>;

/// A small user directory with a live event feed.
#[derive(Default)]
struct Directory {
    users: Mutex<HashMap<u64, User>>,
    feeds: Mutex<Vec<FeedSender>>,
    seen_inputs: Mutex<Vec<Value>>,
}

impl Directory {
    fn publish(&self, event: Value) {
        self.feeds.lock().unwrap().retain(|tx| tx.unbounded_send(Ok(event.clone())).is_ok());
    }

    fn live_feeds(&self) -> usize {
        let mut feeds = self.feeds.lock().unwrap();
        feeds.retain(|tx| !tx.is_closed());
        feeds.len()
    }

    fn parse<T: serde::de::DeserializeOwned>(input: Option<Value>) -> Result<T, ProcedureError> {
        let input = input.ok_or_else(|| ProcedureError::bad_request("Missing input"))?;
        serde_json::from_value(input).map_err(|e| ProcedureError::bad_request("Invalid input").with_cause(e))
    }
}

#[async_trait::async_trait]
impl Executor for Directory {
    async fn execute(&self, call: Call) -> Result<Outcome, ProcedureError> {
        if let Some(input) = &call.input {
            self.seen_inputs.lock().unwrap().push(input.clone());
        }

        match (call.kind, call.path.as_str()) {
            (OperationKind::Query, "user.get") => {
                let UserId { id } = Self::parse(call.input)?;
                let user = self.users.lock().unwrap().get(&id).cloned();
                let user = user.ok_or_else(|| ProcedureError::not_found(format!("No user {}", id)))?;
                Ok(Outcome::Value(json!(user)))
            }
            (OperationKind::Mutation, "user.create") => {
                let user: User = Self::parse(call.input)?;
                let id = {
                    let mut users = self.users.lock().unwrap();
                    let id = users.len() as u64 + 1;
                    users.insert(id, user.clone());
                    id
                };
                self.publish(json!({"created": id, "name": user.name}));
                Ok(Outcome::Value(json!({"id": id})))
            }
            (OperationKind::Query, "slow.echo") => {
                let delay = rand::thread_rng().gen_range(0..15);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(Outcome::Value(call.input.unwrap_or(Value::Null)))
            }
            (OperationKind::Subscription, "user.events") => {
                let (tx, rx) = mpsc::unbounded();
                self.feeds.lock().unwrap().push(tx);
                Ok(Outcome::Stream(rx.boxed()))
            }
            (kind, path) => Err(ProcedureError::not_found(format!("No {} at {}", kind, path))),
        }
    }
}

struct Session {
    link: Link,
    server: Server,
    directory: Arc<Directory>,
    port: MemoryPort,
}

fn session() -> Session {
    session_with(None)
}

fn session_with(transformer: Option<Arc<dyn Transformer>>) -> Session {
    init_tracing();

    let (client_end, server_end) = MemoryPort::pair();
    let directory = Arc::new(Directory::default());

    let client_config = ClientConfig::default().with_name("test-client");
    let server_config = ServerConfig::default().with_name("test-server");

    let (link, server) = match transformer {
        None => (
            Link::new(Arc::new(Client::from_port(client_end.emitter_port(), client_config))),
            Server::from_port(server_end.emitter_port(), directory.clone(), server_config),
        ),
        Some(transformer) => (
            Link::with_transformer(
                Arc::new(Client::from_port(client_end.emitter_port(), client_config)),
                Arc::clone(&transformer),
            ),
            Server::with_transformer(
                server_end.emitter_port().into_transport(),
                directory.clone(),
                transformer,
                server_config,
            ),
        ),
    };

    Session { link, server, directory, port: client_end }
}

async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("Condition never became true");
}

// --- Test 1: Typed Query And Mutation ---

#[tokio::test]
async fn test_create_then_get_user() -> anyhow::Result<()> {
    let s = session();
    let ada = User { name: "Ada".into(), email: "ada@example.com".into() };

    let created = s.link.mutation("user.create", Some(serde_json::to_value(&ada)?)).await?;
    assert_eq!(created, json!({"id": 1}));

    let fetched: User = serde_json::from_value(s.link.query("user.get", Some(created)).await?)?;
    assert_eq!(fetched, ada);
    Ok(())
}

// --- Test 2: Remote Failures ---

#[tokio::test]
async fn test_missing_user_and_bad_input_are_remote_errors() -> anyhow::Result<()> {
    let s = session();

    let Err(Error::Remote(shape)) = s.link.query("user.get", Some(json!({"id": 9}))).await else {
        anyhow::bail!("Expected a remote failure");
    };
    assert_eq!(shape.error_code(), ErrorCode::NotFound);
    assert_eq!(shape.data.path.as_deref(), Some("user.get"));

    let Err(Error::Remote(shape)) = s.link.mutation("user.create", Some(json!({"nope": 1}))).await else {
        anyhow::bail!("Expected a remote failure");
    };
    assert_eq!(shape.error_code(), ErrorCode::BadRequest);
    assert_eq!(shape.data.http_status, 400);

    // The session is still usable afterwards.
    assert_eq!(s.link.query("slow.echo", Some(json!("still here"))).await?, json!("still here"));
    Ok(())
}

// --- Test 3: Concurrent Queries Resolve To Their Own Results ---

#[tokio::test]
async fn test_concurrent_queries_resolve_by_id() -> anyhow::Result<()> {
    let s = session();

    // Random per-call delays make responses come back out of order.
    let calls = (0..25).map(|n| {
        let link = s.link.clone();
        async move { link.query("slow.echo", Some(json!({"n": n}))).await }
    });
    let results = join_all(calls).await;

    for (n, result) in results.into_iter().enumerate() {
        assert_eq!(result?, json!({"n": n}));
    }
    assert_eq!(s.link.client().pending_count(), 0);
    Ok(())
}

// --- Test 4: Subscriptions ---

#[tokio::test]
async fn test_subscription_receives_published_events() -> anyhow::Result<()> {
    let s = session();
    let mut events = s.link.subscription("user.events", None);
    assert_eq!(events.next().await, Some(Ok(OperationEvent::Started)));

    s.link
        .mutation("user.create", Some(json!({"name": "Grace", "email": "grace@example.com"})))
        .await?;
    s.directory.publish(json!("tick"));

    assert_eq!(events.next().await, Some(Ok(OperationEvent::Data(json!({"created": 1, "name": "Grace"})))));
    assert_eq!(events.next().await, Some(Ok(OperationEvent::Data(json!("tick")))));
    assert_eq!(s.server.active_subscriptions(), 1);

    events.unsubscribe();
    assert_eq!(events.next().await, None);

    eventually(|| s.server.active_subscriptions() == 0).await;
    eventually(|| s.directory.live_feeds() == 0).await;
    Ok(())
}

#[tokio::test]
async fn test_dropping_stream_stops_server_side() -> anyhow::Result<()> {
    let s = session();

    let mut first = s.link.subscription("user.events", None);
    let mut second = s.link.subscription("user.events", None);
    assert_eq!(first.next().await, Some(Ok(OperationEvent::Started)));
    assert_eq!(second.next().await, Some(Ok(OperationEvent::Started)));
    assert_eq!(s.server.active_subscriptions(), 2);

    drop(first);
    eventually(|| s.server.active_subscriptions() == 1).await;

    s.directory.publish(json!(1));
    assert_eq!(second.next().await, Some(Ok(OperationEvent::Data(json!(1)))));
    Ok(())
}

// --- Test 5: Payload Transformer ---

/// Wraps every payload in `{"$v": ...}` on the wire.
struct Boxed;

impl Transformer for Boxed {
    fn serialize(&self, value: Value) -> Result<Value, TransformError> {
        Ok(json!({"$v": value}))
    }

    fn deserialize(&self, value: Value) -> Result<Value, TransformError> {
        match value {
            Value::Object(mut map) => map.remove("$v").ok_or_else(|| TransformError("missing $v".into())),
            other => Err(TransformError(format!("not boxed: {}", other))),
        }
    }
}

#[tokio::test]
async fn test_transformer_applies_to_input_and_data() -> anyhow::Result<()> {
    let s = session_with(Some(Arc::new(Boxed)));

    assert_eq!(s.link.query("slow.echo", Some(json!([1, 2, 3]))).await?, json!([1, 2, 3]));

    // The executor sees the plain input, not the wire form.
    assert_eq!(*s.directory.seen_inputs.lock().unwrap(), vec![json!([1, 2, 3])]);
    Ok(())
}

// --- Test 6: Session Lifecycle ---

#[tokio::test]
async fn test_reconnect_notification_reaches_client() -> anyhow::Result<()> {
    let s = session();
    let mut reconnects = s.link.client().reconnect_notifications();

    s.server.broadcast_reconnect_notification().await?;

    tokio::time::timeout(Duration::from_secs(1), reconnects.recv()).await??;
    Ok(())
}

#[tokio::test]
async fn test_closing_channel_ends_both_sides() -> anyhow::Result<()> {
    let s = session();
    let mut events = s.link.subscription("user.events", None);
    assert_eq!(events.next().await, Some(Ok(OperationEvent::Started)));

    s.port.close();

    assert_eq!(events.next().await, Some(Err(Error::ConnectionClosed)));
    eventually(|| s.server.is_closed()).await;
    assert_eq!(s.server.active_subscriptions(), 0);
    eventually(|| s.directory.live_feeds() == 0).await;
    Ok(())
}

#[tokio::test]
async fn test_event_port_client_talks_to_emitter_port_server() -> anyhow::Result<()> {
    init_tracing();
    let (client_end, server_end) = MemoryPort::pair();
    let directory = Arc::new(Directory::default());
    let _server = Server::from_port(server_end.emitter_port(), directory, ServerConfig::default());
    let link = Link::new(Arc::new(Client::from_port(
        client_end.event_port(),
        ClientConfig::default().with_batching(false),
    )));

    let (a, b) = tokio::join!(
        link.query("slow.echo", Some(json!("a"))),
        link.query("slow.echo", Some(json!("b"))),
    );
    assert_eq!((a?, b?), (json!("a"), json!("b")));
    Ok(())
}
