//! # chanrpc
//!
//! Typed query, mutation and subscription calls over a channel that only
//! moves opaque messages, such as a worker port or a browser message channel.
//!
//! ## Architecture
//!
//! - `transport`: the `Transport` trait and the two port adapters.
//! - `memory`: an in-process port pair.
//! - `client`: the correlation table, with batched flushing.
//! - `link`: result streams on top of the client.
//! - `server`: the dispatcher, with the live subscription table.
//! - `procedure`: the `Executor` seam the dispatcher calls into.
//! - `shape`: how failures become wire error shapes.
//! - `config`: endpoint configuration.

pub mod client;
pub mod config;
pub mod link;
pub mod memory;
mod outbox;
pub mod procedure;
pub mod server;
pub mod shape;
pub mod transport;


pub use client::Client;
pub use client::Observer;
pub use client::RequestHandle;
pub use config::ClientConfig;
pub use config::ServerConfig;
pub use link::Link;
pub use link::OperationEvent;
pub use link::OperationStream;
pub use memory::MemoryPort;
pub use procedure::Executor;
pub use procedure::Outcome;
pub use procedure::ProcedureError;
pub use procedure::ProcedureStream;
pub use server::Server;
pub use shape::ErrorEvent;
pub use shape::ErrorHook;
pub use transport::Port;
pub use transport::Transport;
