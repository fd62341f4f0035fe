//! ku-chat daemon - connection registry, frame dispatch and push delivery
//!
//! This crate provides the real-time core of the chat backend:
//! - `connection` - Per-client state, bounded outbound queue, reader/writer tasks
//! - `registry` - Map from online user to their single live connection
//! - `dispatch` - Handler table routing inbound frames by message kind
//! - `hub` - Attaches authenticated sockets to the registry and dispatcher
//! - `server` - TCP listener with the identify handshake
//! - `config` - TOML configuration with environment overrides
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        kuchatd                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │   ChatServer    │────▶│          Registry           │   │
//! │  │  (TCP + hello)  │     │   UserId -> Arc<Connection> │   │
//! │  └────────┬────────┘     └──────────────┬──────────────┘   │
//! │           │ Hub::accept                 │ get / broadcast  │
//! │           ▼                             │                   │
//! │  ┌─────────────────┐     ┌──────────────┴──────────────┐   │
//! │  │ reader / writer │────▶│         Dispatcher          │   │
//! │  │ (per client)    │     │    kind -> Handler          │   │
//! │  └─────────────────┘     └─────────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Any task holding a [`Registry`] can push to an online user:
//! `registry.get(&user)` then `connection.try_send(payload)`. Each
//! connection's writer task is the only code that touches its socket, so
//! concurrent pushes are written whole and in queue order.
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully
//! - A panicking handler is caught and reported, never taking down its
//!   connection

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod hub;
pub mod registry;
pub mod server;

pub use config::{Config, ConfigError};
pub use connection::{Connection, ConnectionId, OverflowPolicy, SendError};
pub use dispatch::{
    default_dispatcher, DispatchError, Dispatcher, DispatcherBuilder, Handler, HandlerError,
    Request,
};
pub use hub::Hub;
pub use registry::{
    spawn_idle_reaper, BroadcastReport, PresenceEvent, Registry, RegistryError,
};
pub use server::{ChatServer, HandshakeError, ServerError};
