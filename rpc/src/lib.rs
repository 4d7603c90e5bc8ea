//! Broker-backed messaging RPC.
//!
//! Servers register versioned [`RpcHandler`]s on a [`Dispatcher`], attach it
//! to a topic through [`Connection::create_consumer`], and run the consume
//! loop. Clients go through a [`Pool`] and a [`Client`] for `call`, `cast`,
//! `fanout_cast`, `multicall` and `notify`.

pub mod client;
pub mod config;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod pool;

pub use client::{Client, MulticallStream};
pub use config::RpcConfig;
pub use connection::{Connection, ConsumerThread};
pub use context::Context;
pub use dispatcher::{
    Dispatcher, HandlerError, Replies, RpcHandler, Serializer, Version,
    DEFAULT_VERSION,
};
pub use error::RpcError;
pub use message::{FailureInfo, Message, RemoteErrorKind, Reply, Request};
pub use pool::{Pool, PooledConnection};
