//! # egresspool
//!
//! An asynchronous egress connection pool for clients of replica set
//! databases.
//!
//! Callers ask the [`ConnectionPool`] for a connection to an endpoint
//! (host and port) and receive a future that resolves to a ready to use
//! [`PoolConnection`]. The pool owns the whole life cycle behind that:
//! it creates connections through a [`ConnectionFactory`], runs their one
//! time setup handshake, keeps them warm, refreshes them once they sit
//! idle for too long, retires them when they report trouble and tears a
//! whole endpoint pool down again once its replica set has gone quiet.
//!
//! ## Replica set awareness
//!
//! Endpoint pools belonging to one replica set are grouped into a club
//! which shares an effective minimum connection count: if any member has
//! N connections checked out, every member keeps at least N warm
//! connections around. Traffic shifted to a new primary after a failover
//! finds a warm pool waiting. Feed topology changes to the pool by
//! subscribing it to a [`TopologyNotifier`].
//!
//! ## What this crate does not do
//!
//! The wire protocol, TLS negotiation and topology discovery live
//! elsewhere; the pool only sees the [`Poolable`] and
//! [`ConnectionFactory`] traits. There is no load balancing across
//! endpoints and no retry of command level operations.
mod config;
mod connection_factory;
mod endpoint;
mod error;
mod executor_flavour;
mod helpers;
mod pool;
mod stats;
mod topology;

pub mod instrumentation;

pub use crate::config::Config;
pub use crate::connection_factory::{
    ConnectionFactory, ConnectionInfo, ConnectionStatus, Poolable, Timer, TokioTimer,
};
pub use crate::endpoint::{Endpoint, ParseEndpointError, SslMode, TagMask, TAG_PENDING};
pub use crate::error::{Error, ErrorKind, InitializationError, InitializationResult};
pub use crate::executor_flavour::ExecutorFlavour;
pub use crate::pool::{
    Checkout, ConnectionPool, EgressTagCloser, EgressTagCloserManager, PoolConnection,
};
pub use crate::stats::{ConnectionPoolStats, EndpointStats};
pub use crate::topology::{
    ConnectionString, ParseConnectionStringError, TopologyListener, TopologyNotifier,
};
