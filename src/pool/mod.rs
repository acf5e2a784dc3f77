//! The top level connection pool.
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::Config;
use crate::connection_factory::ConnectionFactory;
use crate::endpoint::{Endpoint, SslMode, TagMask};
use crate::executor_flavour::ExecutorFlavour;
use crate::instrumentation::{Instrumentation, InstrumentationFlavour};
use crate::stats::ConnectionPoolStats;
use crate::topology::{ConnectionString, TopologyListener, TopologyNotifier};

use endpoint_pool::PoolCore;

pub use checkout::{Checkout, PoolConnection};

mod checkout;
mod endpoint_pool;

#[cfg(test)]
mod test;

/// An egress connection pool keyed by endpoint.
///
/// Callers ask for a connection to a host and port and get a future that
/// resolves to a ready to use [`PoolConnection`]. The pool creates
/// endpoint pools lazily, keeps them warm according to the configured
/// floor and the traffic of their replica set, refreshes idle
/// connections, and tears endpoint pools down again once a whole replica
/// set has gone quiet.
///
/// Cloning is cheap and every clone drives the same pool.
pub struct ConnectionPool<F: ConnectionFactory> {
    core: Arc<PoolCore<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    pub fn new(config: Config, factory: F, executor: ExecutorFlavour) -> Self {
        Self::create(config, factory, executor, InstrumentationFlavour::NoInstrumentation)
    }

    pub fn instrumented<I>(
        config: Config,
        factory: F,
        executor: ExecutorFlavour,
        instrumentation: I,
    ) -> Self
    where
        I: Instrumentation + Send + Sync + 'static,
    {
        Self::create(
            config,
            factory,
            executor,
            InstrumentationFlavour::Custom(Arc::new(instrumentation)),
        )
    }

    fn create(
        config: Config,
        factory: F,
        executor: ExecutorFlavour,
        instrumentation: InstrumentationFlavour,
    ) -> Self {
        let config = config.sanitized();
        Self {
            core: Arc::new(PoolCore::new(config, factory, executor, instrumentation)),
        }
    }

    /// Requests a connection to the given endpoint.
    ///
    /// The effective deadline is `now + min(timeout, refresh_timeout)`.
    /// If a warm connection is available and nobody is queued ahead, the
    /// returned future is already complete. Otherwise the request is
    /// queued and served in deadline order as connections become ready.
    pub fn get(&self, endpoint: &Endpoint, ssl_mode: SslMode, timeout: Duration) -> Checkout<F> {
        self.core.get(endpoint, ssl_mode, timeout)
    }

    /// Hands out a warm connection if one is available right now and no
    /// requests are queued. Never blocks and never spawns connections.
    pub fn try_get(&self, endpoint: &Endpoint, ssl_mode: SslMode) -> Option<PoolConnection<F>> {
        self.core.try_get(endpoint, ssl_mode)
    }

    /// Drops all connections to the given endpoint and fails its queued
    /// requests.
    pub fn drop_connections(&self, endpoint: &Endpoint) {
        PoolCore::drop_connections(&self.core, endpoint);
    }

    /// Drops the connections of every endpoint pool whose tags do not
    /// intersect the given mask.
    pub fn drop_connections_by_tag(&self, tags: TagMask) {
        PoolCore::drop_connections_by_tag(&self.core, tags);
    }

    /// Atomically manipulates the tags of the given endpoint's pool.
    pub fn mutate_tags<M>(&self, endpoint: &Endpoint, mutate: M)
    where
        M: FnOnce(TagMask) -> TagMask,
    {
        self.core.mutate_tags(endpoint, mutate);
    }

    /// Appends the per endpoint connection counts to `stats`.
    pub fn append_stats(&self, stats: &mut ConnectionPoolStats) {
        self.core.append_stats(stats);
    }

    /// The number of open connections (ready, refreshing or checked out)
    /// to the given endpoint.
    pub fn num_connections(&self, endpoint: &Endpoint) -> usize {
        self.core.num_connections(endpoint)
    }

    /// Shuts the whole pool down: the factory first, then a cascade over
    /// every endpoint pool. Queued requests fail with
    /// `ErrorKind::ShutdownInProgress`. Calling this twice is harmless.
    pub fn shutdown(&self) {
        self.core.shutdown();
    }

    /// Registers this pool with a topology notifier so config and
    /// primary changes flow into the replica set clubs.
    pub fn subscribe(&self, notifier: &TopologyNotifier) {
        notifier.add_listener(Arc::new(self.clone()));
    }

    /// Registers this pool with a process wide manager for fleet wide
    /// drop operations. The manager only holds a weak reference.
    pub fn register(&self, manager: &EgressTagCloserManager) {
        let trait_arc: Arc<dyn EgressTagCloser> = self.core.clone();
        let weak: Weak<dyn EgressTagCloser> = Arc::downgrade(&trait_arc);
        manager.add(weak);
    }
}

impl<F: ConnectionFactory> TopologyListener for ConnectionPool<F> {
    fn handle_config(&self, config: &ConnectionString) {
        self.core.handle_config(config);
    }

    fn handle_primary(&self, set_name: &str, primary: &Endpoint) {
        self.core.handle_primary(set_name, primary);
    }
}

/// Something whose connections can be dropped by tag or endpoint.
pub trait EgressTagCloser: Send + Sync + 'static {
    fn drop_connections_by_tag(self: Arc<Self>, tags: TagMask);

    fn drop_connections(self: Arc<Self>, endpoint: &Endpoint);
}

impl<F: ConnectionFactory> EgressTagCloser for PoolCore<F> {
    fn drop_connections_by_tag(self: Arc<Self>, tags: TagMask) {
        PoolCore::drop_connections_by_tag(&self, tags);
    }

    fn drop_connections(self: Arc<Self>, endpoint: &Endpoint) {
        PoolCore::drop_connections(&self, endpoint);
    }
}

/// A process wide registry of pools, used to drop connections across
/// every registered pool at once, e.g. when the process fences itself
/// off from a subset of its peers.
///
/// Registrations are weak: a pool that goes away is skipped and cleaned
/// out on the next operation.
#[derive(Default)]
pub struct EgressTagCloserManager {
    closers: Mutex<Vec<Weak<dyn EgressTagCloser>>>,
}

impl EgressTagCloserManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, closer: Weak<dyn EgressTagCloser>) {
        let mut closers = self.closers.lock();
        closers.retain(|closer| closer.upgrade().is_some());
        closers.push(closer);
    }

    /// Drops, in every registered pool, the connections of all endpoint
    /// pools whose tags do not intersect the mask.
    pub fn drop_connections_by_tag(&self, tags: TagMask) {
        for closer in self.alive() {
            closer.drop_connections_by_tag(tags);
        }
    }

    /// Drops the connections to one endpoint in every registered pool.
    pub fn drop_connections(&self, endpoint: &Endpoint) {
        for closer in self.alive() {
            closer.drop_connections(endpoint);
        }
    }

    fn alive(&self) -> Vec<Arc<dyn EgressTagCloser>> {
        let mut closers = self.closers.lock();
        closers.retain(|closer| closer.upgrade().is_some());
        closers.iter().filter_map(|closer| closer.upgrade()).collect()
    }
}
