//! Replica set topology events and their distribution.
//!
//! The pool does not discover topology itself. Some external monitor
//! feeds a `TopologyNotifier`, and everything interested in membership or
//! primary changes registers a `TopologyListener` with it.
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::endpoint::Endpoint;

/// The membership of one replica set: its name and current servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    set_name: String,
    servers: Vec<Endpoint>,
}

impl ConnectionString {
    pub fn new<T: Into<String>>(set_name: T, servers: Vec<Endpoint>) -> Self {
        Self {
            set_name: set_name.into(),
            servers,
        }
    }

    pub fn set_name(&self) -> &str {
        &self.set_name
    }

    pub fn servers(&self) -> &[Endpoint] {
        &self.servers
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/", self.set_name)?;
        for (i, server) in self.servers.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", server)?;
        }
        Ok(())
    }
}

impl FromStr for ConnectionString {
    type Err = ParseConnectionStringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(2, '/');
        let set_name = parts.next().unwrap_or("");
        let servers = parts.next().ok_or_else(|| {
            ParseConnectionStringError(format!("'{}' is missing the server list", s))
        })?;

        if set_name.is_empty() {
            return Err(ParseConnectionStringError(format!(
                "'{}' is missing the set name",
                s
            )));
        }

        let servers = servers
            .split(',')
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.trim()
                    .parse::<Endpoint>()
                    .map_err(|err| ParseConnectionStringError(err.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if servers.is_empty() {
            return Err(ParseConnectionStringError(format!(
                "'{}' contains no servers",
                s
            )));
        }

        Ok(ConnectionString::new(set_name, servers))
    }
}

#[derive(Debug)]
pub struct ParseConnectionStringError(String);

impl fmt::Display for ParseConnectionStringError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "could not parse ConnectionString: {}", self.0)
    }
}

impl std::error::Error for ParseConnectionStringError {}

/// Receives confirmed topology changes from a `TopologyNotifier`.
pub trait TopologyListener: Send + Sync + 'static {
    /// The set's confirmed membership changed.
    fn handle_config(&self, config: &ConnectionString);

    /// The set elected a new primary.
    fn handle_primary(&self, set_name: &str, primary: &Endpoint);
}

type Hook = Arc<dyn Fn(&ConnectionString) + Send + Sync + 'static>;

#[derive(Default)]
struct LastChange {
    config: Option<ConnectionString>,
    primary: Option<Endpoint>,
}

#[derive(Default)]
struct NotifierInner {
    listeners: Vec<Arc<dyn TopologyListener>>,
    last_change: HashMap<String, LastChange>,
    sync_hook: Option<Hook>,
    async_hook: Option<Hook>,
}

/// Fans replica set topology events out to registered listeners.
///
/// Listeners are called under the notifier's own lock, in registration
/// order. A listener registered late is replayed the last known config
/// and primary of every set so it does not start blind.
///
/// Besides the listeners there is a pair of free form hooks invoked on
/// every (including unconfirmed) config: the sync hook runs inline, the
/// async hook on a one shot detached thread so a slow consumer cannot
/// stall the monitor. Each hook may be registered only once; registering
/// it twice is a programming error.
#[derive(Default)]
pub struct TopologyNotifier {
    inner: Mutex<NotifierInner>,
}

impl TopologyNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_sync_hook<H>(&self, hook: H)
    where
        H: Fn(&ConnectionString) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.sync_hook.is_some() {
            panic!("a sync topology hook is already registered");
        }
        inner.sync_hook = Some(Arc::new(hook));
    }

    pub fn register_async_hook<H>(&self, hook: H)
    where
        H: Fn(&ConnectionString) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.async_hook.is_some() {
            panic!("an async topology hook is already registered");
        }
        inner.async_hook = Some(Arc::new(hook));
    }

    /// Registers a listener and replays the last known state of every
    /// replica set to it.
    pub fn add_listener(&self, listener: Arc<dyn TopologyListener>) {
        let mut inner = self.inner.lock();

        for (set_name, data) in &inner.last_change {
            if let Some(ref config) = data.config {
                listener.handle_config(config);
            }
            if let Some(ref primary) = data.primary {
                listener.handle_primary(set_name, primary);
            }
        }

        inner.listeners.push(listener);
    }

    /// Distributes a confirmed config to the hooks and all listeners.
    pub fn update_config(&self, config: ConnectionString) {
        self.fire_hooks(&config);

        let mut inner = self.inner.lock();
        let data = inner
            .last_change
            .entry(config.set_name().to_string())
            .or_default();
        data.config = Some(config.clone());

        for listener in &inner.listeners {
            listener.handle_config(&config);
        }
    }

    /// Distributes a primary change to all listeners.
    pub fn update_primary(&self, set_name: &str, primary: Endpoint) {
        let mut inner = self.inner.lock();
        let data = inner.last_change.entry(set_name.to_string()).or_default();
        data.primary = Some(primary.clone());

        for listener in &inner.listeners {
            listener.handle_primary(set_name, &primary);
        }
    }

    /// Runs the hooks for a config that has not been confirmed by the
    /// monitor yet. Listeners are not told about these.
    pub fn update_unconfirmed_config(&self, config: ConnectionString) {
        self.fire_hooks(&config);
    }

    fn fire_hooks(&self, config: &ConnectionString) {
        let (sync_hook, async_hook) = {
            let inner = self.inner.lock();
            (inner.sync_hook.clone(), inner.async_hook.clone())
        };

        if let Some(hook) = sync_hook {
            hook(config);
        }

        if let Some(hook) = async_hook {
            let config = config.clone();
            thread::spawn(move || hook(&config));
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct RecordingListener {
        configs: AtomicUsize,
        primaries: AtomicUsize,
    }

    impl TopologyListener for RecordingListener {
        fn handle_config(&self, _config: &ConnectionString) {
            self.configs.fetch_add(1, Ordering::SeqCst);
        }

        fn handle_primary(&self, _set_name: &str, _primary: &Endpoint) {
            self.primaries.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> ConnectionString {
        "rs0/a:27017,b:27017".parse().unwrap()
    }

    #[test]
    fn parse_connection_string() {
        let config = config();
        assert_eq!(config.set_name(), "rs0");
        assert_eq!(config.servers().len(), 2);
        assert_eq!(config.to_string(), "rs0/a:27017,b:27017");
    }

    #[test]
    fn listeners_receive_updates() {
        let notifier = TopologyNotifier::new();
        let listener = Arc::new(RecordingListener::default());
        notifier.add_listener(listener.clone());

        notifier.update_config(config());
        notifier.update_primary("rs0", Endpoint::new("a", 27017));

        assert_eq!(listener.configs.load(Ordering::SeqCst), 1);
        assert_eq!(listener.primaries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_listener_gets_replay() {
        let notifier = TopologyNotifier::new();
        notifier.update_config(config());
        notifier.update_primary("rs0", Endpoint::new("a", 27017));

        let listener = Arc::new(RecordingListener::default());
        notifier.add_listener(listener.clone());

        assert_eq!(listener.configs.load(Ordering::SeqCst), 1);
        assert_eq!(listener.primaries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unconfirmed_configs_do_not_reach_listeners() {
        let notifier = TopologyNotifier::new();
        let listener = Arc::new(RecordingListener::default());
        notifier.add_listener(listener.clone());

        notifier.update_unconfirmed_config(config());

        assert_eq!(listener.configs.load(Ordering::SeqCst), 0);
    }

    #[test]
    #[should_panic]
    fn double_sync_hook_registration_aborts() {
        let notifier = TopologyNotifier::new();
        notifier.register_sync_hook(|_| {});
        notifier.register_sync_hook(|_| {});
    }
}
