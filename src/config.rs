//! Configuration for a `ConnectionPool`.
use std::time::Duration;

use log::warn;

use crate::error::InitializationResult;
use crate::helpers;

/// A configuration for creating a `ConnectionPool`.
///
/// The durations are constrained at load time:
/// `refresh_timeout < refresh_requirement < host_timeout`. A violation is
/// corrected by nudging the next value up by one millisecond and logging a
/// warning.
#[derive(Debug, Clone)]
pub struct Config {
    /// The number of warm connections to keep per endpoint while the
    /// endpoint pool is in operation.
    ///
    /// The default is 1.
    pub min_connections: usize,
    /// The hard ceiling of connections per endpoint, counting ready,
    /// processing and checked out connections.
    ///
    /// The default is unbounded.
    pub max_connections: usize,
    /// The ceiling on connections concurrently running their setup or
    /// refresh handshake per endpoint. This rate limits connection storms
    /// rather than steady state processing.
    ///
    /// The default is unbounded.
    pub max_connecting: usize,
    /// The idle duration after which a connection must be refreshed
    /// before it may be handed out again.
    ///
    /// The default is 60 seconds.
    pub refresh_requirement: Duration,
    /// The time budget for a single setup or refresh attempt. This is
    /// also the upper bound for any checkout timeout.
    ///
    /// The default is 20 seconds.
    pub refresh_timeout: Duration,
    /// The idle duration after which an endpoint pool may be torn down.
    /// Teardown is coordinated across the replica set club the pool
    /// belongs to.
    ///
    /// The default is 300 seconds.
    pub host_timeout: Duration,
}

impl Config {
    /// Sets the number of warm connections to keep per endpoint.
    pub fn min_connections(mut self, v: usize) -> Self {
        self.min_connections = v;
        self
    }

    /// Sets the hard ceiling of connections per endpoint.
    pub fn max_connections(mut self, v: usize) -> Self {
        self.max_connections = v;
        self
    }

    /// Sets the ceiling on concurrently connecting connections per
    /// endpoint.
    pub fn max_connecting(mut self, v: usize) -> Self {
        self.max_connecting = v;
        self
    }

    /// Sets the idle duration after which a connection must be refreshed.
    pub fn refresh_requirement(mut self, v: Duration) -> Self {
        self.refresh_requirement = v;
        self
    }

    /// Sets the time budget for a single setup or refresh attempt.
    pub fn refresh_timeout(mut self, v: Duration) -> Self {
        self.refresh_timeout = v;
        self
    }

    /// Sets the idle duration after which an endpoint pool may be torn
    /// down.
    pub fn host_timeout(mut self, v: Duration) -> Self {
        self.host_timeout = v;
        self
    }

    /// The profile used by routers that fan out to many shards: the
    /// connecting ceiling is capped so a cold start does not storm every
    /// backend at once.
    pub fn sharded() -> Self {
        Self::default().max_connecting(2)
    }

    /// Updates this configuration from the environment.
    ///
    /// If no `prefix` is given all keys start with `EGRESSPOOL_`.
    /// Otherwise the prefix is used with an automatically appended `_`.
    ///
    /// * `MIN_CONNECTIONS`: `usize`. Omit if you do not want to update the value
    /// * `MAX_CONNECTIONS`: `usize`. Omit if you do not want to update the value
    /// * `MAX_CONNECTING`: `usize`. Omit if you do not want to update the value
    /// * `REFRESH_REQUIREMENT_MS`: `u64`. Omit if you do not want to update the value
    /// * `REFRESH_TIMEOUT_MS`: `u64`. Omit if you do not want to update the value
    /// * `HOST_TIMEOUT_MS`: `u64`. Omit if you do not want to update the value
    pub fn update_from_environment(&mut self, prefix: Option<&str>) -> InitializationResult<()> {
        helpers::set_min_connections(prefix, |v| {
            self.min_connections = v;
        })?;

        helpers::set_max_connections(prefix, |v| {
            self.max_connections = v;
        })?;

        helpers::set_max_connecting(prefix, |v| {
            self.max_connecting = v;
        })?;

        helpers::set_refresh_requirement(prefix, |v| {
            self.refresh_requirement = v;
        })?;

        helpers::set_refresh_timeout(prefix, |v| {
            self.refresh_timeout = v;
        })?;

        helpers::set_host_timeout(prefix, |v| {
            self.host_timeout = v;
        })?;

        Ok(())
    }

    /// Enforces `refresh_timeout < refresh_requirement < host_timeout` by
    /// nudging each violated value one millisecond past its lower bound.
    pub fn sanitized(mut self) -> Self {
        if self.refresh_requirement <= self.refresh_timeout {
            let nudged = self.refresh_timeout + Duration::from_millis(1);
            warn!(
                "refresh_requirement ({:?}) must be greater than refresh_timeout ({:?}) - using {:?}",
                self.refresh_requirement, self.refresh_timeout, nudged
            );
            self.refresh_requirement = nudged;
        }

        if self.host_timeout <= self.refresh_requirement {
            let nudged = self.refresh_requirement + Duration::from_millis(1);
            warn!(
                "host_timeout ({:?}) must be greater than refresh_requirement ({:?}) - using {:?}",
                self.host_timeout, self.refresh_requirement, nudged
            );
            self.host_timeout = nudged;
        }

        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: usize::max_value(),
            max_connecting: usize::max_value(),
            refresh_requirement: Duration::from_secs(60),
            refresh_timeout: Duration::from_secs(20),
            host_timeout: Duration::from_secs(300),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_config_is_already_sane() {
        let config = Config::default();
        let sanitized = config.clone().sanitized();
        assert_eq!(sanitized.refresh_requirement, config.refresh_requirement);
        assert_eq!(sanitized.host_timeout, config.host_timeout);
    }

    #[test]
    fn sanitize_nudges_violations_by_one_milli() {
        let config = Config::default()
            .refresh_timeout(Duration::from_secs(10))
            .refresh_requirement(Duration::from_secs(10))
            .host_timeout(Duration::from_secs(5))
            .sanitized();

        assert_eq!(
            config.refresh_requirement,
            Duration::from_secs(10) + Duration::from_millis(1)
        );
        assert_eq!(
            config.host_timeout,
            config.refresh_requirement + Duration::from_millis(1)
        );
    }

    #[test]
    fn sharded_profile_limits_connecting() {
        let config = Config::sharded();
        assert_eq!(config.max_connecting, 2);
        assert_eq!(config.min_connections, 1);
    }
}
