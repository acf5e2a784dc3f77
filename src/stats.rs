use std::collections::HashMap;

use crate::endpoint::Endpoint;

/// A snapshot of one endpoint pool's connection counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    /// Connections currently checked out by callers.
    pub in_use: usize,
    /// Ready connections available for checkout.
    pub available: usize,
    /// Connections created over the lifetime of the endpoint pool.
    pub created: u64,
    /// Connections currently running their setup or refresh handshake.
    pub refreshing: usize,
}

/// Aggregated statistics over all endpoint pools, filled in by
/// `ConnectionPool::append_stats`.
#[derive(Debug, Default)]
pub struct ConnectionPoolStats {
    hosts: HashMap<Endpoint, EndpointStats>,
    total_in_use: usize,
    total_available: usize,
    total_created: u64,
    total_refreshing: usize,
}

impl ConnectionPoolStats {
    pub fn update_stats_for_host(&mut self, endpoint: Endpoint, stats: EndpointStats) {
        self.total_in_use += stats.in_use;
        self.total_available += stats.available;
        self.total_created += stats.created;
        self.total_refreshing += stats.refreshing;

        let entry = self.hosts.entry(endpoint).or_default();
        entry.in_use += stats.in_use;
        entry.available += stats.available;
        entry.created += stats.created;
        entry.refreshing += stats.refreshing;
    }

    pub fn host(&self, endpoint: &Endpoint) -> Option<&EndpointStats> {
        self.hosts.get(endpoint)
    }

    pub fn hosts(&self) -> impl Iterator<Item = (&Endpoint, &EndpointStats)> {
        self.hosts.iter()
    }

    pub fn total_in_use(&self) -> usize {
        self.total_in_use
    }

    pub fn total_available(&self) -> usize {
        self.total_available
    }

    pub fn total_created(&self) -> u64 {
        self.total_created
    }

    pub fn total_refreshing(&self) -> usize {
        self.total_refreshing
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn totals_accumulate_over_hosts() {
        let mut stats = ConnectionPoolStats::default();
        stats.update_stats_for_host(
            Endpoint::new("a", 1),
            EndpointStats {
                in_use: 2,
                available: 1,
                created: 5,
                refreshing: 1,
            },
        );
        stats.update_stats_for_host(
            Endpoint::new("b", 2),
            EndpointStats {
                in_use: 1,
                available: 3,
                created: 4,
                refreshing: 0,
            },
        );

        assert_eq!(stats.total_in_use(), 3);
        assert_eq!(stats.total_available(), 4);
        assert_eq!(stats.total_created(), 9);
        assert_eq!(stats.total_refreshing(), 1);
        assert_eq!(stats.host(&Endpoint::new("a", 1)).unwrap().in_use, 2);
    }
}
