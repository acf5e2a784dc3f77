use std::io::{self, Write};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use log::info;

use crate::endpoint::Endpoint;

use super::Instrumentation;

/// Running totals derived from the pool's instrumentation events: how
/// many endpoint pools and connections exist, how many connections sit
/// ready, are checked out or are mid setup/refresh, how many checkout
/// requests are queued, and how many tasks are contending for the lock.
///
/// Intended for tests, which use the counters to observe state
/// transitions without reaching into the pool.
///
/// Call `instrumentation` to get an `Instrumentation` to hand to the
/// pool; the counters are shared between the two.
///
/// Each counter is an independent atomic, so a snapshot assembled from
/// several of them can mix moments in time, and any logged or printed
/// value may be stale by the time it appears. That is the price of not
/// serializing the readers; assertions should poll for a settled state
/// rather than trust a single instantaneous read.
#[derive(Clone, Default)]
pub struct StateCounters {
    pools: Arc<AtomicUsize>,
    connections: Arc<AtomicUsize>,
    ready: Arc<AtomicUsize>,
    checked_out: Arc<AtomicUsize>,
    processing: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
    contention: Arc<AtomicUsize>,
    log: bool,
    print: bool,
}

impl StateCounters {
    /// Create a new `StateCounters`.
    ///
    /// This method checks the environment:
    ///
    /// * If an env var "PRINT" is set, counter changes will be printed to stdout.
    /// * If an env var "LOG" or "RUST_LOG" is set counter changes will be logged
    /// at info level
    pub fn new() -> Self {
        let mut me = Self::default();
        if std::env::var("RUST_LOG").is_ok() || std::env::var("LOG").is_ok() {
            me.log = true;
        }

        if std::env::var("PRINT").is_ok() {
            me.print = true;
        }

        me
    }

    /// Log counter changes at info level
    pub fn with_logging() -> Self {
        let mut me = Self::default();
        me.log = true;
        me
    }

    /// Print counter changes to stdout
    pub fn with_printing() -> Self {
        let mut me = Self::default();
        me.print = true;
        me
    }

    pub fn pools(&self) -> usize {
        self.pools.load(Ordering::SeqCst)
    }
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
    pub fn ready(&self) -> usize {
        self.ready.load(Ordering::SeqCst)
    }
    pub fn checked_out(&self) -> usize {
        self.checked_out.load(Ordering::SeqCst)
    }
    pub fn processing(&self) -> usize {
        self.processing.load(Ordering::SeqCst)
    }
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
    pub fn contention(&self) -> usize {
        self.contention.load(Ordering::SeqCst)
    }

    /// Create the `Instrumentation` to be put into the pool to instrument.
    pub fn instrumentation(&self) -> StateCountersInstrumentation {
        StateCountersInstrumentation {
            pools: Arc::clone(&self.pools),
            connections: Arc::clone(&self.connections),
            ready: Arc::clone(&self.ready),
            checked_out: Arc::clone(&self.checked_out),
            processing: Arc::clone(&self.processing),
            requests: Arc::clone(&self.requests),
            contention: Arc::clone(&self.contention),
            log: self.log,
            print: self.print,
        }
    }
}

pub struct StateCountersInstrumentation {
    pools: Arc<AtomicUsize>,
    connections: Arc<AtomicUsize>,
    ready: Arc<AtomicUsize>,
    checked_out: Arc<AtomicUsize>,
    processing: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
    contention: Arc<AtomicUsize>,
    log: bool,
    print: bool,
}

impl StateCountersInstrumentation {
    fn output_required(&self) -> bool {
        self.log || self.print
    }

    fn output(&self, msg: &str) {
        if self.log {
            info!("{}", msg);
        }

        if self.print {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            let _ = handle.write_all(msg.as_bytes());
            let _ = handle.write_all(b"\n");
        }
    }
}

impl Instrumentation for StateCountersInstrumentation {
    fn pool_added(&self, endpoint: &Endpoint) {
        let n = self.pools.fetch_add(1, Ordering::SeqCst) + 1;
        if self.output_required() {
            self.output(&format!("[{}] pool added (+1): {}", endpoint, n));
        }
    }

    fn pool_removed(&self, endpoint: &Endpoint) {
        let n = self.pools.fetch_sub(1, Ordering::SeqCst) - 1;
        if self.output_required() {
            self.output(&format!("[{}] pool removed (-1): {}", endpoint, n));
        }
    }

    fn connection_created(&self, endpoint: &Endpoint) {
        let n = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
        if self.output_required() {
            self.output(&format!("[{}] connection created (+1): {}", endpoint, n));
        }
    }

    fn connection_dropped(&self, endpoint: &Endpoint) {
        let n = self.connections.fetch_sub(1, Ordering::SeqCst) - 1;
        if self.output_required() {
            self.output(&format!("[{}] connection dropped (-1): {}", endpoint, n));
        }
    }

    fn checked_out_connection(&self, endpoint: &Endpoint) {
        let n = self.checked_out.fetch_add(1, Ordering::SeqCst) + 1;
        if self.output_required() {
            self.output(&format!("[{}] checked out +1: {}", endpoint, n));
        }
    }

    fn checked_in_connection(&self, endpoint: &Endpoint) {
        let n = self.checked_out.fetch_sub(1, Ordering::SeqCst) - 1;
        if self.output_required() {
            self.output(&format!("[{}] checked in -1: {}", endpoint, n));
        }
    }

    fn ready_inc(&self, endpoint: &Endpoint) {
        let n = self.ready.fetch_add(1, Ordering::SeqCst) + 1;
        if self.output_required() {
            self.output(&format!("[{}] ready +1: {}", endpoint, n));
        }
    }

    fn ready_dec(&self, endpoint: &Endpoint) {
        let n = self.ready.fetch_sub(1, Ordering::SeqCst) - 1;
        if self.output_required() {
            self.output(&format!("[{}] ready -1: {}", endpoint, n));
        }
    }

    fn processing_inc(&self, endpoint: &Endpoint) {
        let n = self.processing.fetch_add(1, Ordering::SeqCst) + 1;
        if self.output_required() {
            self.output(&format!("[{}] processing +1: {}", endpoint, n));
        }
    }

    fn processing_dec(&self, endpoint: &Endpoint) {
        let n = self.processing.fetch_sub(1, Ordering::SeqCst) - 1;
        if self.output_required() {
            self.output(&format!("[{}] processing -1: {}", endpoint, n));
        }
    }

    fn request_enqueued(&self, endpoint: &Endpoint) {
        let n = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        if self.output_required() {
            self.output(&format!("[{}] request enqueued (+1): {}", endpoint, n));
        }
    }

    fn request_fulfilled(&self, endpoint: &Endpoint, waited_for: Duration) {
        let n = self.requests.fetch_sub(1, Ordering::SeqCst) - 1;
        if self.output_required() {
            self.output(&format!(
                "[{}] request fulfilled after {:?} (-1): {}",
                endpoint, waited_for, n
            ));
        }
    }

    fn request_timed_out(&self, endpoint: &Endpoint) {
        let n = self.requests.fetch_sub(1, Ordering::SeqCst) - 1;
        if self.output_required() {
            self.output(&format!("[{}] request timed out (-1): {}", endpoint, n));
        }
    }

    fn request_failed(&self, endpoint: &Endpoint) {
        let n = self.requests.fetch_sub(1, Ordering::SeqCst) - 1;
        if self.output_required() {
            self.output(&format!("[{}] request failed (-1): {}", endpoint, n));
        }
    }

    fn failure_cascade(&self, endpoint: &Endpoint) {
        if self.output_required() {
            self.output(&format!("[{}] failure cascade", endpoint));
        }
    }

    fn reached_lock(&self) {
        self.contention.fetch_add(1, Ordering::SeqCst);
    }

    fn passed_lock(&self, _wait_time: Duration) {
        self.contention.fetch_sub(1, Ordering::SeqCst);
    }

    fn lock_released(&self, _exclusive_lock_time: Duration) {}
}
