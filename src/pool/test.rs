use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::time::sleep;

use crate::config::Config;
use crate::connection_factory::{
    ConnectionFactory, ConnectionInfo, Poolable, TokioTimer,
};
use crate::endpoint::{Endpoint, SslMode};
use crate::error::{Error, ErrorKind};
use crate::instrumentation::StateCounters;
use crate::stats::ConnectionPoolStats;
use crate::topology::{ConnectionString, TopologyListener};

use super::ConnectionPool;

#[derive(Debug, Clone, Copy)]
enum SetupOutcome {
    Succeed(Duration),
    Fail(Duration),
    TimeOut(Duration),
}

#[derive(Default)]
struct FactoryCounters {
    created: AtomicU64,
    connecting: AtomicUsize,
    peak_connecting: AtomicUsize,
    refreshes: AtomicUsize,
}

struct TestFactory {
    scripted: Mutex<VecDeque<SetupOutcome>>,
    default_outcome: SetupOutcome,
    counters: Arc<FactoryCounters>,
}

impl TestFactory {
    fn new(default_outcome: SetupOutcome) -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            default_outcome,
            counters: Arc::new(FactoryCounters::default()),
        }
    }

    fn quick() -> Self {
        Self::new(SetupOutcome::Succeed(Duration::from_millis(5)))
    }

    /// The given outcomes are handed to the first connections created,
    /// in order; everything after that uses the default outcome.
    fn scripted(self, outcomes: Vec<SetupOutcome>) -> Self {
        *self.scripted.lock() = outcomes.into();
        self
    }

    fn counters(&self) -> Arc<FactoryCounters> {
        Arc::clone(&self.counters)
    }
}

impl ConnectionFactory for TestFactory {
    type Connection = TestConn;
    type Timer = TokioTimer;

    fn make_connection(
        &self,
        endpoint: &Endpoint,
        _ssl_mode: SslMode,
        generation: u64,
    ) -> TestConn {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .scripted
            .lock()
            .pop_front()
            .unwrap_or(self.default_outcome);
        TestConn {
            info: ConnectionInfo::new(endpoint.clone(), generation),
            outcome,
            counters: Arc::clone(&self.counters),
        }
    }

    fn make_timer(&self) -> TokioTimer {
        TokioTimer::current()
    }
}

struct TestConn {
    info: ConnectionInfo,
    outcome: SetupOutcome,
    counters: Arc<FactoryCounters>,
}

impl Poolable for TestConn {
    fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut ConnectionInfo {
        &mut self.info
    }

    fn setup(self, _timeout: Duration) -> BoxFuture<'static, (Self, Result<(), Error>)> {
        let counters = Arc::clone(&self.counters);
        async move {
            let connecting = counters.connecting.fetch_add(1, Ordering::SeqCst) + 1;
            counters.peak_connecting.fetch_max(connecting, Ordering::SeqCst);

            let result = match self.outcome {
                SetupOutcome::Succeed(delay) => {
                    sleep(delay).await;
                    Ok(())
                }
                SetupOutcome::Fail(delay) => {
                    sleep(delay).await;
                    Err(Error::new(ErrorKind::ConnectionError))
                }
                SetupOutcome::TimeOut(delay) => {
                    sleep(delay).await;
                    Err(Error::new(ErrorKind::ExceededTimeLimit))
                }
            };

            counters.connecting.fetch_sub(1, Ordering::SeqCst);
            (self, result)
        }
        .boxed()
    }

    fn refresh(self, _timeout: Duration) -> BoxFuture<'static, (Self, Result<(), Error>)> {
        let counters = Arc::clone(&self.counters);
        async move {
            counters.refreshes.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(2)).await;
            let mut conn = self;
            conn.mark_used();
            (conn, Ok(()))
        }
        .boxed()
    }

    fn is_healthy(&mut self) -> bool {
        true
    }
}

fn endpoint() -> Endpoint {
    Endpoint::new("db1", 27017)
}

fn pool_with(
    config: Config,
    factory: TestFactory,
) -> (ConnectionPool<TestFactory>, StateCounters) {
    let _ = pretty_env_logger::try_init();
    let counters = StateCounters::new();
    let pool = ConnectionPool::instrumented(
        config,
        factory,
        ().into(),
        counters.instrumentation(),
    );
    (pool, counters)
}

fn endpoint_stats(pool: &ConnectionPool<TestFactory>, endpoint: &Endpoint) -> crate::stats::EndpointStats {
    let mut stats = ConnectionPoolStats::default();
    pool.append_stats(&mut stats);
    stats.host(endpoint).copied().unwrap_or_default()
}

async fn wait_until<C>(mut condition: C, timeout: Duration, what: &str)
where
    C: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn simple_acquire_round_trip() {
    let factory = TestFactory::quick();
    let (pool, counters) = pool_with(Config::default(), factory);
    let db = endpoint();

    let mut conn = pool
        .get(&db, SslMode::Global, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(counters.checked_out(), 1);

    conn.mark_used();
    conn.mark_success();
    drop(conn);

    wait_until(|| counters.ready() == 1, Duration::from_secs(1), "connection back in ready").await;
    assert_eq!(counters.checked_out(), 0);
    assert_eq!(counters.processing(), 0);

    let stats = endpoint_stats(&pool, &db);
    assert_eq!(stats.available, 1);
    assert_eq!(stats.created, 1);
    assert_eq!(stats.in_use, 0);
}

#[tokio::test]
async fn checkout_times_out_when_setup_is_slow() {
    let factory =
        TestFactory::quick().scripted(vec![SetupOutcome::TimeOut(Duration::from_millis(300))]);
    let counters_f = factory.counters();
    let (pool, counters) = pool_with(Config::default().min_connections(0), factory);
    let db = endpoint();

    let err = pool
        .get(&db, SslMode::Global, Duration::from_millis(50))
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::ExceededTimeLimit);

    // The pending connection is still being set up.
    assert_eq!(counters.processing(), 1);
    assert_eq!(pool.num_connections(&db), 1);

    // Once its own time budget runs out it is discarded and, with no
    // minimum to hold, nothing replaces it.
    wait_until(|| counters.processing() == 0, Duration::from_secs(1), "setup to give up").await;
    assert_eq!(counters.connections(), 0);
    assert_eq!(counters_f.created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failure_cascade_fails_all_waiters_and_invalidates_stragglers() {
    let factory = TestFactory::new(SetupOutcome::Succeed(Duration::from_millis(10))).scripted(vec![
        SetupOutcome::Fail(Duration::from_millis(50)),
        SetupOutcome::Succeed(Duration::from_millis(200)),
        SetupOutcome::Succeed(Duration::from_millis(200)),
    ]);
    let (pool, counters) = pool_with(Config::default().min_connections(3), factory);
    let db = endpoint();

    let first = pool.get(&db, SslMode::Global, Duration::from_secs(5));
    let second = pool.get(&db, SslMode::Global, Duration::from_secs(5));

    let (first, second) = futures::join!(first, second);
    let first_err = first.err().unwrap();
    let second_err = second.err().unwrap();
    assert_eq!(first_err.kind(), ErrorKind::ConnectionError);
    assert_eq!(second_err.kind(), ErrorKind::ConnectionError);

    // The two stragglers complete fine but belong to the old generation;
    // they are discarded and the pool respawns toward its minimum.
    wait_until(
        || counters.ready() == 3 && counters.connections() == 3,
        Duration::from_secs(2),
        "pool to re-converge on its minimum",
    )
    .await;
    assert_eq!(counters.checked_out(), 0);
    assert_eq!(counters.requests(), 0);
}

#[tokio::test]
async fn failover_warms_the_whole_club() {
    let factory = TestFactory::quick();
    let config = Config::default()
        .refresh_timeout(Duration::from_millis(100))
        .refresh_requirement(Duration::from_millis(200))
        .host_timeout(Duration::from_secs(60));
    let (pool, counters) = pool_with(config, factory);

    let a = Endpoint::new("a", 27017);
    let b = Endpoint::new("b", 27017);
    let c = Endpoint::new("c", 27017);
    let members = ConnectionString::new("rs0", vec![a.clone(), b.clone(), c.clone()]);

    pool.handle_config(&members);

    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(
            pool.get(&a, SslMode::Global, Duration::from_secs(1))
                .await
                .unwrap(),
        );
    }
    assert_eq!(counters.checked_out(), 4);

    pool.handle_primary("rs0", &b);
    pool.handle_config(&members);

    // While a still has four connections checked out, b and c each keep
    // four warm connections standing by.
    wait_until(
        || pool.num_connections(&b) == 4 && pool.num_connections(&c) == 4,
        Duration::from_secs(2),
        "secondaries to warm up",
    )
    .await;

    for conn in &mut held {
        conn.mark_used();
        conn.mark_success();
    }
    held.clear();

    // With the checkouts gone the club floor falls back to one and the
    // excess ages out at the refresh requirement.
    wait_until(
        || {
            pool.num_connections(&a) == 1
                && pool.num_connections(&b) == 1
                && pool.num_connections(&c) == 1
        },
        Duration::from_secs(5),
        "pools to decay to the configured minimum",
    )
    .await;
}

#[tokio::test]
async fn idle_pools_tear_down_club_wide() {
    let factory = TestFactory::quick();
    let config = Config::default()
        .refresh_timeout(Duration::from_millis(50))
        .refresh_requirement(Duration::from_millis(100))
        .host_timeout(Duration::from_millis(250));
    let (pool, counters) = pool_with(config, factory);
    let db = endpoint();

    let mut conn = pool
        .get(&db, SslMode::Global, Duration::from_secs(1))
        .await
        .unwrap();
    conn.mark_used();
    conn.mark_success();
    drop(conn);

    assert_eq!(counters.pools(), 1);

    wait_until(|| counters.pools() == 0, Duration::from_secs(2), "idle pool teardown").await;
    assert_eq!(pool.num_connections(&db), 0);
    wait_until(|| counters.connections() == 0, Duration::from_secs(1), "stragglers to drain").await;

    // A later request simply builds a fresh pool.
    let mut conn = pool
        .get(&db, SslMode::Global, Duration::from_secs(1))
        .await
        .unwrap();
    conn.mark_used();
    conn.mark_success();
    drop(conn);
    assert_eq!(counters.pools(), 1);
}

#[tokio::test]
async fn max_connecting_limits_concurrent_setups() {
    let factory = TestFactory::new(SetupOutcome::Succeed(Duration::from_millis(30)));
    let counters_f = factory.counters();
    let (pool, counters) = pool_with(
        Config::default().max_connections(10).max_connecting(2),
        factory,
    );
    let db = endpoint();

    let checkouts: Vec<_> = (0..10)
        .map(|_| pool.get(&db, SslMode::Global, Duration::from_secs(5)))
        .collect();

    let results = futures::future::join_all(checkouts).await;
    let mut held = Vec::new();
    for result in results {
        held.push(result.unwrap());
    }

    assert!(counters_f.peak_connecting.load(Ordering::SeqCst) <= 2);
    assert_eq!(counters.connections(), 10);
    assert_eq!(counters.checked_out(), 10);

    for conn in &mut held {
        conn.mark_used();
        conn.mark_success();
    }
}

#[tokio::test]
async fn requests_are_served_in_deadline_order() {
    let factory = TestFactory::new(SetupOutcome::Succeed(Duration::from_millis(50)));
    let config = Config::default()
        .max_connections(1)
        .refresh_timeout(Duration::from_secs(2))
        .refresh_requirement(Duration::from_secs(3))
        .host_timeout(Duration::from_secs(60));
    let (pool, _counters) = pool_with(config, factory);
    let db = endpoint();

    // Enqueued first but with the laxer deadline.
    let mut relaxed = pool.get(&db, SslMode::Global, Duration::from_millis(900));
    let urgent = pool.get(&db, SslMode::Global, Duration::from_millis(300));

    // The single connection goes to the earlier deadline, not the
    // earlier enqueue.
    let mut conn = tokio::time::timeout(Duration::from_millis(200), urgent)
        .await
        .expect("urgent checkout should be served first")
        .unwrap();

    let still_waiting = tokio::time::timeout(Duration::from_millis(20), &mut relaxed).await;
    assert!(still_waiting.is_err());

    conn.mark_used();
    conn.mark_success();
    drop(conn);

    let mut conn = relaxed.await.unwrap();
    conn.mark_used();
    conn.mark_success();
}

#[tokio::test]
async fn try_get_only_serves_warm_connections() {
    let factory = TestFactory::quick();
    let (pool, counters) = pool_with(Config::default(), factory);
    let db = endpoint();

    assert!(pool.try_get(&db, SslMode::Global).is_none());

    let mut conn = pool
        .get(&db, SslMode::Global, Duration::from_secs(1))
        .await
        .unwrap();
    conn.mark_used();
    conn.mark_success();
    drop(conn);
    wait_until(|| counters.ready() == 1, Duration::from_secs(1), "warm connection").await;

    let mut conn = pool.try_get(&db, SslMode::Global).expect("warm connection");
    conn.mark_used();
    conn.mark_success();
    drop(conn);
    wait_until(|| counters.ready() == 1, Duration::from_secs(1), "connection returned").await;

    pool.drop_connections(&db);
    assert_eq!(counters.ready(), 0);
    assert!(pool.try_get(&db, SslMode::Global).is_none());
}

#[tokio::test]
async fn unindicated_connections_are_not_reused() {
    let factory = TestFactory::quick();
    let (pool, counters) = pool_with(Config::default().min_connections(0), factory);
    let db = endpoint();

    let conn = pool
        .get(&db, SslMode::Global, Duration::from_secs(1))
        .await
        .unwrap();
    // Nobody vouches for the connection before it goes back.
    drop(conn);

    wait_until(|| counters.checked_out() == 0, Duration::from_secs(1), "return").await;
    assert_eq!(counters.ready(), 0);
    assert_eq!(counters.connections(), 0);
}

#[tokio::test]
async fn shutdown_is_idempotent_and_fails_waiters() {
    let factory = TestFactory::new(SetupOutcome::Succeed(Duration::from_millis(500)));
    let (pool, counters) = pool_with(Config::default(), factory);
    let db = endpoint();

    let pending = pool.get(&db, SslMode::Global, Duration::from_secs(5));
    pool.shutdown();

    let err = pending.await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::ShutdownInProgress);

    wait_until(|| counters.pools() == 0, Duration::from_secs(2), "pools to delist").await;
    wait_until(|| counters.connections() == 0, Duration::from_secs(2), "stragglers to drain").await;

    // A second shutdown finds nothing left to do.
    pool.shutdown();
    assert_eq!(counters.pools(), 0);
    assert_eq!(counters.requests(), 0);
}

#[tokio::test]
async fn tag_mask_drop_spares_matching_pools() {
    let factory = TestFactory::quick();
    let (pool, counters) = pool_with(Config::default(), factory);
    let spared = Endpoint::new("spared", 27017);
    let dropped = Endpoint::new("dropped", 27017);

    for db in [&spared, &dropped] {
        let mut conn = pool
            .get(db, SslMode::Global, Duration::from_secs(1))
            .await
            .unwrap();
        conn.mark_used();
        conn.mark_success();
    }
    wait_until(|| counters.ready() == 2, Duration::from_secs(1), "two warm pools").await;

    let fenced: crate::endpoint::TagMask = 1 << 4;
    pool.mutate_tags(&spared, |tags| tags | fenced);
    pool.drop_connections_by_tag(fenced);

    assert_eq!(endpoint_stats(&pool, &spared).available, 1);
    assert_eq!(endpoint_stats(&pool, &dropped).available, 0);
}

#[tokio::test]
async fn idle_connections_are_kept_fresh_at_the_minimum() {
    let factory = TestFactory::quick();
    let counters_f = factory.counters();
    let config = Config::default()
        .refresh_timeout(Duration::from_millis(50))
        .refresh_requirement(Duration::from_millis(100))
        .host_timeout(Duration::from_secs(60));
    let (pool, counters) = pool_with(config, factory);
    let db = endpoint();

    let mut conn = pool
        .get(&db, SslMode::Global, Duration::from_secs(1))
        .await
        .unwrap();
    conn.mark_used();
    conn.mark_success();
    drop(conn);

    // The sole connection is refreshed instead of lapsing, over and
    // over, because dropping it would sink the pool below its floor.
    wait_until(
        || counters_f.refreshes.load(Ordering::SeqCst) >= 2,
        Duration::from_secs(2),
        "periodic refreshes",
    )
    .await;
    assert_eq!(counters.connections(), 1);
}

#[tokio::test]
async fn manager_drops_across_registered_pools() {
    let (pool, counters) = pool_with(Config::default(), TestFactory::quick());
    let db = endpoint();

    let manager = super::EgressTagCloserManager::new();
    pool.register(&manager);

    let mut conn = pool
        .get(&db, SslMode::Global, Duration::from_secs(1))
        .await
        .unwrap();
    conn.mark_used();
    conn.mark_success();
    drop(conn);
    wait_until(|| counters.ready() == 1, Duration::from_secs(1), "warm connection").await;

    manager.drop_connections_by_tag(1 << 7);
    assert_eq!(counters.ready(), 0);
}

#[tokio::test]
#[should_panic]
async fn mixing_ssl_modes_aborts() {
    let factory = TestFactory::quick();
    let (pool, _counters) = pool_with(Config::default(), factory);
    let db = endpoint();

    let mut conn = pool
        .get(&db, SslMode::Disabled, Duration::from_secs(1))
        .await
        .unwrap();
    conn.mark_used();
    conn.mark_success();
    drop(conn);

    let _ = pool.get(&db, SslMode::Enabled, Duration::from_secs(1));
}
