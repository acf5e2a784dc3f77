//! The per endpoint pool state machine and the replica set clubs tying
//! endpoint pools together.
//!
//! Everything in here lives under one mutex, the `SyncMap`. Work that has
//! to leave the critical section (connection construction, setup and
//! refresh handshakes, spawn passes) is parked in the map's deferred job
//! list and launched by whoever drops the lock.
use std::cmp;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::ops;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::oneshot;

use crate::config::Config;
use crate::connection_factory::{ConnectionFactory, Poolable, Timer};
use crate::endpoint::{Endpoint, SslMode, TagMask, TAG_PENDING};
use crate::error::{Error, ErrorKind};
use crate::executor_flavour::ExecutorFlavour;
use crate::instrumentation::{Instrumentation, InstrumentationFlavour};
use crate::stats::{ConnectionPoolStats, EndpointStats};
use crate::topology::ConnectionString;

use super::checkout::{Checkout, PoolConnection};

pub(crate) type PoolId = u64;
pub(crate) type ConnId = u64;
type ClubId = u64;

/// The life cycle of an endpoint pool.
///
/// A pool begins running. It moves to idle when no requests are pending
/// and no connections are checked out, and on to host-timed-out once the
/// host timeout passes. Shutdown is entered either explicitly or when
/// every pool of the club has timed out, and the pool is delisted once
/// its in flight work has drained.
///
/// Any new request moves the pool back to running and restarts the
/// timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    Running,
    Idle,
    HostTimedOut,
    InShutdown,
}

/// A queued checkout, ordered so that the earliest deadline is served
/// first.
struct Request<F: ConnectionFactory> {
    expires_at: Instant,
    enqueued_at: Instant,
    sender: oneshot::Sender<Result<PoolConnection<F>, Error>>,
}

impl<F: ConnectionFactory> PartialEq for Request<F> {
    fn eq(&self, other: &Self) -> bool {
        self.expires_at == other.expires_at
    }
}

impl<F: ConnectionFactory> Eq for Request<F> {}

impl<F: ConnectionFactory> PartialOrd for Request<F> {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<F: ConnectionFactory> Ord for Request<F> {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        // Reversed so the binary heap pops the earliest deadline.
        other.expires_at.cmp(&self.expires_at)
    }
}

/// A warm connection waiting to be checked out, together with its armed
/// self refresh timer.
struct ReadyEntry<F: ConnectionFactory> {
    conn_id: ConnId,
    conn: F::Connection,
    timer: F::Timer,
}

/// A group of endpoint pools belonging to one replica set.
///
/// The club carries the effective minimum connection count: the
/// configured floor, or the largest number of connections any member
/// currently has checked out, whichever is greater. When traffic moves to
/// another member after a failover, the new primary finds a warm pool
/// waiting.
struct PoolClub {
    name: Option<String>,
    default_min_conns: usize,
    min_conns: usize,
    primary: Option<Endpoint>,
    members: HashSet<Endpoint>,
}

/// Work discovered under the lock that must run outside of it.
enum Job<F: ConnectionFactory> {
    Setup {
        endpoint: Endpoint,
        pool_id: PoolId,
        conn_id: ConnId,
        ssl_mode: SslMode,
        generation: u64,
    },
    Refresh {
        endpoint: Endpoint,
        pool_id: PoolId,
        conn_id: ConnId,
        conn: F::Connection,
    },
    SpawnPass {
        endpoint: Endpoint,
        pool_id: PoolId,
    },
}

/// The per endpoint state machine.
///
/// Connections are owned by exactly one of four places: the ready queue
/// (object held here), the processing set, the dropped processing set
/// (ids only, the object travels through the setup/refresh future) or the
/// checked out set (ids only, the object lives in the caller's handle).
struct EndpointPool<F: ConnectionFactory> {
    id: PoolId,
    club: ClubId,
    ssl_mode: SslMode,
    ready: VecDeque<ReadyEntry<F>>,
    processing: HashSet<ConnId>,
    dropped_processing: HashSet<ConnId>,
    checked_out: HashSet<ConnId>,
    requests: BinaryHeap<Request<F>>,
    request_timer: F::Timer,
    request_timer_expiration: Option<Instant>,
    active_clients: usize,
    generation: u64,
    created: u64,
    tags: TagMask,
    state: PoolState,
}

impl<F: ConnectionFactory> EndpointPool<F> {
    fn open_connections(&self) -> usize {
        self.ready.len() + self.processing.len() + self.checked_out.len()
    }

    fn matches_tags(&self, tags: TagMask) -> bool {
        self.tags & tags != 0
    }

    fn set_or_check_ssl_mode(&mut self, desired: SslMode) {
        if self.created == 0 {
            self.ssl_mode = desired;
            return;
        }
        self.check_ssl_mode(desired);
    }

    fn check_ssl_mode(&self, desired: SslMode) {
        if self.created > 0 && desired != self.ssl_mode {
            panic!("mixing ssl modes for a single endpoint is not supported");
        }
    }
}

/// Everything under the pool mutex.
struct PoolMap<F: ConnectionFactory> {
    pools: HashMap<Endpoint, EndpointPool<F>>,
    clubs: HashMap<ClubId, PoolClub>,
    set_clubs: HashMap<String, ClubId>,
    deferred: Vec<Job<F>>,
}

impl<F: ConnectionFactory> PoolMap<F> {
    fn new() -> Self {
        Self {
            pools: HashMap::new(),
            clubs: HashMap::new(),
            set_clubs: HashMap::new(),
            deferred: Vec::new(),
        }
    }
}

/// The pool mutex, reporting contention to the instrumentation.
struct SyncMap<F: ConnectionFactory> {
    mutex: Mutex<PoolMap<F>>,
    instrumentation: InstrumentationFlavour,
}

impl<F: ConnectionFactory> SyncMap<F> {
    fn new(instrumentation: InstrumentationFlavour) -> Self {
        Self {
            mutex: Mutex::new(PoolMap::new()),
            instrumentation,
        }
    }

    fn lock(&self) -> MapGuard<F> {
        self.instrumentation.reached_lock();
        let reached_lock_at = Instant::now();
        let guard = self.mutex.lock();
        self.instrumentation.passed_lock(reached_lock_at.elapsed());

        MapGuard {
            inner: guard,
            locked_at: Instant::now(),
            instrumentation: self.instrumentation.clone(),
        }
    }
}

struct MapGuard<'a, F: ConnectionFactory> {
    inner: MutexGuard<'a, PoolMap<F>>,
    locked_at: Instant,
    instrumentation: InstrumentationFlavour,
}

impl<'a, F: ConnectionFactory> ops::Deref for MapGuard<'a, F> {
    type Target = PoolMap<F>;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'a, F: ConnectionFactory> ops::DerefMut for MapGuard<'a, F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl<'a, F: ConnectionFactory> Drop for MapGuard<'a, F> {
    fn drop(&mut self) {
        self.instrumentation.lock_released(self.locked_at.elapsed());
    }
}

/// The shared heart of a `ConnectionPool`.
///
/// Checkout handles, timers and in flight setup futures all hold an
/// `Arc` of this and address their endpoint pool by `(Endpoint, PoolId)`.
/// A callback that finds no pool under its endpoint, a pool with a
/// different id or a stale generation releases its connection and does
/// nothing else.
pub(crate) struct PoolCore<F: ConnectionFactory> {
    map: SyncMap<F>,
    factory: F,
    executor: ExecutorFlavour,
    config: Config,
    instrumentation: InstrumentationFlavour,
    ids: AtomicU64,
}

impl<F: ConnectionFactory> PoolCore<F> {
    pub(crate) fn new(
        config: Config,
        factory: F,
        executor: ExecutorFlavour,
        instrumentation: InstrumentationFlavour,
    ) -> Self {
        Self {
            map: SyncMap::new(instrumentation.clone()),
            factory,
            executor,
            config,
            instrumentation,
            ids: AtomicU64::new(1),
        }
    }

    pub(crate) fn executor(&self) -> &ExecutorFlavour {
        &self.executor
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, AtomicOrdering::Relaxed)
    }

    /// Launches the deferred jobs collected under the given guard after
    /// releasing it.
    fn flush(self: &Arc<Self>, mut guard: MapGuard<F>) {
        let jobs = std::mem::take(&mut guard.deferred);
        drop(guard);
        for job in jobs {
            self.launch(job);
        }
    }

    fn launch(self: &Arc<Self>, job: Job<F>) {
        match job {
            Job::Setup {
                endpoint,
                pool_id,
                conn_id,
                ssl_mode,
                generation,
            } => {
                let core = Arc::clone(self);
                let timeout = self.config.refresh_timeout;
                self.executor.execute(async move {
                    let conn = core.factory.make_connection(&endpoint, ssl_mode, generation);
                    let (conn, result) = conn.setup(timeout).await;
                    core.finish_refresh(&endpoint, pool_id, conn_id, conn, result);
                });
            }
            Job::Refresh {
                endpoint,
                pool_id,
                conn_id,
                conn,
            } => {
                let core = Arc::clone(self);
                let timeout = self.config.refresh_timeout;
                self.executor.execute(async move {
                    let (conn, result) = conn.refresh(timeout).await;
                    core.finish_refresh(&endpoint, pool_id, conn_id, conn, result);
                });
            }
            Job::SpawnPass { endpoint, pool_id } => {
                let core = Arc::clone(self);
                self.executor.execute(async move {
                    core.spawn_pass(endpoint, pool_id);
                });
            }
        }
    }

    /// Re-enters a specific pool from a callback: looks it up, verifies
    /// it is still the same pool instance and holds an active client
    /// count across the body so the pool cannot delist underneath it.
    fn enter<B>(self: &Arc<Self>, endpoint: &Endpoint, pool_id: PoolId, body: B)
    where
        B: FnOnce(&mut PoolMap<F>, &Arc<Self>),
    {
        let mut guard = self.map.lock();
        {
            let map = &mut *guard;
            let entered = match map.pools.get_mut(endpoint) {
                Some(pool) if pool.id == pool_id => {
                    pool.active_clients += 1;
                    true
                }
                _ => {
                    trace!("stale callback for {}", endpoint);
                    false
                }
            };

            if entered {
                body(map, self);

                if let Some(pool) = map.pools.get_mut(endpoint) {
                    if pool.id == pool_id {
                        pool.active_clients -= 1;
                    }
                }
                Self::update_state(map, self, endpoint);
            }
        }
        self.flush(guard);
    }

    // ==== CHECKOUT ====

    pub(crate) fn get(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        ssl_mode: SslMode,
        timeout: Duration,
    ) -> Checkout<F> {
        let mut guard = self.map.lock();
        let checkout;
        {
            let map = &mut *guard;
            let pool_id = Self::ensure_pool(map, self, endpoint);

            let mut in_shutdown = false;
            let mut has_waiters = false;
            if let Some(pool) = map.pools.get_mut(endpoint) {
                pool.set_or_check_ssl_mode(ssl_mode);
                in_shutdown = pool.state == PoolState::InShutdown;
                has_waiters = !pool.requests.is_empty();
            }

            if in_shutdown {
                checkout = Checkout::error(ErrorKind::ShutdownInProgress);
            } else {
                let mut immediate = None;
                if !has_waiters {
                    immediate = Self::try_get_internal(map, self, endpoint);
                }

                if let Some(handle) = immediate {
                    Self::update_state(map, self, endpoint);
                    checkout = Checkout::resolved(Ok(handle));
                } else {
                    let timeout = cmp::min(timeout, self.config.refresh_timeout);
                    let now = self.factory.now();
                    let (tx, rx) = oneshot::channel();
                    if let Some(pool) = map.pools.get_mut(endpoint) {
                        pool.requests.push(Request {
                            expires_at: now + timeout,
                            enqueued_at: now,
                            sender: tx,
                        });
                    }
                    self.instrumentation.request_enqueued(endpoint);
                    Self::update_state(map, self, endpoint);
                    map.deferred.push(Job::SpawnPass {
                        endpoint: endpoint.clone(),
                        pool_id,
                    });
                    checkout = Checkout::new(rx);
                }
            }
        }
        self.flush(guard);
        checkout
    }

    pub(crate) fn try_get(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        ssl_mode: SslMode,
    ) -> Option<PoolConnection<F>> {
        let mut guard = self.map.lock();
        let handle;
        {
            let map = &mut *guard;
            let eligible = match map.pools.get(endpoint) {
                Some(pool) => {
                    pool.check_ssl_mode(ssl_mode);
                    pool.state != PoolState::InShutdown && pool.requests.is_empty()
                }
                None => false,
            };

            handle = if eligible {
                let taken = Self::try_get_internal(map, self, endpoint);
                Self::update_state(map, self, endpoint);
                taken
            } else {
                None
            };
        }
        self.flush(guard);
        handle
    }

    /// Takes the most recently used healthy ready connection, checking
    /// it out. Unhealthy connections encountered on the way are dropped.
    fn try_get_internal(
        map: &mut PoolMap<F>,
        core: &Arc<Self>,
        endpoint: &Endpoint,
    ) -> Option<PoolConnection<F>> {
        let pool = match map.pools.get_mut(endpoint) {
            Some(pool) => pool,
            None => return None,
        };

        while let Some(mut entry) = pool.ready.pop_front() {
            entry.timer.cancel_timeout();
            core.instrumentation.ready_dec(endpoint);

            if !entry.conn.is_healthy() {
                info!("dropping unhealthy pooled connection to {}", endpoint);
                core.instrumentation.connection_dropped(endpoint);
                continue;
            }

            let mut conn = entry.conn;
            conn.reset_to_unknown();
            pool.checked_out.insert(entry.conn_id);
            core.instrumentation.checked_out_connection(endpoint);

            return Some(PoolConnection {
                core: Arc::clone(core),
                endpoint: endpoint.clone(),
                pool_id: pool.id,
                conn_id: entry.conn_id,
                connection: Some(conn),
            });
        }

        None
    }

    // ==== RETURN PATH ====

    /// Called from the handle's destructor via the executor.
    pub(crate) fn return_connection(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        pool_id: PoolId,
        conn_id: ConnId,
        conn: F::Connection,
    ) {
        let mut guard = self.map.lock();
        {
            let map = &mut *guard;
            let entered = match map.pools.get_mut(endpoint) {
                Some(pool) if pool.id == pool_id => {
                    pool.active_clients += 1;
                    true
                }
                _ => false,
            };

            if entered {
                Self::return_connection_locked(map, self, endpoint, conn_id, conn);
                if let Some(pool) = map.pools.get_mut(endpoint) {
                    pool.active_clients -= 1;
                }
                Self::update_state(map, self, endpoint);
            } else {
                trace!("a connection came back to {} after its pool was delisted", endpoint);
                self.instrumentation.checked_in_connection(endpoint);
                self.instrumentation.connection_dropped(endpoint);
            }
        }
        self.flush(guard);
    }

    fn return_connection_locked(
        map: &mut PoolMap<F>,
        core: &Arc<Self>,
        endpoint: &Endpoint,
        conn_id: ConnId,
        conn: F::Connection,
    ) {
        let pool = match map.pools.get_mut(endpoint) {
            Some(pool) => pool,
            None => return,
        };

        if !pool.checked_out.remove(&conn_id) {
            error!("a connection came back to {} that was not checked out", endpoint);
            core.instrumentation.connection_dropped(endpoint);
            return;
        }
        core.instrumentation.checked_in_connection(endpoint);

        if conn.generation() != pool.generation {
            trace!("dropping returned connection to {} from an older generation", endpoint);
            core.instrumentation.connection_dropped(endpoint);
            return;
        }

        if !conn.status().is_ok() {
            warn!(
                "ending connection to {} due to bad connection status; {} connections to that host remain open",
                endpoint,
                pool.open_connections()
            );
            core.instrumentation.connection_dropped(endpoint);
            return;
        }

        let now = core.factory.now();
        if conn.last_used() + core.config.refresh_requirement <= now {
            let club_min = map
                .clubs
                .get(&pool.club)
                .map(|club| club.min_conns)
                .unwrap_or(core.config.min_connections);

            if pool.open_connections() >= club_min {
                info!(
                    "ending idle connection to {} because the pool meets constraints; {} connections to that host remain open",
                    endpoint,
                    pool.open_connections()
                );
                core.instrumentation.connection_dropped(endpoint);
                return;
            }

            pool.processing.insert(conn_id);
            core.instrumentation.processing_inc(endpoint);
            let pool_id = pool.id;
            map.deferred.push(Job::Refresh {
                endpoint: endpoint.clone(),
                pool_id,
                conn_id,
                conn,
            });
        } else {
            Self::add_to_ready(map, core, endpoint, conn_id, conn);
        }
    }

    /// Puts a live connection at the MRU end of the ready queue, arms
    /// its self refresh timer and serves whoever is waiting.
    fn add_to_ready(
        map: &mut PoolMap<F>,
        core: &Arc<Self>,
        endpoint: &Endpoint,
        conn_id: ConnId,
        conn: F::Connection,
    ) {
        let pool = match map.pools.get_mut(endpoint) {
            Some(pool) => pool,
            None => {
                core.instrumentation.connection_dropped(endpoint);
                return;
            }
        };

        let pool_id = pool.id;
        let mut timer = core.factory.make_timer();
        let timer_core = Arc::clone(core);
        let timer_endpoint = endpoint.clone();
        timer.set_timeout(
            core.config.refresh_requirement,
            Box::new(move || {
                timer_core.on_refresh_due(timer_endpoint, pool_id, conn_id);
            }),
        );

        pool.ready.push_front(ReadyEntry {
            conn_id,
            conn,
            timer,
        });
        core.instrumentation.ready_inc(endpoint);

        Self::fulfill_requests(map, core, endpoint);
    }

    /// A ready connection sat unused for the refresh requirement: check
    /// it out to ourselves and push it through the return path, which
    /// decides between refreshing and letting it lapse.
    fn on_refresh_due(self: &Arc<Self>, endpoint: Endpoint, pool_id: PoolId, conn_id: ConnId) {
        self.enter(&endpoint, pool_id, |map, core| {
            let conn = {
                let pool = match map.pools.get_mut(&endpoint) {
                    Some(pool) => pool,
                    None => return,
                };
                if pool.state == PoolState::InShutdown {
                    return;
                }
                let position = match pool.ready.iter().position(|entry| entry.conn_id == conn_id)
                {
                    Some(position) => position,
                    // Already checked out again, nothing to refresh.
                    None => return,
                };
                let mut entry = match pool.ready.remove(position) {
                    Some(entry) => entry,
                    None => return,
                };
                entry.timer.cancel_timeout();
                core.instrumentation.ready_dec(&endpoint);

                pool.checked_out.insert(conn_id);
                core.instrumentation.checked_out_connection(&endpoint);

                let mut conn = entry.conn;
                conn.mark_success();
                conn
            };

            Self::return_connection_locked(map, core, &endpoint, conn_id, conn);
        });
    }

    // ==== DISPATCH ====

    /// Serves queued requests in deadline order from the ready queue,
    /// then lets the whole club spawn toward its effective minimum.
    fn fulfill_requests(map: &mut PoolMap<F>, core: &Arc<Self>, endpoint: &Endpoint) {
        loop {
            {
                let pool = match map.pools.get(endpoint) {
                    Some(pool) => pool,
                    None => return,
                };
                if pool.requests.is_empty() {
                    break;
                }
            }

            let handle = match Self::try_get_internal(map, core, endpoint) {
                Some(handle) => handle,
                None => break,
            };

            let request = {
                let pool = match map.pools.get_mut(endpoint) {
                    Some(pool) => pool,
                    None => return,
                };
                match pool.requests.pop() {
                    Some(request) => request,
                    None => break,
                }
            };

            core.instrumentation
                .request_fulfilled(endpoint, request.enqueued_at.elapsed());
            if request.sender.send(Ok(handle)).is_err() {
                trace!("a checkout for {} was abandoned before it could be fulfilled", endpoint);
            }

            Self::update_state(map, core, endpoint);
        }

        let club_id = match map.pools.get(endpoint) {
            Some(pool) => pool.club,
            None => return,
        };
        Self::update_club(map, club_id);

        let members: Vec<Endpoint> = map
            .clubs
            .get(&club_id)
            .map(|club| club.members.iter().cloned().collect())
            .unwrap_or_default();
        for member in &members {
            Self::spawn_connections(map, core, member);
        }
    }

    /// Spawns connections until the pool covers its requests and the
    /// club minimum, bounded by the connection and connecting ceilings.
    fn spawn_connections(map: &mut PoolMap<F>, core: &Arc<Self>, endpoint: &Endpoint) {
        let club_min = {
            let pool = match map.pools.get(endpoint) {
                Some(pool) => pool,
                None => return,
            };
            map.clubs
                .get(&pool.club)
                .map(|club| club.min_conns)
                .unwrap_or(core.config.min_connections)
        };

        let pool = match map.pools.get_mut(endpoint) {
            Some(pool) => pool,
            None => return,
        };

        // min_connections <= outstanding demand <= max_connections
        let target = cmp::min(
            cmp::max(club_min, pool.requests.len() + pool.checked_out.len()),
            core.config.max_connections,
        );

        if pool.state != PoolState::InShutdown
            && pool.ready.is_empty()
            && pool.processing.is_empty()
            && pool.open_connections() < target
        {
            info!("connecting to {}", endpoint);
        }

        let mut scheduled = Vec::new();
        while pool.state != PoolState::InShutdown
            && pool.open_connections() < target
            && pool.processing.len() < core.config.max_connecting
        {
            let conn_id = core.next_id();
            pool.processing.insert(conn_id);
            pool.created += 1;
            core.instrumentation.processing_inc(endpoint);
            core.instrumentation.connection_created(endpoint);
            scheduled.push((conn_id, pool.ssl_mode, pool.generation));
        }

        let pool_id = pool.id;
        for (conn_id, ssl_mode, generation) in scheduled {
            map.deferred.push(Job::Setup {
                endpoint: endpoint.clone(),
                pool_id,
                conn_id,
                ssl_mode,
                generation,
            });
        }
    }

    fn spawn_pass(self: &Arc<Self>, endpoint: Endpoint, pool_id: PoolId) {
        self.enter(&endpoint, pool_id, |map, core| {
            Self::spawn_connections(map, core, &endpoint);
        });
    }

    /// The shared completion of both setup and refresh.
    pub(crate) fn finish_refresh(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        pool_id: PoolId,
        conn_id: ConnId,
        conn: F::Connection,
        result: Result<(), Error>,
    ) {
        let mut guard = self.map.lock();
        {
            let map = &mut *guard;
            let entered = match map.pools.get_mut(endpoint) {
                Some(pool) if pool.id == pool_id => {
                    pool.active_clients += 1;
                    true
                }
                _ => false,
            };

            if entered {
                Self::finish_refresh_locked(map, self, endpoint, conn_id, conn, result);
                if let Some(pool) = map.pools.get_mut(endpoint) {
                    pool.active_clients -= 1;
                }
                Self::update_state(map, self, endpoint);
            } else {
                trace!("setup or refresh finished for {} after its pool was delisted", endpoint);
                self.instrumentation.connection_dropped(endpoint);
            }
        }
        self.flush(guard);
    }

    fn finish_refresh_locked(
        map: &mut PoolMap<F>,
        core: &Arc<Self>,
        endpoint: &Endpoint,
        conn_id: ConnId,
        conn: F::Connection,
        result: Result<(), Error>,
    ) {
        let pool = match map.pools.get_mut(endpoint) {
            Some(pool) => pool,
            None => return,
        };

        let from_processing = pool.processing.remove(&conn_id);
        let from_dropped = !from_processing && pool.dropped_processing.remove(&conn_id);
        if from_processing {
            core.instrumentation.processing_dec(endpoint);
        }
        if !from_processing && !from_dropped {
            trace!("late setup or refresh completion for {}", endpoint);
            core.instrumentation.connection_dropped(endpoint);
            return;
        }

        if pool.state == PoolState::InShutdown {
            core.instrumentation.connection_dropped(endpoint);
            return;
        }

        match result {
            Ok(()) => {
                if conn.generation() != pool.generation {
                    trace!(
                        "discarding refreshed connection to {} from an older generation",
                        endpoint
                    );
                    core.instrumentation.connection_dropped(endpoint);
                    Self::spawn_connections(map, core, endpoint);
                    return;
                }
                Self::add_to_ready(map, core, endpoint, conn_id, conn);
            }
            Err(ref err) if err.kind() == ErrorKind::ExceededTimeLimit => {
                // Callers have their own deadlines which are unrelated to
                // ours, so a slow handshake costs one connection, not the
                // whole endpoint.
                info!(
                    "pending connection to {} did not complete within the connection timeout, \
                     retrying with a new connection; {} connections to that host remain open",
                    endpoint,
                    pool.open_connections()
                );
                core.instrumentation.connection_dropped(endpoint);
                Self::spawn_connections(map, core, endpoint);
            }
            Err(err) => {
                core.instrumentation.connection_dropped(endpoint);
                Self::process_failure(map, core, endpoint, err);
            }
        }
    }

    // ==== FAILURE & SHUTDOWN ====

    /// Invalidates every connection of the endpoint and fails all
    /// waiters with the same status. The generation bump makes any still
    /// in flight callback a no-op.
    fn process_failure(map: &mut PoolMap<F>, core: &Arc<Self>, endpoint: &Endpoint, status: Error) {
        let requests = {
            let pool = match map.pools.get_mut(endpoint) {
                Some(pool) => pool,
                None => return,
            };

            pool.generation += 1;

            if !pool.ready.is_empty() || !pool.processing.is_empty() {
                warn!("dropping all pooled connections to {} due to {}", endpoint, status);
            }

            while let Some(entry) = pool.ready.pop_front() {
                drop(entry);
                core.instrumentation.ready_dec(endpoint);
                core.instrumentation.connection_dropped(endpoint);
            }

            if pool.state == PoolState::InShutdown {
                // No one will pick these up again, let the in flight
                // callbacks drain into the void.
                let dropped = pool.processing.len();
                pool.processing.clear();
                for _ in 0..dropped {
                    core.instrumentation.processing_dec(endpoint);
                }
            } else {
                let migrated: Vec<ConnId> = pool.processing.drain().collect();
                for conn_id in migrated {
                    pool.dropped_processing.insert(conn_id);
                    core.instrumentation.processing_dec(endpoint);
                }
            }

            core.instrumentation.failure_cascade(endpoint);
            std::mem::take(&mut pool.requests)
        };

        Self::update_state(map, core, endpoint);

        // All container mutations above are visible before any waiter
        // learns of the failure.
        for request in requests {
            let _ = request.sender.send(Err(status.clone()));
            core.instrumentation.request_failed(endpoint);
        }
    }

    /// Marks the pool terminal and cascades. The pool delists once its
    /// processing connections and active clients have drained.
    fn trigger_shutdown(map: &mut PoolMap<F>, core: &Arc<Self>, endpoint: &Endpoint, status: Error) {
        {
            let pool = match map.pools.get_mut(endpoint) {
                Some(pool) => pool,
                None => return,
            };
            if pool.state == PoolState::InShutdown {
                return;
            }
            debug!("shutting down connection pool for {}", endpoint);
            pool.state = PoolState::InShutdown;
            pool.dropped_processing.clear();
            pool.request_timer.cancel_timeout();
            pool.request_timer_expiration = None;
        }
        Self::process_failure(map, core, endpoint, status);
    }

    /// The host timeout fired while the pool was idle. Teardown is club
    /// wide: only when every member has timed out does the club shut
    /// down, so a quiet secondary is not torn down while its primary is
    /// busy.
    fn on_host_timeout(self: &Arc<Self>, endpoint: Endpoint, pool_id: PoolId) {
        self.enter(&endpoint, pool_id, |map, core| {
            let club = {
                let pool = match map.pools.get_mut(&endpoint) {
                    Some(pool) => pool,
                    None => return,
                };
                if pool.state != PoolState::Idle {
                    return;
                }
                debug!("connection pool for {} has hit the host timeout", endpoint);
                pool.state = PoolState::HostTimedOut;
                pool.club
            };
            Self::check_shutdown(map, core, club);
        });
    }

    fn check_shutdown(map: &mut PoolMap<F>, core: &Arc<Self>, club_id: ClubId) {
        let members: Vec<Endpoint> = {
            let club = match map.clubs.get(&club_id) {
                Some(club) => club,
                None => return,
            };
            for member in &club.members {
                match map.pools.get(member) {
                    Some(pool) if pool.state == PoolState::HostTimedOut => {}
                    _ => return,
                }
            }
            club.members.iter().cloned().collect()
        };

        for member in &members {
            Self::trigger_shutdown(map, core, member, Error::new(ErrorKind::ExceededTimeLimit));
        }
    }

    /// The request deadline timer fired: fail everything whose deadline
    /// has passed.
    fn on_request_deadline(self: &Arc<Self>, endpoint: Endpoint, pool_id: PoolId) {
        self.enter(&endpoint, pool_id, |map, core| {
            let now = core.factory.now();
            let mut expired = Vec::new();
            {
                let pool = match map.pools.get_mut(&endpoint) {
                    Some(pool) => pool,
                    None => return,
                };
                loop {
                    match pool.requests.peek() {
                        Some(request) if request.expires_at <= now => {
                            if let Some(request) = pool.requests.pop() {
                                expired.push(request);
                            }
                        }
                        _ => break,
                    }
                }
            }

            for request in expired {
                let _ = request
                    .sender
                    .send(Err(Error::new(ErrorKind::ExceededTimeLimit)));
                core.instrumentation.request_timed_out(&endpoint);
            }
        });
    }

    /// Drives the state machine and the request/host timer. Also the
    /// place where a shut down pool is finally delisted.
    fn update_state(map: &mut PoolMap<F>, core: &Arc<Self>, endpoint: &Endpoint) {
        let pool = match map.pools.get_mut(endpoint) {
            Some(pool) => pool,
            None => return,
        };

        if pool.state == PoolState::InShutdown {
            if pool.processing.is_empty() && pool.active_clients == 0 {
                Self::delist(map, core, endpoint);
            }
            return;
        }

        let earliest = pool.requests.peek().map(|request| request.expires_at);
        if let Some(earliest) = earliest {
            // Some outstanding requests, we are live.
            if pool.state == PoolState::Running
                && pool.request_timer_expiration == Some(earliest)
            {
                return;
            }

            pool.state = PoolState::Running;
            pool.request_timer_expiration = Some(earliest);

            let timeout = earliest.saturating_duration_since(core.factory.now());
            let timer_core = Arc::clone(core);
            let timer_endpoint = endpoint.clone();
            let pool_id = pool.id;
            pool.request_timer.set_timeout(
                timeout,
                Box::new(move || {
                    timer_core.on_request_deadline(timer_endpoint, pool_id);
                }),
            );
        } else if !pool.checked_out.is_empty() {
            // No requests, but someone is using a connection: hang
            // around until the next request or a return.
            pool.state = PoolState::Running;
            pool.request_timer.cancel_timeout();
            pool.request_timer_expiration = None;
        } else {
            if pool.state == PoolState::Idle || pool.state == PoolState::HostTimedOut {
                return;
            }

            pool.state = PoolState::Idle;
            pool.request_timer_expiration = None;

            let timer_core = Arc::clone(core);
            let timer_endpoint = endpoint.clone();
            let pool_id = pool.id;
            pool.request_timer.set_timeout(
                core.config.host_timeout,
                Box::new(move || {
                    timer_core.on_host_timeout(timer_endpoint, pool_id);
                }),
            );
        }
    }

    fn delist(map: &mut PoolMap<F>, core: &Arc<Self>, endpoint: &Endpoint) {
        let pool = match map.pools.remove(endpoint) {
            Some(pool) => pool,
            None => return,
        };
        debug!("delisting connection pool for {}", endpoint);

        let mut drop_club = false;
        if let Some(club) = map.clubs.get_mut(&pool.club) {
            club.members.remove(endpoint);
            drop_club = club.name.is_none() && club.members.is_empty();
        }
        if drop_club {
            map.clubs.remove(&pool.club);
        }

        core.instrumentation.pool_removed(endpoint);
    }

    // ==== POOLS & CLUBS ====

    fn ensure_pool(map: &mut PoolMap<F>, core: &Arc<Self>, endpoint: &Endpoint) -> PoolId {
        if let Some(pool) = map.pools.get(endpoint) {
            return pool.id;
        }

        let pool_id = core.next_id();
        let club_id = Self::make_anonymous_club(map, core);

        debug!("creating a connection pool for {}", endpoint);
        let pool = EndpointPool {
            id: pool_id,
            club: club_id,
            ssl_mode: SslMode::Global,
            ready: VecDeque::new(),
            processing: HashSet::new(),
            dropped_processing: HashSet::new(),
            checked_out: HashSet::new(),
            requests: BinaryHeap::new(),
            request_timer: core.factory.make_timer(),
            request_timer_expiration: None,
            active_clients: 0,
            generation: 0,
            created: 0,
            tags: TAG_PENDING,
            state: PoolState::Running,
        };

        if let Some(club) = map.clubs.get_mut(&club_id) {
            club.members.insert(endpoint.clone());
        }
        map.pools.insert(endpoint.clone(), pool);
        core.instrumentation.pool_added(endpoint);

        pool_id
    }

    fn make_anonymous_club(map: &mut PoolMap<F>, core: &Arc<Self>) -> ClubId {
        let club_id = core.next_id();
        map.clubs.insert(
            club_id,
            PoolClub {
                name: None,
                default_min_conns: core.config.min_connections,
                min_conns: core.config.min_connections,
                primary: None,
                members: HashSet::new(),
            },
        );
        club_id
    }

    fn ensure_set_club(map: &mut PoolMap<F>, core: &Arc<Self>, set_name: &str) -> ClubId {
        if let Some(club_id) = map.set_clubs.get(set_name) {
            return *club_id;
        }

        let club_id = core.next_id();
        map.clubs.insert(
            club_id,
            PoolClub {
                name: Some(set_name.to_string()),
                default_min_conns: core.config.min_connections,
                min_conns: core.config.min_connections,
                primary: None,
                members: HashSet::new(),
            },
        );
        map.set_clubs.insert(set_name.to_string(), club_id);
        club_id
    }

    fn attach_to_club(map: &mut PoolMap<F>, endpoint: &Endpoint, club_id: ClubId) {
        let old_club = match map.pools.get_mut(endpoint) {
            Some(pool) => {
                let old_club = pool.club;
                pool.club = club_id;
                old_club
            }
            None => return,
        };

        if old_club != club_id {
            let mut drop_old = false;
            if let Some(club) = map.clubs.get_mut(&old_club) {
                club.members.remove(endpoint);
                drop_old = club.name.is_none() && club.members.is_empty();
            }
            if drop_old {
                map.clubs.remove(&old_club);
            }
        }

        if let Some(club) = map.clubs.get_mut(&club_id) {
            club.members.insert(endpoint.clone());
        }
    }

    fn attach_to_anonymous(map: &mut PoolMap<F>, core: &Arc<Self>, endpoint: &Endpoint) {
        if !map.pools.contains_key(endpoint) {
            return;
        }
        let club_id = Self::make_anonymous_club(map, core);
        Self::attach_to_club(map, endpoint, club_id);
    }

    /// Recomputes the club's effective minimum: the configured floor or
    /// the largest checked out count of any member.
    fn update_club(map: &mut PoolMap<F>, club_id: ClubId) {
        let min_conns = {
            let club = match map.clubs.get(&club_id) {
                Some(club) => club,
                None => return,
            };
            let mut min_conns = club.default_min_conns;
            for member in &club.members {
                if let Some(pool) = map.pools.get(member) {
                    min_conns = cmp::max(min_conns, pool.checked_out.len());
                }
            }
            min_conns
        };

        if let Some(club) = map.clubs.get_mut(&club_id) {
            club.min_conns = min_conns;
        }
    }

    // ==== TOPOLOGY ====

    pub(crate) fn handle_config(self: &Arc<Self>, config: &ConnectionString) {
        let mut guard = self.map.lock();
        {
            let map = &mut *guard;
            debug!("new config for replica set {}: {}", config.set_name(), config);

            let club_id = Self::ensure_set_club(map, self, config.set_name());

            let mut detached = match map.clubs.get_mut(&club_id) {
                Some(club) => std::mem::take(&mut club.members),
                None => HashSet::new(),
            };

            for server in config.servers() {
                Self::ensure_pool(map, self, server);
                Self::attach_to_club(map, server, club_id);
                detached.remove(server);
                Self::update_state(map, self, server);
            }

            for server in &detached {
                Self::attach_to_anonymous(map, self, server);
            }

            if let Some(club) = map.clubs.get_mut(&club_id) {
                club.min_conns = club.default_min_conns;
            }
            Self::update_club(map, club_id);

            let members: Vec<Endpoint> = map
                .clubs
                .get(&club_id)
                .map(|club| club.members.iter().cloned().collect())
                .unwrap_or_default();
            for member in &members {
                if let Some(pool) = map.pools.get(member) {
                    let pool_id = pool.id;
                    map.deferred.push(Job::SpawnPass {
                        endpoint: member.clone(),
                        pool_id,
                    });
                }
            }
        }
        self.flush(guard);
    }

    pub(crate) fn handle_primary(self: &Arc<Self>, set_name: &str, primary: &Endpoint) {
        let mut guard = self.map.lock();
        {
            let map = &mut *guard;
            let club_id = Self::ensure_set_club(map, self, set_name);

            let changed = match map.clubs.get_mut(&club_id) {
                Some(club) => {
                    if club.primary.as_ref() == Some(primary) {
                        false
                    } else {
                        club.primary = Some(primary.clone());
                        true
                    }
                }
                None => false,
            };

            if changed {
                debug!("replica set {} has a new primary: {}", set_name, primary);
                Self::update_club(map, club_id);
                if let Some(pool) = map.pools.get(primary) {
                    let pool_id = pool.id;
                    map.deferred.push(Job::SpawnPass {
                        endpoint: primary.clone(),
                        pool_id,
                    });
                }
            }
        }
        self.flush(guard);
    }

    // ==== EXTERNAL OPERATIONS ====

    pub(crate) fn drop_connections(self: &Arc<Self>, endpoint: &Endpoint) {
        let mut guard = self.map.lock();
        {
            let map = &mut *guard;
            if map.pools.contains_key(endpoint) {
                Self::process_failure(
                    map,
                    self,
                    endpoint,
                    Error::new(ErrorKind::PooledConnectionsDropped),
                );
            }
        }
        self.flush(guard);
    }

    /// Drops every pool whose tags do NOT intersect the given mask.
    pub(crate) fn drop_connections_by_tag(self: &Arc<Self>, tags: TagMask) {
        let mut guard = self.map.lock();
        {
            let map = &mut *guard;
            let endpoints: Vec<Endpoint> = map
                .pools
                .iter()
                .filter(|(_, pool)| !pool.matches_tags(tags))
                .map(|(endpoint, _)| endpoint.clone())
                .collect();

            for endpoint in &endpoints {
                Self::process_failure(
                    map,
                    self,
                    endpoint,
                    Error::new(ErrorKind::PooledConnectionsDropped),
                );
            }
        }
        self.flush(guard);
    }

    pub(crate) fn mutate_tags<M>(self: &Arc<Self>, endpoint: &Endpoint, mutate: M)
    where
        M: FnOnce(TagMask) -> TagMask,
    {
        let mut guard = self.map.lock();
        if let Some(pool) = guard.pools.get_mut(endpoint) {
            pool.tags = mutate(pool.tags);
        }
    }

    pub(crate) fn shutdown(self: &Arc<Self>) {
        self.factory.shutdown();

        let mut guard = self.map.lock();
        {
            let map = &mut *guard;
            let endpoints: Vec<Endpoint> = map.pools.keys().cloned().collect();
            for endpoint in &endpoints {
                Self::trigger_shutdown(
                    map,
                    self,
                    endpoint,
                    Error::new(ErrorKind::ShutdownInProgress),
                );
            }
        }
        self.flush(guard);
    }

    pub(crate) fn append_stats(&self, stats: &mut ConnectionPoolStats) {
        let guard = self.map.lock();
        for (endpoint, pool) in &guard.pools {
            stats.update_stats_for_host(
                endpoint.clone(),
                EndpointStats {
                    in_use: pool.checked_out.len(),
                    available: pool.ready.len(),
                    created: pool.created,
                    refreshing: pool.processing.len(),
                },
            );
        }
    }

    pub(crate) fn num_connections(&self, endpoint: &Endpoint) -> usize {
        let guard = self.map.lock();
        guard
            .pools
            .get(endpoint)
            .map(|pool| pool.open_connections())
            .unwrap_or(0)
    }
}
