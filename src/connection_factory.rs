use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::endpoint::{Endpoint, SslMode};
use crate::error::Error;

/// What a connection knows about itself between pool transitions.
///
/// Implementors of `Poolable` embed one of these and hand out access via
/// `info`/`info_mut`; the provided trait methods do the rest.
#[derive(Debug)]
pub struct ConnectionInfo {
    endpoint: Endpoint,
    generation: u64,
    status: ConnectionStatus,
    last_used: Instant,
}

impl ConnectionInfo {
    pub fn new(endpoint: Endpoint, generation: u64) -> Self {
        Self {
            endpoint,
            generation,
            status: ConnectionStatus::Unknown,
            last_used: Instant::now(),
        }
    }
}

/// The health verdict a user left on a connection before returning it.
#[derive(Debug, Clone)]
pub enum ConnectionStatus {
    /// The last user of the connection reported success.
    Ok,
    /// Nobody has told us anything since the connection was handed out.
    /// A connection returned in this state is not trusted and dropped.
    Unknown,
    /// The last user of the connection reported a failure.
    Failed(Error),
}

impl ConnectionStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ConnectionStatus::Ok)
    }
}

/// A wire connection as the pool sees it.
///
/// The pool never looks at bytes. It creates connections through a
/// `ConnectionFactory`, runs their one time `setup` handshake, refreshes
/// them once they have sat idle for too long and retires them when they
/// report trouble.
///
/// `setup` and `refresh` consume the connection and yield it back together
/// with the outcome; the returned future must resolve within roughly the
/// given timeout and report `ErrorKind::ExceededTimeLimit` if it ran out
/// of time. A timed out attempt only costs that one connection, any other
/// error invalidates the whole endpoint.
pub trait Poolable: Send + Sized + 'static {
    fn info(&self) -> &ConnectionInfo;

    fn info_mut(&mut self) -> &mut ConnectionInfo;

    /// Runs the one time connect/handshake sequence.
    fn setup(self, timeout: Duration) -> BoxFuture<'static, (Self, Result<(), Error>)>;

    /// Revalidates an idle connection, e.g. by a wire level ping.
    fn refresh(self, timeout: Duration) -> BoxFuture<'static, (Self, Result<(), Error>)>;

    /// A cheap liveness check consulted right before a checkout.
    fn is_healthy(&mut self) -> bool;

    fn endpoint(&self) -> &Endpoint {
        &self.info().endpoint
    }

    fn generation(&self) -> u64 {
        self.info().generation
    }

    fn last_used(&self) -> Instant {
        self.info().last_used
    }

    fn status(&self) -> &ConnectionStatus {
        &self.info().status
    }

    /// Stamps the connection as used just now. Must not be called after
    /// `mark_failure`.
    fn mark_used(&mut self) {
        debug_assert!(
            !matches!(self.info().status, ConnectionStatus::Failed(_)),
            "a failed connection must not be used again"
        );
        self.info_mut().last_used = Instant::now();
    }

    fn mark_success(&mut self) {
        self.info_mut().status = ConnectionStatus::Ok;
    }

    fn mark_failure(&mut self, error: Error) {
        self.info_mut().status = ConnectionStatus::Failed(error);
    }

    fn reset_to_unknown(&mut self) {
        self.info_mut().status = ConnectionStatus::Unknown;
    }
}

/// A one shot timer.
///
/// Re-arming replaces the previous schedule. A cancelled timer must not
/// fire its callback; dropping a timer cancels it.
pub trait Timer: Send + 'static {
    fn set_timeout(&mut self, timeout: Duration, callback: Box<dyn FnOnce() + Send + 'static>);

    fn cancel_timeout(&mut self);
}

/// A `Timer` backed by a task on a tokio runtime.
///
/// Cancellation aborts the sleeping task, so a cancelled timer can never
/// run its callback.
pub struct TokioTimer {
    handle: Handle,
    task: Option<JoinHandle<()>>,
}

impl TokioTimer {
    pub fn new(handle: Handle) -> Self {
        Self { handle, task: None }
    }

    /// Creates a timer on the current runtime. Panics outside of one.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Timer for TokioTimer {
    fn set_timeout(&mut self, timeout: Duration, callback: Box<dyn FnOnce() + Send + 'static>) {
        self.cancel_timeout();
        self.task = Some(self.handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            callback();
        }));
    }

    fn cancel_timeout(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        self.cancel_timeout();
    }
}

/// Produces the raw connections and timers the pool works with, and is
/// the pool's clock.
///
/// The factory is shared by every endpoint pool and must be safe to call
/// concurrently. A factory that cannot construct its connection object is
/// broken beyond recovery and should panic.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Poolable;
    type Timer: Timer;

    fn make_connection(
        &self,
        endpoint: &Endpoint,
        ssl_mode: SslMode,
        generation: u64,
    ) -> Self::Connection;

    fn make_timer(&self) -> Self::Timer;

    fn now(&self) -> Instant {
        Instant::now()
    }

    /// Called once when the owning pool shuts down.
    fn shutdown(&self) {}
}
