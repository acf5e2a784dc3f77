use std::fmt;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::Future;
use tokio::sync::oneshot;

use crate::connection_factory::ConnectionFactory;
use crate::endpoint::Endpoint;
use crate::error::{Error, ErrorKind};

use super::endpoint_pool::{ConnId, PoolCore, PoolId};

/// A future containing a checked out connection or an error.
///
/// Dropping the future abandons the checkout; if the pool fulfills it
/// afterwards, the connection simply returns to the pool. A checkout
/// whose pool goes away before fulfillment resolves to
/// `ErrorKind::ShutdownInProgress`.
pub struct Checkout<F: ConnectionFactory> {
    receiver: oneshot::Receiver<Result<PoolConnection<F>, Error>>,
}

impl<F: ConnectionFactory> Checkout<F> {
    pub(crate) fn new(receiver: oneshot::Receiver<Result<PoolConnection<F>, Error>>) -> Self {
        Self { receiver }
    }

    pub(crate) fn resolved(result: Result<PoolConnection<F>, Error>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { receiver: rx }
    }

    pub(crate) fn error<E: Into<Error>>(error: E) -> Self {
        Self::resolved(Err(error.into()))
    }
}

impl<F: ConnectionFactory> Future for Checkout<F> {
    type Output = Result<PoolConnection<F>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let receiver = &mut self.get_mut().receiver;
        match Pin::new(receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => {
                // The pool dropped the request without completing it.
                Poll::Ready(Err(Error::new(ErrorKind::ShutdownInProgress)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for Checkout<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Checkout")
    }
}

/// A connection that has been taken from the pool.
///
/// Dereferences to the wire connection. The holder should leave a health
/// verdict (`mark_success`/`mark_failure`) before letting go; a
/// connection returned without one is not trusted and dropped.
///
/// The connection returns to its pool when the handle is dropped. The
/// return runs on the pool's executor, never on the dropping thread.
pub struct PoolConnection<F: ConnectionFactory> {
    pub(crate) core: Arc<PoolCore<F>>,
    pub(crate) endpoint: Endpoint,
    pub(crate) pool_id: PoolId,
    pub(crate) conn_id: ConnId,
    pub(crate) connection: Option<F::Connection>,
}

impl<F: ConnectionFactory> Deref for PoolConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref().unwrap()
    }
}

impl<F: ConnectionFactory> DerefMut for PoolConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection.as_mut().unwrap()
    }
}

impl<F: ConnectionFactory> Drop for PoolConnection<F> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            let core = Arc::clone(&self.core);
            let endpoint = self.endpoint.clone();
            let pool_id = self.pool_id;
            let conn_id = self.conn_id;
            self.core.executor().execute(async move {
                core.return_connection(&endpoint, pool_id, conn_id, connection);
            });
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for PoolConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PoolConnection({})", self.endpoint)
    }
}
