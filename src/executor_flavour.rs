use std::fmt;

use futures::future::Future;
use tokio::runtime::Handle;

/// The executor the pool runs its background work on.
///
/// Connection setup and refresh, returns of checked out connections and
/// spawn passes are all executed as tasks so that they never run inside
/// the pool's critical section.
#[derive(Clone)]
pub enum ExecutorFlavour {
    /// Assume the pool lives on the default tokio runtime and spawn onto
    /// whatever runtime is current.
    Runtime,
    /// Spawn onto an explicitly given runtime handle. Use this if pool
    /// handles may be dropped from threads outside the runtime.
    TokioHandle(Handle),
}

impl ExecutorFlavour {
    pub fn execute<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self {
            ExecutorFlavour::Runtime => {
                tokio::spawn(task);
            }
            ExecutorFlavour::TokioHandle(handle) => {
                handle.spawn(task);
            }
        }
    }
}

impl From<()> for ExecutorFlavour {
    fn from(_: ()) -> Self {
        ExecutorFlavour::Runtime
    }
}

impl From<Handle> for ExecutorFlavour {
    fn from(handle: Handle) -> Self {
        ExecutorFlavour::TokioHandle(handle)
    }
}

impl fmt::Debug for ExecutorFlavour {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecutorFlavour::Runtime => write!(f, "ExecutorFlavour::Runtime"),
            ExecutorFlavour::TokioHandle(_) => write!(f, "ExecutorFlavour::TokioHandle"),
        }
    }
}
