//! Pluggable instrumentation
use std::sync::Arc;
use std::time::Duration;

use crate::endpoint::Endpoint;

pub use state_counters::*;

mod state_counters;

/// A trait with methods that get called by the pool on certain events.
///
/// All methods are invoked inside the pool's critical section and must
/// therefore neither block nor call back into the pool.
pub trait Instrumentation {
    /// An endpoint pool came into existence.
    fn pool_added(&self, endpoint: &Endpoint);

    /// An endpoint pool was delisted after shutting down.
    fn pool_removed(&self, endpoint: &Endpoint);

    /// A new connection object was created and entered processing.
    fn connection_created(&self, endpoint: &Endpoint);

    /// A connection reached the end of its life, for whatever reason.
    fn connection_dropped(&self, endpoint: &Endpoint);

    /// A connection was handed out to a caller.
    fn checked_out_connection(&self, endpoint: &Endpoint);

    /// A previously checked out connection came back.
    fn checked_in_connection(&self, endpoint: &Endpoint);

    /// The number of ready connections increased by 1.
    fn ready_inc(&self, endpoint: &Endpoint);

    /// The number of ready connections decreased by 1.
    fn ready_dec(&self, endpoint: &Endpoint);

    /// The number of connections in setup or refresh increased by 1.
    fn processing_inc(&self, endpoint: &Endpoint);

    /// The number of connections in setup or refresh decreased by 1.
    fn processing_dec(&self, endpoint: &Endpoint);

    /// A checkout request was put into the waiting queue.
    fn request_enqueued(&self, endpoint: &Endpoint);

    /// A queued checkout request received a connection.
    fn request_fulfilled(&self, endpoint: &Endpoint, waited_for: Duration);

    /// A queued checkout request ran past its deadline.
    fn request_timed_out(&self, endpoint: &Endpoint);

    /// A queued checkout request was failed by a cascade.
    fn request_failed(&self, endpoint: &Endpoint);

    /// A failure cascade invalidated the endpoint's connections.
    fn failure_cascade(&self, endpoint: &Endpoint);

    /// A task arrived at the pool lock.
    fn reached_lock(&self);

    /// A task passed the pool lock after waiting for the given time.
    fn passed_lock(&self, wait_time: Duration);

    /// The pool lock was released after being held exclusively for the
    /// given time.
    fn lock_released(&self, exclusive_lock_time: Duration);
}

#[derive(Clone)]
pub(crate) enum InstrumentationFlavour {
    NoInstrumentation,
    Custom(Arc<dyn Instrumentation + Sync + Send + 'static>),
}

impl Instrumentation for InstrumentationFlavour {
    fn pool_added(&self, endpoint: &Endpoint) {
        match self {
            InstrumentationFlavour::NoInstrumentation => {}
            InstrumentationFlavour::Custom(i) => i.pool_added(endpoint),
        }
    }

    fn pool_removed(&self, endpoint: &Endpoint) {
        match self {
            InstrumentationFlavour::NoInstrumentation => {}
            InstrumentationFlavour::Custom(i) => i.pool_removed(endpoint),
        }
    }

    fn connection_created(&self, endpoint: &Endpoint) {
        match self {
            InstrumentationFlavour::NoInstrumentation => {}
            InstrumentationFlavour::Custom(i) => i.connection_created(endpoint),
        }
    }

    fn connection_dropped(&self, endpoint: &Endpoint) {
        match self {
            InstrumentationFlavour::NoInstrumentation => {}
            InstrumentationFlavour::Custom(i) => i.connection_dropped(endpoint),
        }
    }

    fn checked_out_connection(&self, endpoint: &Endpoint) {
        match self {
            InstrumentationFlavour::NoInstrumentation => {}
            InstrumentationFlavour::Custom(i) => i.checked_out_connection(endpoint),
        }
    }

    fn checked_in_connection(&self, endpoint: &Endpoint) {
        match self {
            InstrumentationFlavour::NoInstrumentation => {}
            InstrumentationFlavour::Custom(i) => i.checked_in_connection(endpoint),
        }
    }

    fn ready_inc(&self, endpoint: &Endpoint) {
        match self {
            InstrumentationFlavour::NoInstrumentation => {}
            InstrumentationFlavour::Custom(i) => i.ready_inc(endpoint),
        }
    }

    fn ready_dec(&self, endpoint: &Endpoint) {
        match self {
            InstrumentationFlavour::NoInstrumentation => {}
            InstrumentationFlavour::Custom(i) => i.ready_dec(endpoint),
        }
    }

    fn processing_inc(&self, endpoint: &Endpoint) {
        match self {
            InstrumentationFlavour::NoInstrumentation => {}
            InstrumentationFlavour::Custom(i) => i.processing_inc(endpoint),
        }
    }

    fn processing_dec(&self, endpoint: &Endpoint) {
        match self {
            InstrumentationFlavour::NoInstrumentation => {}
            InstrumentationFlavour::Custom(i) => i.processing_dec(endpoint),
        }
    }

    fn request_enqueued(&self, endpoint: &Endpoint) {
        match self {
            InstrumentationFlavour::NoInstrumentation => {}
            InstrumentationFlavour::Custom(i) => i.request_enqueued(endpoint),
        }
    }

    fn request_fulfilled(&self, endpoint: &Endpoint, waited_for: Duration) {
        match self {
            InstrumentationFlavour::NoInstrumentation => {}
            InstrumentationFlavour::Custom(i) => i.request_fulfilled(endpoint, waited_for),
        }
    }

    fn request_timed_out(&self, endpoint: &Endpoint) {
        match self {
            InstrumentationFlavour::NoInstrumentation => {}
            InstrumentationFlavour::Custom(i) => i.request_timed_out(endpoint),
        }
    }

    fn request_failed(&self, endpoint: &Endpoint) {
        match self {
            InstrumentationFlavour::NoInstrumentation => {}
            InstrumentationFlavour::Custom(i) => i.request_failed(endpoint),
        }
    }

    fn failure_cascade(&self, endpoint: &Endpoint) {
        match self {
            InstrumentationFlavour::NoInstrumentation => {}
            InstrumentationFlavour::Custom(i) => i.failure_cascade(endpoint),
        }
    }

    fn reached_lock(&self) {
        match self {
            InstrumentationFlavour::NoInstrumentation => {}
            InstrumentationFlavour::Custom(i) => i.reached_lock(),
        }
    }

    fn passed_lock(&self, wait_time: Duration) {
        match self {
            InstrumentationFlavour::NoInstrumentation => {}
            InstrumentationFlavour::Custom(i) => i.passed_lock(wait_time),
        }
    }

    fn lock_released(&self, exclusive_lock_time: Duration) {
        match self {
            InstrumentationFlavour::NoInstrumentation => {}
            InstrumentationFlavour::Custom(i) => i.lock_released(exclusive_lock_time),
        }
    }
}
