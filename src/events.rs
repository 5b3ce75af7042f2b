//! Observability events emitted by the locator components.
//!
//! Each component carries an [`EventListeners`] collection in its
//! configuration. Listeners are synchronous, shared, and isolated from each
//! other: a panicking listener does not prevent the remaining listeners from
//! running.

use crate::breaker::BreakerState;
use crate::endpoint::Endpoint;
use std::sync::Arc;
use std::time::Duration;

/// Events emitted by the registry cache.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    /// A refresh pulled an answer from the registry (possibly an empty one).
    RefreshSucceeded {
        /// Service whose entry was refreshed.
        service: String,
        /// Number of instances the registry reported.
        instances: usize,
    },
    /// A refresh could not reach the registry; the previous entry is retained.
    RefreshFailed {
        /// Service whose refresh failed.
        service: String,
        /// Transport-level reason.
        reason: String,
    },
    /// A lookup was answered from an entry older than its TTL.
    ServedStale {
        /// Service served stale.
        service: String,
    },
    /// An entry's endpoints were dropped after the registry confirmed
    /// emptiness for the configured number of consecutive refreshes.
    EntryEvicted {
        /// Service whose entry was evicted.
        service: String,
        /// Consecutive empty refreshes observed at eviction time.
        consecutive_empty: u32,
    },
}

/// Events emitted by the lease manager.
#[derive(Debug, Clone)]
pub enum LeaseEvent {
    /// The process's own registration was accepted.
    Registered {
        /// Service the lease belongs to.
        service: String,
        /// This process's advertised endpoint.
        endpoint: Endpoint,
    },
    /// A heartbeat did not reach the registry or was rejected.
    HeartbeatFailed {
        /// Service the lease belongs to.
        service: String,
        /// Failures since the last successful heartbeat.
        consecutive_failures: u32,
    },
    /// The lease is considered lost; re-registration will be attempted.
    Expired {
        /// Service the lease belongs to.
        service: String,
    },
    /// The lease was explicitly removed (or removal was attempted) on shutdown.
    Deregistered {
        /// Service the lease belonged to.
        service: String,
    },
}

/// Events emitted by circuit breakers.
#[derive(Debug, Clone)]
pub enum BreakerEvent {
    /// A circuit moved between states.
    StateTransition {
        /// Service component of the breaker key.
        service: String,
        /// Endpoint component of the breaker key.
        endpoint: Endpoint,
        /// State before the transition.
        from: BreakerState,
        /// State after the transition.
        to: BreakerState,
    },
    /// A call was short-circuited without reaching the endpoint.
    CallRejected {
        /// Service component of the breaker key.
        service: String,
        /// Endpoint component of the breaker key.
        endpoint: Endpoint,
    },
}

/// Events emitted by the retry orchestration in the façade.
#[derive(Debug, Clone)]
pub enum RetryEvent {
    /// A retry is about to run after the given backoff delay.
    Attempt {
        /// Logical service being called.
        service: String,
        /// 1-based number of the attempt about to run.
        attempt: usize,
        /// Backoff slept before this attempt.
        delay: Duration,
    },
    /// The attempt budget was spent without a success.
    Exhausted {
        /// Logical service being called.
        service: String,
        /// Total attempts made.
        attempts: usize,
    },
}

/// Trait for receiving events of type `E`.
pub trait EventListener<E>: Send + Sync {
    /// Called synchronously when an event occurs.
    fn on_event(&self, event: &E);
}

/// A function-based event listener.
pub struct FnListener<F>(F);

impl<F> FnListener<F> {
    /// Wraps a closure as a listener.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<E, F> EventListener<E> for FnListener<F>
where
    F: Fn(&E) + Send + Sync,
{
    fn on_event(&self, event: &E) {
        (self.0)(event)
    }
}

/// A collection of event listeners for one event type.
pub struct EventListeners<E> {
    listeners: Vec<Arc<dyn EventListener<E>>>,
}

impl<E> EventListeners<E> {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    /// Adds a listener.
    pub fn add<L>(&mut self, listener: L)
    where
        L: EventListener<E> + 'static,
    {
        self.listeners.push(Arc::new(listener));
    }

    /// Emits an event to all registered listeners.
    ///
    /// A panicking listener is caught so the remaining listeners still run.
    pub fn emit(&self, event: &E) {
        for listener in &self.listeners {
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_event(event);
            }));
        }
    }

    /// Returns true if no listeners are registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }
}

impl<E> Clone for EventListeners<E> {
    fn clone(&self) -> Self {
        Self {
            listeners: self.listeners.clone(),
        }
    }
}

impl<E> Default for EventListeners<E> {
    fn default() -> Self {
        Self::new()
    }
}
