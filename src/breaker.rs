//! Per-endpoint circuit breaking.
//!
//! Circuits are keyed by `(service, endpoint)` so one bad endpoint does not
//! penalize the rest of a service's instances. Circuits are created lazily
//! on first use and retained for the life of the registry; the map is
//! bounded by the set of distinct resolved endpoints.

use crate::endpoint::Endpoint;
use crate::events::{BreakerEvent, EventListeners, FnListener};
#[cfg(feature = "metrics")]
use metrics::counter;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// State of a single circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BreakerState {
    /// Calls are allowed; failures are counted.
    Closed = 0,
    /// Calls are rejected until the cool-down elapses.
    Open = 1,
    /// One trial call is allowed through to probe recovery.
    HalfOpen = 2,
}

impl BreakerState {
    /// Short label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

/// How the open-state cool-down evolves across consecutive open periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoolDownBackoff {
    /// The configured cool-down applies after every open transition.
    Reset,
    /// The cool-down doubles after each failed half-open trial, up to `max`.
    Exponential {
        /// Upper bound on the cool-down.
        max: Duration,
    },
}

/// Identity a circuit is tracked under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BreakerKey {
    service: String,
    endpoint: Endpoint,
}

impl BreakerKey {
    /// Creates a key for the given service and endpoint.
    pub fn new(service: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            service: service.into(),
            endpoint,
        }
    }

    /// The service component.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The endpoint component.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

/// The circuit for a key is open; the call was not attempted.
#[derive(Debug, Clone, Error)]
#[error("circuit open for `{service}` endpoint {endpoint}")]
pub struct BreakerOpen {
    /// Service component of the rejected key.
    pub service: String,
    /// Endpoint component of the rejected key.
    pub endpoint: Endpoint,
}

/// Configuration for [`BreakerRegistry`].
#[derive(Clone)]
pub struct BreakerConfig {
    pub(crate) failure_threshold: u32,
    pub(crate) cool_down: Duration,
    pub(crate) cool_down_backoff: CoolDownBackoff,
    pub(crate) listeners: EventListeners<BreakerEvent>,
}

impl BreakerConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> BreakerConfigBuilder {
        BreakerConfigBuilder::new()
    }
}

/// Builder for [`BreakerConfig`].
pub struct BreakerConfigBuilder {
    failure_threshold: u32,
    cool_down: Duration,
    cool_down_backoff: CoolDownBackoff,
    listeners: EventListeners<BreakerEvent>,
}

impl Default for BreakerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakerConfigBuilder {
    /// Creates a builder with default values.
    ///
    /// Defaults:
    /// - failure_threshold: 5
    /// - cool_down: 30s
    /// - cool_down_backoff: Reset
    pub fn new() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
            cool_down_backoff: CoolDownBackoff::Reset,
            listeners: EventListeners::new(),
        }
    }

    /// Sets how many consecutive failures open a circuit.
    pub fn failure_threshold(mut self, failures: u32) -> Self {
        self.failure_threshold = failures;
        self
    }

    /// Sets the cool-down before an open circuit permits a trial call.
    pub fn cool_down(mut self, cool_down: Duration) -> Self {
        self.cool_down = cool_down;
        self
    }

    /// Sets how the cool-down evolves after failed trials.
    pub fn cool_down_backoff(mut self, backoff: CoolDownBackoff) -> Self {
        self.cool_down_backoff = backoff;
        self
    }

    /// Adds an event listener.
    pub fn listener<L>(mut self, listener: L) -> Self
    where
        L: crate::events::EventListener<BreakerEvent> + 'static,
    {
        self.listeners.add(listener);
        self
    }

    /// Registers a callback invoked on every state transition.
    pub fn on_state_transition<F>(mut self, f: F) -> Self
    where
        F: Fn(BreakerState, BreakerState) + Send + Sync + 'static,
    {
        self.listeners
            .add(FnListener::new(move |event: &BreakerEvent| {
                if let BreakerEvent::StateTransition { from, to, .. } = event {
                    f(*from, *to);
                }
            }));
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            cool_down: self.cool_down,
            cool_down_backoff: self.cool_down_backoff,
            listeners: self.listeners,
        }
    }
}

#[derive(Debug)]
struct Circuit {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Instant,
    current_cool_down: Duration,
    trial_in_flight: bool,
}

impl Circuit {
    fn new(cool_down: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: Instant::now(),
            current_cool_down: cool_down,
            trial_in_flight: false,
        }
    }
}

fn transition(
    circuit: &mut Circuit,
    key: &BreakerKey,
    to: BreakerState,
    listeners: &EventListeners<BreakerEvent>,
) {
    if circuit.state == to {
        return;
    }
    let from = circuit.state;
    circuit.state = to;

    listeners.emit(&BreakerEvent::StateTransition {
        service: key.service.clone(),
        endpoint: key.endpoint.clone(),
        from,
        to,
    });

    #[cfg(feature = "tracing")]
    tracing::info!(
        service = %key.service,
        endpoint = %key.endpoint,
        from = from.as_str(),
        to = to.as_str(),
        "circuit state transition"
    );

    #[cfg(feature = "metrics")]
    counter!("locator_breaker_transitions_total", "to" => to.as_str()).increment(1);
}

/// Tracks one circuit per `(service, endpoint)` key.
///
/// State transitions happen in brief, bounded critical sections; concurrent
/// callers never block on each other's network calls.
pub struct BreakerRegistry {
    circuits: Mutex<HashMap<BreakerKey, Arc<Mutex<Circuit>>>>,
    config: Arc<BreakerConfig>,
}

impl BreakerRegistry {
    /// Creates a registry with the given configuration.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            circuits: Mutex::new(HashMap::new()),
            config: Arc::new(config),
        }
    }

    fn circuit_for(&self, key: &BreakerKey) -> Arc<Mutex<Circuit>> {
        let mut circuits = self.circuits.lock().unwrap();
        Arc::clone(
            circuits
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Circuit::new(self.config.cool_down)))),
        )
    }

    /// Gates a call against `key`'s circuit.
    ///
    /// Returns a permit whose outcome must be recorded, or [`BreakerOpen`]
    /// if the call is short-circuited. While a half-open trial is in flight,
    /// concurrent acquires on the same key are rejected, so exactly one
    /// trial probes the endpoint at a time.
    pub fn try_acquire(&self, key: &BreakerKey) -> Result<BreakerPermit, BreakerOpen> {
        let circuit = self.circuit_for(key);
        let mut guard = circuit.lock().unwrap();

        let permitted_trial = match guard.state {
            BreakerState::Closed => Some(false),
            BreakerState::Open => {
                if guard.opened_at.elapsed() >= guard.current_cool_down {
                    transition(&mut guard, key, BreakerState::HalfOpen, &self.config.listeners);
                    guard.trial_in_flight = true;
                    Some(true)
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => {
                if guard.trial_in_flight {
                    None
                } else {
                    guard.trial_in_flight = true;
                    Some(true)
                }
            }
        };

        match permitted_trial {
            Some(trial) => {
                drop(guard);
                Ok(BreakerPermit {
                    circuit,
                    key: key.clone(),
                    config: Arc::clone(&self.config),
                    trial,
                    outcome_recorded: false,
                })
            }
            None => {
                drop(guard);
                self.config.listeners.emit(&BreakerEvent::CallRejected {
                    service: key.service.clone(),
                    endpoint: key.endpoint.clone(),
                });

                #[cfg(feature = "metrics")]
                counter!("locator_breaker_rejections_total").increment(1);

                Err(BreakerOpen {
                    service: key.service.clone(),
                    endpoint: key.endpoint.clone(),
                })
            }
        }
    }

    /// Current state of `key`'s circuit. A key never seen is `Closed`.
    pub fn state(&self, key: &BreakerKey) -> BreakerState {
        let circuits = self.circuits.lock().unwrap();
        circuits
            .get(key)
            .map(|c| c.lock().unwrap().state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Forces `key`'s circuit open.
    pub fn force_open(&self, key: &BreakerKey) {
        let circuit = self.circuit_for(key);
        let mut guard = circuit.lock().unwrap();
        transition(&mut guard, key, BreakerState::Open, &self.config.listeners);
        guard.opened_at = Instant::now();
        guard.trial_in_flight = false;
    }

    /// Forces `key`'s circuit closed.
    pub fn force_closed(&self, key: &BreakerKey) {
        self.reset(key);
    }

    /// Resets `key`'s circuit to closed and clears its counters.
    pub fn reset(&self, key: &BreakerKey) {
        let circuit = self.circuit_for(key);
        let mut guard = circuit.lock().unwrap();
        transition(&mut guard, key, BreakerState::Closed, &self.config.listeners);
        guard.consecutive_failures = 0;
        guard.current_cool_down = self.config.cool_down;
        guard.trial_in_flight = false;
    }
}

/// Permission to run one call against a gated endpoint.
///
/// The outcome must be reported via [`record_success`](Self::record_success)
/// or [`record_failure`](Self::record_failure). A permit dropped without an
/// outcome releases the half-open gate without committing a transition, so
/// an abandoned trial cannot wedge the circuit.
pub struct BreakerPermit {
    circuit: Arc<Mutex<Circuit>>,
    key: BreakerKey,
    config: Arc<BreakerConfig>,
    trial: bool,
    outcome_recorded: bool,
}

impl BreakerPermit {
    /// Records a successful call.
    pub fn record_success(mut self) {
        self.finish(true);
    }

    /// Records a failed call (including a deadline exceeded).
    pub fn record_failure(mut self) {
        self.finish(false);
    }

    fn finish(&mut self, success: bool) {
        self.outcome_recorded = true;
        let mut guard = self.circuit.lock().unwrap();
        if self.trial {
            guard.trial_in_flight = false;
        }

        if success {
            guard.consecutive_failures = 0;
            if guard.state == BreakerState::HalfOpen {
                guard.current_cool_down = self.config.cool_down;
                transition(
                    &mut guard,
                    &self.key,
                    BreakerState::Closed,
                    &self.config.listeners,
                );
            }
            return;
        }

        match guard.state {
            // Only the trial's own outcome decides a half-open circuit; a
            // late failure from a permit issued before it opened is ignored.
            BreakerState::HalfOpen if self.trial => {
                guard.current_cool_down = match self.config.cool_down_backoff {
                    CoolDownBackoff::Reset => self.config.cool_down,
                    CoolDownBackoff::Exponential { max } => {
                        (guard.current_cool_down * 2).min(max)
                    }
                };
                guard.opened_at = Instant::now();
                transition(
                    &mut guard,
                    &self.key,
                    BreakerState::Open,
                    &self.config.listeners,
                );
            }
            BreakerState::HalfOpen => {}
            BreakerState::Closed => {
                guard.consecutive_failures += 1;
                if guard.consecutive_failures >= self.config.failure_threshold {
                    guard.opened_at = Instant::now();
                    guard.current_cool_down = self.config.cool_down;
                    transition(
                        &mut guard,
                        &self.key,
                        BreakerState::Open,
                        &self.config.listeners,
                    );
                }
            }
            BreakerState::Open => {}
        }
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.outcome_recorded && self.trial {
            let mut guard = self.circuit.lock().unwrap();
            guard.trial_in_flight = false;
        }
    }
}
