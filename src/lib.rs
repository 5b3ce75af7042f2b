//! Resilient service location for Tower clients.
//!
//! `tower-locator` turns a logical service name into a usable address and
//! runs a caller-supplied operation against it, without the caller knowing
//! whether the name was resolved from a dynamic registry, platform DNS, or a
//! statically configured alias.
//!
//! ## Components
//!
//! - [`RegistryCache`]: locally cached instance lists per service name,
//!   refreshed on a timer, served stale when the registry is unreachable,
//!   and evicted only after the registry confirms emptiness for several
//!   consecutive refreshes (the detection-delay window).
//! - [`LeaseManager`]: maintains this process's own registration lease with
//!   periodic heartbeats and best-effort deregistration on shutdown.
//! - [`ResolutionChain`]: ordered stages (registry → DNS → static alias)
//!   with configurable miss/error fallthrough and pluggable endpoint
//!   selection (round-robin by default).
//! - [`BreakerRegistry`]: per-endpoint circuit breaking with a serialized
//!   half-open trial.
//! - [`RetryPolicy`]: bounded attempts with fixed, exponential, or jittered
//!   backoff.
//! - [`Locator`]: the façade composing all of the above around an
//!   invocation transport (any `tower::Service<Endpoint>`).
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use tower::service_fn;
//! use tower_locator::{
//!     AliasTable, CacheConfig, Endpoint, Locator, RegistryCache, RegistryClient,
//!     RegistryError, ResolutionChain, RetryPolicy,
//! };
//!
//! # struct StaticRegistry;
//! # impl RegistryClient for StaticRegistry {
//! #     async fn fetch_instances(&self, _: &str) -> Result<Vec<Endpoint>, RegistryError> {
//! #         Ok(vec![Endpoint::new("10.0.0.7", 8080)])
//! #     }
//! #     async fn register(&self, _: &str, _: &Endpoint) -> Result<(), RegistryError> { Ok(()) }
//! #     async fn heartbeat(&self, _: &str, _: &Endpoint) -> Result<(), RegistryError> { Ok(()) }
//! #     async fn deregister(&self, _: &str, _: &Endpoint) -> Result<(), RegistryError> { Ok(()) }
//! # }
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = Arc::new(RegistryCache::new(
//!     StaticRegistry,
//!     CacheConfig::builder().build(),
//! ));
//! cache.start().await;
//!
//! let chain = ResolutionChain::builder()
//!     .registry(Arc::clone(&cache))
//!     .static_alias(
//!         AliasTable::new().alias("user-service", vec![Endpoint::new("user-service.internal", 80)]),
//!     )
//!     .build()?;
//!
//! let transport = service_fn(|endpoint: Endpoint| async move {
//!     Ok::<_, std::io::Error>(format!("GET {endpoint}/users/john"))
//! });
//!
//! let locator = Locator::builder(chain, transport)
//!     .retry_policy(RetryPolicy::builder().max_attempts(3).build())
//!     .build()?;
//!
//! let response = locator.call("user-service").await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Error handling
//!
//! [`Locator::call`] is the only surface returning a terminal error:
//!
//! - [`LocatorError::NoInstances`]: no stage knows of a live instance; the
//!   operation was never invoked and the call was not retried.
//! - [`LocatorError::AllEndpointsUnavailable`]: endpoints exist, but every
//!   attempt was short-circuited by an open circuit.
//! - [`LocatorError::RetriesExhausted`]: the attempt budget was spent; the
//!   final attempt's failure is attached.
//!
//! The cache and lease manager absorb remote-registry errors internally
//! (serving stale entries, retrying heartbeats) instead of propagating them
//! per call.
//!
//! ## Feature flags
//!
//! - `metrics`: counters for refreshes, evictions, heartbeats, breaker
//!   transitions, and call outcomes via the `metrics` crate
//! - `tracing`: logging via the `tracing` crate

mod breaker;
mod cache;
mod chain;
mod endpoint;
mod error;
mod events;
mod lease;
mod registry;
mod retry;

pub use breaker::{
    BreakerConfig, BreakerConfigBuilder, BreakerKey, BreakerOpen, BreakerPermit, BreakerRegistry,
    BreakerState, CoolDownBackoff,
};
pub use cache::{CacheConfig, CacheConfigBuilder, CacheLookup, RegistryCache, StalenessPolicy};
pub use chain::{
    AliasTable, CustomSelectorFn, LookupError, NameResolver, ResolutionChain,
    ResolutionChainBuilder, ResolutionFailure, ResolverStage, SelectionStrategy, StageKind,
};
pub use endpoint::Endpoint;
pub use error::{AttemptFailure, ConfigError, LocatorError};
pub use events::{
    BreakerEvent, CacheEvent, EventListener, EventListeners, FnListener, LeaseEvent, RetryEvent,
};
pub use lease::{LeaseConfig, LeaseConfigBuilder, LeaseManager, LeaseState};
pub use registry::{RegistryClient, RegistryError};
pub use retry::{
    ExponentialBackoff, ExponentialRandomBackoff, FixedInterval, FnInterval, IntervalFunction,
    RetryPolicy, RetryPolicyBuilder,
};

#[cfg(feature = "metrics")]
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tower::{Service, ServiceExt};

/// Single entry point for resolving and calling a logical service.
///
/// Composes the resolution chain, per-endpoint circuit breakers, and the
/// retry policy around a caller-supplied invocation transport. The locator
/// never interprets the transport's request or response payloads.
///
/// Cloning is cheap; clones share chain, breaker, and rotation state.
pub struct Locator<S, C> {
    chain: Arc<ResolutionChain<C>>,
    breakers: Arc<BreakerRegistry>,
    retry: RetryPolicy,
    transport: S,
    request_timeout: Duration,
    listeners: Arc<EventListeners<RetryEvent>>,
}

impl<S, C> Locator<S, C> {
    /// Creates a builder from a resolution chain and invocation transport.
    pub fn builder(chain: ResolutionChain<C>, transport: S) -> LocatorBuilder<S, C> {
        LocatorBuilder::new(chain, transport)
    }

    /// The breaker registry, for state inspection and manual controls.
    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// The resolution chain.
    pub fn chain(&self) -> &ResolutionChain<C> {
        &self.chain
    }
}

impl<S: Clone, C> Clone for Locator<S, C> {
    fn clone(&self) -> Self {
        Self {
            chain: Arc::clone(&self.chain),
            breakers: Arc::clone(&self.breakers),
            retry: self.retry.clone(),
            transport: self.transport.clone(),
            request_timeout: self.request_timeout,
            listeners: Arc::clone(&self.listeners),
        }
    }
}

impl<S, C> Locator<S, C>
where
    S: Service<Endpoint> + Clone + Send + 'static,
    S::Response: Send,
    S::Error: Send,
    S::Future: Send,
    C: RegistryClient + 'static,
{
    /// Resolves `service` and runs the transport against the chosen
    /// endpoint, retrying per the configured policy.
    ///
    /// Each attempt re-resolves, so the selection strategy rotates retries
    /// across instances. Every attempt carries the request deadline;
    /// exceeding it feeds the breaker and retry policy identically to a
    /// connection error.
    pub async fn call(&self, service: &str) -> Result<S::Response, LocatorError<S::Error>> {
        let mut transport = self.transport.clone();
        let budget = self.retry.max_attempts();
        let mut invoked = false;
        let mut short_circuited = false;
        let mut last: Option<AttemptFailure<S::Error>> = None;

        for attempt in 1..=budget {
            if attempt > 1 {
                let delay = self.retry.backoff_for(attempt - 2);
                self.listeners.emit(&RetryEvent::Attempt {
                    service: service.to_string(),
                    attempt,
                    delay,
                });

                #[cfg(feature = "tracing")]
                tracing::debug!(service, attempt, ?delay, "retrying call");

                tokio::time::sleep(delay).await;
            }

            let endpoint = match self.chain.resolve(service).await {
                Ok(endpoint) => endpoint,
                Err(ResolutionFailure::NoInstances { .. }) => {
                    #[cfg(feature = "metrics")]
                    counter!("locator_calls_total", "outcome" => "no_instances").increment(1);

                    return Err(LocatorError::NoInstances {
                        service: service.to_string(),
                    });
                }
                Err(ResolutionFailure::AllStagesErrored { last_error, .. }) => {
                    last = Some(AttemptFailure::Resolution(last_error));
                    continue;
                }
            };

            let key = BreakerKey::new(service, endpoint.clone());
            let permit = match self.breakers.try_acquire(&key) {
                Ok(permit) => permit,
                Err(open) => {
                    short_circuited = true;
                    last = Some(AttemptFailure::BreakerOpen(open.endpoint));
                    continue;
                }
            };

            invoked = true;
            let outcome = tokio::time::timeout(self.request_timeout, async {
                transport.ready().await?.call(endpoint).await
            })
            .await;

            match outcome {
                Ok(Ok(response)) => {
                    permit.record_success();

                    #[cfg(feature = "metrics")]
                    counter!("locator_calls_total", "outcome" => "success").increment(1);

                    return Ok(response);
                }
                Ok(Err(err)) => {
                    permit.record_failure();
                    last = Some(AttemptFailure::Transport(err));
                }
                Err(_) => {
                    permit.record_failure();
                    last = Some(AttemptFailure::DeadlineExceeded);
                }
            }
        }

        self.listeners.emit(&RetryEvent::Exhausted {
            service: service.to_string(),
            attempts: budget,
        });

        if !invoked && short_circuited {
            #[cfg(feature = "metrics")]
            counter!("locator_calls_total", "outcome" => "unavailable").increment(1);

            return Err(LocatorError::AllEndpointsUnavailable {
                service: service.to_string(),
            });
        }

        #[cfg(feature = "metrics")]
        counter!("locator_calls_total", "outcome" => "exhausted").increment(1);

        Err(LocatorError::RetriesExhausted {
            service: service.to_string(),
            attempts: budget,
            last: last.unwrap_or_else(|| AttemptFailure::Resolution("no attempt ran".into())),
        })
    }
}

/// Builder for [`Locator`].
pub struct LocatorBuilder<S, C> {
    chain: ResolutionChain<C>,
    transport: S,
    breaker_config: BreakerConfig,
    retry: RetryPolicy,
    request_timeout: Duration,
    listeners: EventListeners<RetryEvent>,
}

impl<S, C> LocatorBuilder<S, C> {
    /// Creates a builder with default breaker, retry, and timeout settings.
    ///
    /// Defaults:
    /// - breaker: threshold 5, cool-down 30s
    /// - retry: 3 attempts, exponential backoff from 100ms
    /// - request_timeout: 5s
    pub fn new(chain: ResolutionChain<C>, transport: S) -> Self {
        Self {
            chain,
            transport,
            breaker_config: BreakerConfig::builder().build(),
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(5),
            listeners: EventListeners::new(),
        }
    }

    /// Sets the circuit breaker configuration.
    pub fn breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// Sets the retry policy.
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the deadline applied to each transport attempt.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Adds a retry event listener.
    pub fn listener<L>(mut self, listener: L) -> Self
    where
        L: EventListener<RetryEvent> + 'static,
    {
        self.listeners.add(listener);
        self
    }

    /// Registers a callback invoked before each retry with the attempt
    /// number and backoff delay.
    pub fn on_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(usize, Duration) + Send + Sync + 'static,
    {
        self.listeners
            .add(FnListener::new(move |event: &RetryEvent| {
                if let RetryEvent::Attempt { attempt, delay, .. } = event {
                    f(*attempt, *delay);
                }
            }));
        self
    }

    /// Builds the locator, rejecting invalid policies at startup.
    pub fn build(self) -> Result<Locator<S, C>, ConfigError> {
        if self.retry.max_attempts() == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.breaker_config.failure_threshold == 0 {
            return Err(ConfigError::ZeroFailureThreshold);
        }

        Ok(Locator {
            chain: Arc::new(self.chain),
            breakers: Arc::new(BreakerRegistry::new(self.breaker_config)),
            retry: self.retry,
            transport: self.transport,
            request_timeout: self.request_timeout,
            listeners: Arc::new(self.listeners),
        })
    }
}
