//! This process's own registration lease, maintained via heartbeats.
//!
//! The manager owns exactly one lease (one service name, one advertised
//! endpoint) and mutates only its own registration state. Remote-registry
//! errors are absorbed here: heartbeat failures are counted and logged, and
//! an expired lease is re-registered on a later tick instead of the loop
//! stopping permanently.

use crate::endpoint::Endpoint;
use crate::events::{EventListeners, FnListener, LeaseEvent};
use crate::registry::{RegistryClient, RegistryError};
#[cfg(feature = "metrics")]
use metrics::counter;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// State of the process's registration lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LeaseState {
    /// No registration exists (initial state, or after deregistration).
    Unregistered = 0,
    /// The registry accepted the registration and heartbeats are succeeding.
    Registered = 1,
    /// A heartbeat is currently in flight.
    Renewing = 2,
    /// The lease is considered lost; re-registration will be attempted on
    /// the next heartbeat tick.
    Expired = 3,
}

impl LeaseState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LeaseState::Registered,
            2 => LeaseState::Renewing,
            3 => LeaseState::Expired,
            _ => LeaseState::Unregistered,
        }
    }
}

/// Configuration for [`LeaseManager`].
#[derive(Clone)]
pub struct LeaseConfig {
    pub(crate) heartbeat_interval: Duration,
    pub(crate) consecutive_failure_threshold: u32,
    pub(crate) request_timeout: Duration,
    pub(crate) deregister_timeout: Duration,
    pub(crate) listeners: EventListeners<LeaseEvent>,
}

impl LeaseConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> LeaseConfigBuilder {
        LeaseConfigBuilder::new()
    }
}

/// Builder for [`LeaseConfig`].
pub struct LeaseConfigBuilder {
    heartbeat_interval: Duration,
    consecutive_failure_threshold: u32,
    request_timeout: Duration,
    deregister_timeout: Duration,
    listeners: EventListeners<LeaseEvent>,
}

impl Default for LeaseConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseConfigBuilder {
    /// Creates a builder with default values.
    ///
    /// Defaults:
    /// - heartbeat_interval: 30s
    /// - consecutive_failure_threshold: 3
    /// - request_timeout: 5s
    /// - deregister_timeout: 5s
    pub fn new() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            consecutive_failure_threshold: 3,
            request_timeout: Duration::from_secs(5),
            deregister_timeout: Duration::from_secs(5),
            listeners: EventListeners::new(),
        }
    }

    /// Sets the interval between heartbeats.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets how many consecutive heartbeat failures expire the lease.
    pub fn consecutive_failure_threshold(mut self, failures: u32) -> Self {
        self.consecutive_failure_threshold = failures;
        self
    }

    /// Sets the deadline applied to each registry call from the loop.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the bounded time spent on best-effort deregistration.
    pub fn deregister_timeout(mut self, timeout: Duration) -> Self {
        self.deregister_timeout = timeout;
        self
    }

    /// Adds an event listener.
    pub fn listener<L>(mut self, listener: L) -> Self
    where
        L: crate::events::EventListener<LeaseEvent> + 'static,
    {
        self.listeners.add(listener);
        self
    }

    /// Registers a callback invoked when the lease expires.
    pub fn on_expired<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.listeners.add(FnListener::new(move |event: &LeaseEvent| {
            if let LeaseEvent::Expired { service } = event {
                f(service);
            }
        }));
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> LeaseConfig {
        LeaseConfig {
            heartbeat_interval: self.heartbeat_interval,
            consecutive_failure_threshold: self.consecutive_failure_threshold,
            request_timeout: self.request_timeout,
            deregister_timeout: self.deregister_timeout,
            listeners: self.listeners,
        }
    }
}

#[derive(Debug)]
struct LeaseInner {
    consecutive_failures: u32,
    last_heartbeat_at: Option<Instant>,
}

/// Maintains this process's own registration against the remote registry.
pub struct LeaseManager<C> {
    client: Arc<C>,
    service: String,
    endpoint: Endpoint,
    config: LeaseConfig,
    inner: Arc<Mutex<LeaseInner>>,
    state: Arc<AtomicU8>,
    heartbeat_task: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl<C> LeaseManager<C>
where
    C: RegistryClient + 'static,
{
    /// Creates a manager for the given process identity.
    pub fn new(client: C, service: impl Into<String>, endpoint: Endpoint, config: LeaseConfig) -> Self {
        Self {
            client: Arc::new(client),
            service: service.into(),
            endpoint,
            config,
            inner: Arc::new(Mutex::new(LeaseInner {
                consecutive_failures: 0,
                last_heartbeat_at: None,
            })),
            state: Arc::new(AtomicU8::new(LeaseState::Unregistered as u8)),
            heartbeat_task: Arc::new(RwLock::new(None)),
        }
    }

    /// Current lease state. Lock-free; safe from sync code.
    pub fn state(&self) -> LeaseState {
        LeaseState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// When the last successful heartbeat completed.
    pub async fn last_heartbeat_at(&self) -> Option<Instant> {
        self.inner.lock().await.last_heartbeat_at
    }

    /// Registers this process with the remote registry and starts the
    /// periodic heartbeat loop.
    ///
    /// Returns an error if the initial registration cannot be completed; no
    /// heartbeat loop is started in that case.
    pub async fn register(&self) -> Result<(), RegistryError> {
        bounded(
            self.config.request_timeout,
            self.client.register(&self.service, &self.endpoint),
        )
        .await?;

        self.state
            .store(LeaseState::Registered as u8, Ordering::Release);
        {
            let mut inner = self.inner.lock().await;
            inner.consecutive_failures = 0;
        }

        self.config.listeners.emit(&LeaseEvent::Registered {
            service: self.service.clone(),
            endpoint: self.endpoint.clone(),
        });

        #[cfg(feature = "tracing")]
        tracing::info!(service = %self.service, endpoint = %self.endpoint, "lease registered");

        self.start_heartbeats().await;
        Ok(())
    }

    async fn start_heartbeats(&self) {
        let client = Arc::clone(&self.client);
        let inner = Arc::clone(&self.inner);
        let state = Arc::clone(&self.state);
        let config = self.config.clone();
        let service = self.service.clone();
        let endpoint = self.endpoint.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.heartbeat_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                interval.tick().await;

                if LeaseState::from_u8(state.load(Ordering::Acquire)) == LeaseState::Expired {
                    reregister(&*client, &inner, &state, &config, &service, &endpoint).await;
                    continue;
                }

                state.store(LeaseState::Renewing as u8, Ordering::Release);
                let result = bounded(
                    config.request_timeout,
                    client.heartbeat(&service, &endpoint),
                )
                .await;

                let mut guard = inner.lock().await;
                match result {
                    Ok(()) => {
                        guard.consecutive_failures = 0;
                        guard.last_heartbeat_at = Some(Instant::now());
                        state.store(LeaseState::Registered as u8, Ordering::Release);

                        #[cfg(feature = "metrics")]
                        counter!("locator_heartbeats_total", "outcome" => "success")
                            .increment(1);
                    }
                    Err(err) => {
                        guard.consecutive_failures += 1;
                        let failures = guard.consecutive_failures;

                        config.listeners.emit(&LeaseEvent::HeartbeatFailed {
                            service: service.clone(),
                            consecutive_failures: failures,
                        });

                        #[cfg(feature = "tracing")]
                        tracing::warn!(
                            service = %service,
                            consecutive_failures = failures,
                            error = %err,
                            "heartbeat failed"
                        );

                        #[cfg(feature = "metrics")]
                        counter!("locator_heartbeats_total", "outcome" => "failure")
                            .increment(1);

                        // A not-found answer means the registry has already
                        // evicted the lease; mirror that immediately.
                        if err.is_not_found()
                            || failures >= config.consecutive_failure_threshold
                        {
                            state.store(LeaseState::Expired as u8, Ordering::Release);
                            config.listeners.emit(&LeaseEvent::Expired {
                                service: service.clone(),
                            });

                            #[cfg(feature = "tracing")]
                            tracing::warn!(service = %service, "lease expired");
                        } else {
                            state.store(LeaseState::Registered as u8, Ordering::Release);
                        }
                    }
                }
            }
        });

        let mut slot = self.heartbeat_task.write().await;
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
    }

    /// Best-effort removal of this process's registration.
    ///
    /// The heartbeat loop is stopped first. Deregistration is bounded by
    /// `deregister_timeout`; a failure is logged, not fatal, since the
    /// registry's own lease expiration will eventually reclaim the entry.
    /// Calling this again after a completed deregistration is a no-op.
    pub async fn deregister(&self) {
        {
            let mut slot = self.heartbeat_task.write().await;
            if let Some(task) = slot.take() {
                task.abort();
            }
        }

        if self.state() == LeaseState::Unregistered {
            return;
        }

        let result = bounded(
            self.config.deregister_timeout,
            self.client.deregister(&self.service, &self.endpoint),
        )
        .await;

        match result {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::info!(service = %self.service, "lease deregistered");
            }
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    service = %self.service,
                    error = %_err,
                    "deregistration failed; lease will expire server-side"
                );
            }
        }

        self.state
            .store(LeaseState::Unregistered as u8, Ordering::Release);
        self.config.listeners.emit(&LeaseEvent::Deregistered {
            service: self.service.clone(),
        });
    }
}

async fn reregister<C>(
    client: &C,
    inner: &Mutex<LeaseInner>,
    state: &AtomicU8,
    config: &LeaseConfig,
    service: &str,
    endpoint: &Endpoint,
) where
    C: RegistryClient,
{
    match bounded(config.request_timeout, client.register(service, endpoint)).await {
        Ok(()) => {
            let mut guard = inner.lock().await;
            guard.consecutive_failures = 0;
            state.store(LeaseState::Registered as u8, Ordering::Release);

            config.listeners.emit(&LeaseEvent::Registered {
                service: service.to_string(),
                endpoint: endpoint.clone(),
            });

            #[cfg(feature = "tracing")]
            tracing::info!(service, "lease re-registered");
        }
        Err(_err) => {
            // Stay expired; the next tick tries again.
            #[cfg(feature = "tracing")]
            tracing::debug!(service, error = %_err, "re-registration failed");
        }
    }
}

async fn bounded<F>(timeout: Duration, fut: F) -> Result<(), RegistryError>
where
    F: std::future::Future<Output = Result<(), RegistryError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(RegistryError::Unavailable("request timed out".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OkRegistry;

    impl RegistryClient for OkRegistry {
        async fn fetch_instances(&self, _: &str) -> Result<Vec<Endpoint>, RegistryError> {
            Ok(Vec::new())
        }

        async fn register(&self, _: &str, _: &Endpoint) -> Result<(), RegistryError> {
            Ok(())
        }

        async fn heartbeat(&self, _: &str, _: &Endpoint) -> Result<(), RegistryError> {
            Ok(())
        }

        async fn deregister(&self, _: &str, _: &Endpoint) -> Result<(), RegistryError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn starts_unregistered() {
        let manager = LeaseManager::new(
            OkRegistry,
            "order-service",
            Endpoint::new("10.0.0.9", 8080),
            LeaseConfig::builder().build(),
        );
        assert_eq!(manager.state(), LeaseState::Unregistered);
        assert_eq!(manager.last_heartbeat_at().await, None);
    }

    #[tokio::test]
    async fn register_transitions_to_registered() {
        let manager = LeaseManager::new(
            OkRegistry,
            "order-service",
            Endpoint::new("10.0.0.9", 8080),
            LeaseConfig::builder().build(),
        );
        manager.register().await.unwrap();
        assert_eq!(manager.state(), LeaseState::Registered);
        manager.deregister().await;
    }
}
