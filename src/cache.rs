//! Locally cached registry entries with periodic refresh.
//!
//! The cache favors degraded availability over hard failure: when the remote
//! registry cannot be reached, the previous entry is served stale rather than
//! evicted. An entry's endpoints are dropped only after the registry has
//! explicitly reported zero instances for a configured number of consecutive
//! refreshes, so a removed instance may keep resolving for up to
//! `refresh_interval * evict_after_consecutive_empty`. That detection-delay
//! window is a designed property of registry-based discovery, and tests
//! assert it.

use crate::endpoint::Endpoint;
use crate::events::{CacheEvent, EventListeners, FnListener};
use crate::registry::{RegistryClient, RegistryError};
#[cfg(feature = "metrics")]
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// How staleness past the entry TTL is exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StalenessPolicy {
    /// A stale entry is refreshed synchronously before being served. If the
    /// refresh fails, the stale entry is served anyway.
    #[default]
    RefreshBeforeServe,

    /// A stale entry is served as-is, with the `stale` flag set on the hit.
    ServeFlagged,
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// The cache holds at least one endpoint for the service.
    Hit {
        /// Snapshot of the cached endpoints. Callers own the copy; the
        /// cached entry is never handed out by reference.
        endpoints: Vec<Endpoint>,
        /// True if the entry is older than its TTL.
        stale: bool,
    },
    /// The registry definitively knows of no instances.
    Miss,
    /// No usable entry exists and the latest refresh failed to reach the
    /// registry, so the answer is unknown rather than empty.
    Unavailable {
        /// Transport-level reason from the failed refresh.
        reason: String,
    },
}

impl CacheLookup {
    /// Returns true for a hit.
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit { .. })
    }

    /// The endpoints of a hit, if any.
    pub fn endpoints(&self) -> Option<&[Endpoint]> {
        match self {
            CacheLookup::Hit { endpoints, .. } => Some(endpoints),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    endpoints: Vec<Endpoint>,
    last_refreshed: Instant,
    consecutive_empty: u32,
    last_error: Option<String>,
}

impl CacheEntry {
    fn empty() -> Self {
        Self {
            endpoints: Vec::new(),
            last_refreshed: Instant::now(),
            consecutive_empty: 0,
            last_error: None,
        }
    }
}

/// Configuration for [`RegistryCache`].
#[derive(Clone)]
pub struct CacheConfig {
    pub(crate) refresh_interval: Duration,
    pub(crate) entry_ttl: Duration,
    pub(crate) evict_after_consecutive_empty: u32,
    pub(crate) staleness_policy: StalenessPolicy,
    pub(crate) request_timeout: Duration,
    pub(crate) listeners: EventListeners<CacheEvent>,
}

impl CacheConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::new()
    }
}

/// Builder for [`CacheConfig`].
pub struct CacheConfigBuilder {
    refresh_interval: Duration,
    entry_ttl: Duration,
    evict_after_consecutive_empty: u32,
    staleness_policy: StalenessPolicy,
    request_timeout: Duration,
    listeners: EventListeners<CacheEvent>,
}

impl Default for CacheConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheConfigBuilder {
    /// Creates a builder with default values.
    ///
    /// Defaults:
    /// - refresh_interval: 30s
    /// - entry_ttl: 30s
    /// - evict_after_consecutive_empty: 3
    /// - staleness_policy: RefreshBeforeServe
    /// - request_timeout: 5s
    pub fn new() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30),
            entry_ttl: Duration::from_secs(30),
            evict_after_consecutive_empty: 3,
            staleness_policy: StalenessPolicy::default(),
            request_timeout: Duration::from_secs(5),
            listeners: EventListeners::new(),
        }
    }

    /// Sets the background refresh interval.
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Sets the age past which an entry counts as stale.
    pub fn entry_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl;
        self
    }

    /// Sets how many consecutive empty registry answers are required before
    /// an entry's endpoints are dropped.
    ///
    /// A value of 0 evicts on the first empty report.
    pub fn evict_after_consecutive_empty(mut self, refreshes: u32) -> Self {
        self.evict_after_consecutive_empty = refreshes;
        self
    }

    /// Sets how staleness is exposed to callers.
    pub fn staleness_policy(mut self, policy: StalenessPolicy) -> Self {
        self.staleness_policy = policy;
        self
    }

    /// Sets the deadline applied to each registry fetch.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Adds an event listener.
    pub fn listener<L>(mut self, listener: L) -> Self
    where
        L: crate::events::EventListener<CacheEvent> + 'static,
    {
        self.listeners.add(listener);
        self
    }

    /// Registers a callback invoked when an entry's endpoints are evicted.
    pub fn on_eviction<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.listeners.add(FnListener::new(move |event: &CacheEvent| {
            if let CacheEvent::EntryEvicted { service, .. } = event {
                f(service);
            }
        }));
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> CacheConfig {
        CacheConfig {
            refresh_interval: self.refresh_interval,
            entry_ttl: self.entry_ttl,
            evict_after_consecutive_empty: self.evict_after_consecutive_empty,
            staleness_policy: self.staleness_policy,
            request_timeout: self.request_timeout,
            listeners: self.listeners,
        }
    }
}

/// Local, periodically refreshed copy of remote service-to-address mappings.
///
/// Entries are replaced atomically under a write lock: concurrent readers see
/// either the old or the new endpoint set, never a partial one. Lookups hand
/// out cloned snapshots.
pub struct RegistryCache<C> {
    client: Arc<C>,
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    config: CacheConfig,
    refresh_task: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl<C> RegistryCache<C>
where
    C: RegistryClient + 'static,
{
    /// Creates a cache over the given registry client.
    pub fn new(client: C, config: CacheConfig) -> Self {
        Self {
            client: Arc::new(client),
            entries: Arc::new(RwLock::new(HashMap::new())),
            config,
            refresh_task: Arc::new(RwLock::new(None)),
        }
    }

    /// Looks up the cached endpoints for `service`.
    ///
    /// A name queried for the first time is fetched synchronously and from
    /// then on is included in the background refresh loop.
    pub async fn get(&self, service: &str) -> CacheLookup {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(service) {
                let stale = entry.last_refreshed.elapsed() > self.config.entry_ttl;
                if !stale {
                    return self.lookup_from(service, entry, false);
                }
                if self.config.staleness_policy == StalenessPolicy::ServeFlagged {
                    return self.lookup_from(service, entry, true);
                }
                // RefreshBeforeServe: fall through to a synchronous refresh.
            }
        }

        self.refresh(service).await;

        let entries = self.entries.read().await;
        match entries.get(service) {
            Some(entry) => {
                let stale = entry.last_refreshed.elapsed() > self.config.entry_ttl;
                self.lookup_from(service, entry, stale)
            }
            None => CacheLookup::Miss,
        }
    }

    fn lookup_from(&self, service: &str, entry: &CacheEntry, stale: bool) -> CacheLookup {
        if entry.endpoints.is_empty() {
            if let Some(reason) = &entry.last_error {
                return CacheLookup::Unavailable {
                    reason: reason.clone(),
                };
            }
            return CacheLookup::Miss;
        }

        if stale {
            self.config.listeners.emit(&CacheEvent::ServedStale {
                service: service.to_string(),
            });

            #[cfg(feature = "tracing")]
            tracing::debug!(service, "serving stale registry entry");

            #[cfg(feature = "metrics")]
            counter!("locator_cache_stale_serves_total", "service" => service.to_string())
                .increment(1);
        }

        CacheLookup::Hit {
            endpoints: entry.endpoints.clone(),
            stale,
        }
    }

    /// Forces a synchronous pull from the remote registry for `service`,
    /// replacing the cached entry atomically.
    pub async fn refresh(&self, service: &str) {
        refresh_entry(&*self.client, &self.entries, &self.config, service).await;
    }

    /// Starts the background refresh loop.
    ///
    /// Every `refresh_interval`, all previously queried names are refreshed.
    /// Calling `start` again replaces the running loop.
    pub async fn start(&self) {
        let client = Arc::clone(&self.client);
        let entries = Arc::clone(&self.entries);
        let config = self.config.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.refresh_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; consume it so the loop
            // waits a full interval before its first pass.
            interval.tick().await;

            loop {
                interval.tick().await;

                let names: Vec<String> = entries.read().await.keys().cloned().collect();
                for name in names {
                    refresh_entry(&*client, &entries, &config, &name).await;
                }
            }
        });

        let mut slot = self.refresh_task.write().await;
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
    }

    /// Stops the background refresh loop.
    pub async fn stop(&self) {
        let mut slot = self.refresh_task.write().await;
        if let Some(task) = slot.take() {
            task.abort();
        }
    }

    /// Names currently tracked by the refresh loop.
    pub async fn watched(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Snapshot of the cached endpoints for `service`, if an entry exists.
    ///
    /// Unlike [`get`](Self::get) this never triggers a fetch.
    pub async fn snapshot(&self, service: &str) -> Option<Vec<Endpoint>> {
        self.entries
            .read()
            .await
            .get(service)
            .map(|entry| entry.endpoints.clone())
    }
}

async fn refresh_entry<C>(
    client: &C,
    entries: &RwLock<HashMap<String, CacheEntry>>,
    config: &CacheConfig,
    service: &str,
) where
    C: RegistryClient,
{
    let fetched = match tokio::time::timeout(
        config.request_timeout,
        client.fetch_instances(service),
    )
    .await
    {
        Ok(Ok(instances)) => Ok(instances),
        // An explicit not-found is an empty answer, not a failure.
        Ok(Err(RegistryError::NotFound)) => Ok(Vec::new()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err("request timed out".to_string()),
    };

    let mut entries = entries.write().await;
    let entry = entries
        .entry(service.to_string())
        .or_insert_with(CacheEntry::empty);

    match fetched {
        Ok(instances) if !instances.is_empty() => {
            let count = instances.len();
            entry.endpoints = instances;
            entry.last_refreshed = Instant::now();
            entry.consecutive_empty = 0;
            entry.last_error = None;

            config.listeners.emit(&CacheEvent::RefreshSucceeded {
                service: service.to_string(),
                instances: count,
            });

            #[cfg(feature = "tracing")]
            tracing::debug!(service, instances = count, "registry entry refreshed");

            #[cfg(feature = "metrics")]
            counter!("locator_cache_refreshes_total", "outcome" => "success").increment(1);
        }
        Ok(_) => {
            entry.consecutive_empty += 1;
            entry.last_refreshed = Instant::now();
            entry.last_error = None;

            if entry.consecutive_empty >= config.evict_after_consecutive_empty
                && !entry.endpoints.is_empty()
            {
                entry.endpoints.clear();

                config.listeners.emit(&CacheEvent::EntryEvicted {
                    service: service.to_string(),
                    consecutive_empty: entry.consecutive_empty,
                });

                #[cfg(feature = "tracing")]
                tracing::info!(
                    service,
                    consecutive_empty = entry.consecutive_empty,
                    "registry entry evicted"
                );

                #[cfg(feature = "metrics")]
                counter!("locator_cache_evictions_total").increment(1);
            }

            config.listeners.emit(&CacheEvent::RefreshSucceeded {
                service: service.to_string(),
                instances: 0,
            });

            #[cfg(feature = "metrics")]
            counter!("locator_cache_refreshes_total", "outcome" => "empty").increment(1);
        }
        Err(reason) => {
            // Previous endpoints are retained and served stale.
            entry.last_error = Some(reason.clone());

            config.listeners.emit(&CacheEvent::RefreshFailed {
                service: service.to_string(),
                reason: reason.clone(),
            });

            #[cfg(feature = "tracing")]
            tracing::warn!(service, %reason, "registry refresh failed; retaining cached entry");

            #[cfg(feature = "metrics")]
            counter!("locator_cache_refreshes_total", "outcome" => "error").increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedRegistry {
        responses: Mutex<VecDeque<Result<Vec<Endpoint>, RegistryError>>>,
    }

    impl ScriptedRegistry {
        fn new(responses: Vec<Result<Vec<Endpoint>, RegistryError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
            }
        }
    }

    impl RegistryClient for ScriptedRegistry {
        async fn fetch_instances(&self, _: &str) -> Result<Vec<Endpoint>, RegistryError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(RegistryError::Unavailable("script exhausted".into())))
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

    fn ep(host: &str) -> Endpoint {
        Endpoint::new(host, 8080)
    }

    #[tokio::test]
    async fn first_query_fetches_and_tracks() {
        let cache = RegistryCache::new(
            ScriptedRegistry::new(vec![Ok(vec![ep("a")])]),
            CacheConfig::builder().build(),
        );

        let lookup = cache.get("user-service").await;
        assert_eq!(lookup.endpoints(), Some(&[ep("a")][..]));
        assert_eq!(cache.watched().await, vec!["user-service".to_string()]);
    }

    #[tokio::test]
    async fn explicit_not_found_is_a_miss() {
        let cache = RegistryCache::new(
            ScriptedRegistry::new(vec![Err(RegistryError::NotFound)]),
            CacheConfig::builder().build(),
        );

        assert_eq!(cache.get("ghost-service").await, CacheLookup::Miss);
    }

    #[tokio::test]
    async fn unreachable_registry_with_no_entry_is_unavailable() {
        let cache = RegistryCache::new(
            ScriptedRegistry::new(vec![Err(RegistryError::Unavailable("refused".into()))]),
            CacheConfig::builder().build(),
        );

        match cache.get("user-service").await {
            CacheLookup::Unavailable { reason } => assert!(reason.contains("refused")),
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_refresh_retains_previous_endpoints() {
        let cache = RegistryCache::new(
            ScriptedRegistry::new(vec![
                Ok(vec![ep("a")]),
                Err(RegistryError::Unavailable("refused".into())),
            ]),
            CacheConfig::builder().build(),
        );

        assert!(cache.get("user-service").await.is_hit());
        cache.refresh("user-service").await;
        assert_eq!(cache.snapshot("user-service").await, Some(vec![ep("a")]));
    }

    #[tokio::test]
    async fn eviction_waits_for_consecutive_empty_refreshes() {
        let cache = RegistryCache::new(
            ScriptedRegistry::new(vec![
                Ok(vec![ep("a")]),
                Ok(vec![]),
                Ok(vec![]),
                Ok(vec![]),
            ]),
            CacheConfig::builder()
                .evict_after_consecutive_empty(3)
                .build(),
        );

        assert!(cache.get("user-service").await.is_hit());

        cache.refresh("user-service").await;
        assert!(cache.get("user-service").await.is_hit(), "1st empty refresh");
        cache.refresh("user-service").await;
        assert!(cache.get("user-service").await.is_hit(), "2nd empty refresh");

        cache.refresh("user-service").await;
        assert_eq!(cache.get("user-service").await, CacheLookup::Miss);
    }

    #[tokio::test]
    async fn nonempty_answer_resets_the_empty_streak() {
        let cache = RegistryCache::new(
            ScriptedRegistry::new(vec![
                Ok(vec![ep("a")]),
                Ok(vec![]),
                Ok(vec![]),
                Ok(vec![ep("b")]),
                Ok(vec![]),
            ]),
            CacheConfig::builder()
                .evict_after_consecutive_empty(3)
                .build(),
        );

        cache.get("user-service").await;
        cache.refresh("user-service").await;
        cache.refresh("user-service").await;
        cache.refresh("user-service").await; // non-empty, streak resets
        cache.refresh("user-service").await; // 1st empty of a new streak

        assert_eq!(cache.snapshot("user-service").await, Some(vec![ep("b")]));
    }
}
