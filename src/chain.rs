//! Ordered resolution stages with miss/error fallthrough.
//!
//! A stage succeeds only when it returns a non-empty endpoint set; later
//! stages are then skipped. An explicit empty answer (a miss) always falls
//! through to the next stage. Whether a stage *error* (registry or DNS
//! unreachable) also falls through is configurable and defaults to true.
//! Stage order is fixed at build time and evaluated deterministically.

use crate::cache::{CacheLookup, RegistryCache};
use crate::endpoint::Endpoint;
use crate::error::ConfigError;
use crate::registry::RegistryClient;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors surfaced by a DNS or alias lookup.
#[derive(Debug, Clone, Error)]
pub enum LookupError {
    /// The resolver definitively knows of no such name.
    #[error("name not found")]
    NotFound,

    /// The resolver could not be reached or failed.
    #[error("lookup failed: {0}")]
    Unavailable(String),
}

/// A platform DNS client or any external name resolver.
///
/// Returning `Ok(vec![])` or `Err(NotFound)` is a miss; `Err(Unavailable)`
/// is a stage error subject to the chain's fallthrough setting.
pub trait NameResolver: Send + Sync {
    /// Resolves `service` to a set of endpoints.
    fn lookup<'a>(
        &'a self,
        service: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Endpoint>, LookupError>>;
}

/// Statically configured service aliases, typically the last stage.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    aliases: HashMap<String, Vec<Endpoint>>,
}

impl AliasTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an alias mapping `service` to fixed endpoints.
    pub fn alias(mut self, service: impl Into<String>, endpoints: Vec<Endpoint>) -> Self {
        self.aliases.insert(service.into(), endpoints);
        self
    }

    /// The aliased endpoints for `service`, if configured.
    pub fn lookup(&self, service: &str) -> Option<&[Endpoint]> {
        self.aliases.get(service).map(Vec::as_slice)
    }

    /// Number of configured aliases.
    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    /// Returns true if no aliases are configured.
    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

/// Discriminant of a resolver stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Application registry, consulted through the local cache.
    Registry,
    /// Platform DNS or another external resolver.
    Dns,
    /// Statically configured aliases.
    StaticAlias,
}

/// A single stage of the resolution chain.
pub enum ResolverStage<C> {
    /// Application registry, consulted through the local cache.
    Registry(Arc<RegistryCache<C>>),
    /// Platform DNS or another external resolver.
    Dns(Arc<dyn NameResolver>),
    /// Statically configured aliases.
    StaticAlias(AliasTable),
}

impl<C> ResolverStage<C> {
    /// The stage's discriminant.
    pub fn kind(&self) -> StageKind {
        match self {
            ResolverStage::Registry(_) => StageKind::Registry,
            ResolverStage::Dns(_) => StageKind::Dns,
            ResolverStage::StaticAlias(_) => StageKind::StaticAlias,
        }
    }
}

enum StageOutcome {
    Found(Vec<Endpoint>),
    Miss,
    Failed(String),
}

impl<C> ResolverStage<C>
where
    C: RegistryClient + 'static,
{
    async fn evaluate(&self, service: &str) -> StageOutcome {
        match self {
            ResolverStage::Registry(cache) => match cache.get(service).await {
                CacheLookup::Hit { endpoints, .. } => StageOutcome::Found(endpoints),
                CacheLookup::Miss => StageOutcome::Miss,
                CacheLookup::Unavailable { reason } => StageOutcome::Failed(reason),
            },
            ResolverStage::Dns(resolver) => match resolver.lookup(service).await {
                Ok(endpoints) if !endpoints.is_empty() => StageOutcome::Found(endpoints),
                Ok(_) | Err(LookupError::NotFound) => StageOutcome::Miss,
                Err(LookupError::Unavailable(reason)) => StageOutcome::Failed(reason),
            },
            ResolverStage::StaticAlias(table) => match table.lookup(service) {
                Some(endpoints) if !endpoints.is_empty() => {
                    StageOutcome::Found(endpoints.to_vec())
                }
                _ => StageOutcome::Miss,
            },
        }
    }
}

/// Why a resolution produced no endpoint.
#[derive(Debug, Clone, Error)]
pub enum ResolutionFailure {
    /// At least one stage answered definitively, and no stage knows of a
    /// live instance.
    #[error("no instances of `{service}` in any resolver stage")]
    NoInstances {
        /// The unresolvable service.
        service: String,
    },

    /// Every consulted stage failed outright, so the answer is unknown
    /// rather than empty.
    #[error("all resolver stages errored for `{service}`: {last_error}")]
    AllStagesErrored {
        /// The unresolvable service.
        service: String,
        /// Reason from the last stage that failed.
        last_error: String,
    },
}

impl ResolutionFailure {
    /// Returns true when nothing is registered anywhere in the chain.
    pub fn is_no_instances(&self) -> bool {
        matches!(self, ResolutionFailure::NoInstances { .. })
    }
}

/// Type alias for custom endpoint selectors.
pub type CustomSelectorFn = Arc<dyn Fn(&str, &[Endpoint]) -> usize + Send + Sync>;

/// How one endpoint is chosen from a succeeding stage's set.
#[derive(Clone, Default)]
pub enum SelectionStrategy {
    /// Rotate through endpoints per service name.
    #[default]
    RoundRobin,

    /// Always pick the first endpoint. Best for primary/secondary setups.
    First,

    /// Pick a uniformly random endpoint.
    Random,

    /// Custom selector; the returned index is taken modulo the set size.
    Custom(CustomSelectorFn),
}

impl SelectionStrategy {
    fn select(
        &self,
        service: &str,
        endpoints: &[Endpoint],
        rotation: &Mutex<HashMap<String, usize>>,
    ) -> usize {
        match self {
            SelectionStrategy::RoundRobin => {
                let mut rotation = rotation.lock().unwrap();
                let counter = rotation.entry(service.to_string()).or_insert(0);
                let index = *counter % endpoints.len();
                *counter = counter.wrapping_add(1);
                index
            }
            SelectionStrategy::First => 0,
            SelectionStrategy::Random => {
                use rand::Rng;
                rand::rng().random_range(0..endpoints.len())
            }
            SelectionStrategy::Custom(f) => f(service, endpoints) % endpoints.len(),
        }
    }
}

/// Ordered sequence of strategies for turning a logical service name into
/// concrete addresses.
pub struct ResolutionChain<C> {
    stages: Vec<ResolverStage<C>>,
    fallthrough_on_error: bool,
    strategy: SelectionStrategy,
    // Per-service round-robin rotation state, owned by the chain.
    rotation: Mutex<HashMap<String, usize>>,
}

impl<C> ResolutionChain<C>
where
    C: RegistryClient + 'static,
{
    /// Creates a new chain builder.
    pub fn builder() -> ResolutionChainBuilder<C> {
        ResolutionChainBuilder::new()
    }

    /// The configured stage order.
    pub fn stage_kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(ResolverStage::kind).collect()
    }

    /// Resolves `service` to one endpoint, chosen by the selection strategy
    /// from the first succeeding stage's set.
    pub async fn resolve(&self, service: &str) -> Result<Endpoint, ResolutionFailure> {
        let endpoints = self.resolve_all(service).await?;
        let index = self.strategy.select(service, &endpoints, &self.rotation);
        Ok(endpoints[index].clone())
    }

    /// Resolves `service` to the full endpoint set of the first succeeding
    /// stage.
    pub async fn resolve_all(&self, service: &str) -> Result<Vec<Endpoint>, ResolutionFailure> {
        let mut saw_miss = false;
        let mut last_error: Option<String> = None;

        for stage in &self.stages {
            match stage.evaluate(service).await {
                StageOutcome::Found(endpoints) => return Ok(endpoints),
                StageOutcome::Miss => saw_miss = true,
                StageOutcome::Failed(reason) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        service,
                        stage = ?stage.kind(),
                        %reason,
                        fallthrough = self.fallthrough_on_error,
                        "resolver stage errored"
                    );

                    last_error = Some(reason);
                    if !self.fallthrough_on_error {
                        break;
                    }
                }
            }
        }

        match (saw_miss, last_error) {
            // No stage gave a definitive answer: the failure is transient.
            (false, Some(last_error)) => Err(ResolutionFailure::AllStagesErrored {
                service: service.to_string(),
                last_error,
            }),
            // At least one definitive empty answer: nothing is registered.
            _ => Err(ResolutionFailure::NoInstances {
                service: service.to_string(),
            }),
        }
    }
}

/// Builder for [`ResolutionChain`].
pub struct ResolutionChainBuilder<C> {
    stages: Vec<ResolverStage<C>>,
    fallthrough_on_error: bool,
    strategy: SelectionStrategy,
}

impl<C> Default for ResolutionChainBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ResolutionChainBuilder<C> {
    /// Creates a builder with no stages, fallthrough-on-error enabled, and
    /// round-robin selection.
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            fallthrough_on_error: true,
            strategy: SelectionStrategy::default(),
        }
    }

    /// Appends a registry-cache stage.
    pub fn registry(mut self, cache: Arc<RegistryCache<C>>) -> Self {
        self.stages.push(ResolverStage::Registry(cache));
        self
    }

    /// Appends a DNS stage.
    pub fn dns<R>(mut self, resolver: R) -> Self
    where
        R: NameResolver + 'static,
    {
        self.stages.push(ResolverStage::Dns(Arc::new(resolver)));
        self
    }

    /// Appends a static-alias stage.
    pub fn static_alias(mut self, table: AliasTable) -> Self {
        self.stages.push(ResolverStage::StaticAlias(table));
        self
    }

    /// Sets whether a stage error falls through to the next stage.
    ///
    /// Default: true. When false, a stage error aborts resolution with
    /// [`ResolutionFailure::AllStagesErrored`].
    pub fn fallthrough_on_error(mut self, fallthrough: bool) -> Self {
        self.fallthrough_on_error = fallthrough;
        self
    }

    /// Sets the endpoint selection strategy.
    pub fn selection_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Builds the chain, rejecting an empty stage list.
    pub fn build(self) -> Result<ResolutionChain<C>, ConfigError> {
        if self.stages.is_empty() {
            return Err(ConfigError::EmptyChain);
        }
        Ok(ResolutionChain {
            stages: self.stages,
            fallthrough_on_error: self.fallthrough_on_error,
            strategy: self.strategy,
            rotation: Mutex::new(HashMap::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::registry::RegistryError;

    struct EmptyRegistry;

    impl RegistryClient for EmptyRegistry {
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

    fn ep(host: &str) -> Endpoint {
        Endpoint::new(host, 80)
    }

    #[test]
    fn empty_chain_is_a_config_error() {
        let result = ResolutionChainBuilder::<EmptyRegistry>::new().build();
        assert!(matches!(result, Err(ConfigError::EmptyChain)));
    }

    #[tokio::test]
    async fn alias_stage_answers_after_registry_miss() {
        let cache = Arc::new(RegistryCache::new(
            EmptyRegistry,
            CacheConfig::builder().build(),
        ));
        let chain = ResolutionChain::builder()
            .registry(cache)
            .static_alias(AliasTable::new().alias("user-service", vec![ep("user-service.internal")]))
            .build()
            .unwrap();

        let endpoint = chain.resolve("user-service").await.unwrap();
        assert_eq!(endpoint, ep("user-service.internal"));
    }

    #[tokio::test]
    async fn round_robin_rotates_per_service() {
        let chain = ResolutionChainBuilder::<EmptyRegistry>::new()
            .static_alias(
                AliasTable::new().alias("user-service", vec![ep("a"), ep("b"), ep("c")]),
            )
            .build()
            .unwrap();

        let picks: Vec<String> = [
            chain.resolve("user-service").await.unwrap(),
            chain.resolve("user-service").await.unwrap(),
            chain.resolve("user-service").await.unwrap(),
            chain.resolve("user-service").await.unwrap(),
        ]
        .iter()
        .map(|e| e.host().to_string())
        .collect();

        assert_eq!(picks, vec!["a", "b", "c", "a"]);
    }

    #[tokio::test]
    async fn miss_everywhere_is_no_instances() {
        let chain = ResolutionChainBuilder::<EmptyRegistry>::new()
            .static_alias(AliasTable::new())
            .build()
            .unwrap();

        let failure = chain.resolve("ghost-service").await.unwrap_err();
        assert!(failure.is_no_instances());
    }
}
