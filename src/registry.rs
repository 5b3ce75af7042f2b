//! Consumed interface of the remote service registry.
//!
//! The registry server itself is an external collaborator. This crate only
//! defines the client-side contract it depends on; production code supplies
//! an implementation speaking the registry's actual wire protocol, tests
//! supply stubs.

use crate::endpoint::Endpoint;
use std::future::Future;
use thiserror::Error;

/// Errors surfaced by a remote registry client.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// The registry explicitly reports that the service or lease is unknown.
    ///
    /// This is a definitive answer, not a transport failure: resolution
    /// treats it as an empty instance set.
    #[error("registry reports no such service or lease")]
    NotFound,

    /// The registry could not be reached, timed out, or answered with a
    /// transport-level error.
    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

impl RegistryError {
    /// Returns true if the registry answered definitively that the name or
    /// lease does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound)
    }
}

/// Client for a remote service registry.
///
/// All methods take a deadline from the caller side: the cache and lease
/// manager wrap every call in a request timeout, so implementations may
/// block on the network without further bounding.
///
/// # Examples
///
/// ```rust
/// use tower_locator::{Endpoint, RegistryClient, RegistryError};
///
/// struct FixedRegistry;
///
/// impl RegistryClient for FixedRegistry {
///     async fn fetch_instances(&self, service: &str) -> Result<Vec<Endpoint>, RegistryError> {
///         match service {
///             "user-service" => Ok(vec![Endpoint::new("10.0.0.7", 8080)]),
///             _ => Err(RegistryError::NotFound),
///         }
///     }
///
///     async fn register(&self, _: &str, _: &Endpoint) -> Result<(), RegistryError> {
///         Ok(())
///     }
///
///     async fn heartbeat(&self, _: &str, _: &Endpoint) -> Result<(), RegistryError> {
///         Ok(())
///     }
///
///     async fn deregister(&self, _: &str, _: &Endpoint) -> Result<(), RegistryError> {
///         Ok(())
///     }
/// }
/// ```
pub trait RegistryClient: Send + Sync {
    /// Fetches the currently registered instances of `service`.
    ///
    /// `Ok(vec![])` and `Err(NotFound)` both mean the registry definitively
    /// knows of no instances; `Err(Unavailable)` means the answer is unknown.
    fn fetch_instances(
        &self,
        service: &str,
    ) -> impl Future<Output = Result<Vec<Endpoint>, RegistryError>> + Send;

    /// Registers `endpoint` as an instance of `service`.
    fn register(
        &self,
        service: &str,
        endpoint: &Endpoint,
    ) -> impl Future<Output = Result<(), RegistryError>> + Send;

    /// Renews the lease for a previously registered instance.
    ///
    /// `Err(NotFound)` means the registry has evicted the lease.
    fn heartbeat(
        &self,
        service: &str,
        endpoint: &Endpoint,
    ) -> impl Future<Output = Result<(), RegistryError>> + Send;

    /// Removes a previously registered instance. Best-effort.
    fn deregister(
        &self,
        service: &str,
        endpoint: &Endpoint,
    ) -> impl Future<Output = Result<(), RegistryError>> + Send;
}
