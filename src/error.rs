//! Error taxonomy of the locator.
//!
//! Intermediate components return typed outcomes ([`crate::CacheLookup`],
//! [`crate::ResolutionFailure`], [`crate::BreakerOpen`]); only the façade
//! surfaces a terminal [`LocatorError`] to callers. Configuration mistakes
//! are rejected at startup with [`ConfigError`] and can never appear at
//! call time.

use crate::endpoint::Endpoint;
use thiserror::Error;

/// Invalid locator configuration, rejected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The resolution chain has no stages.
    #[error("resolver chain has no stages")]
    EmptyChain,

    /// The retry policy allows zero attempts.
    #[error("retry max_attempts must be at least 1")]
    ZeroAttempts,

    /// The breaker would open before any failure.
    #[error("breaker failure_threshold must be at least 1")]
    ZeroFailureThreshold,
}

/// Failure of one call attempt, as fed back into the retry loop.
#[derive(Debug, Error)]
pub enum AttemptFailure<E> {
    /// The transport call exceeded the request deadline.
    #[error("request deadline exceeded")]
    DeadlineExceeded,

    /// The transport returned an error.
    #[error("transport error: {0}")]
    Transport(E),

    /// The attempt was short-circuited by an open circuit.
    #[error("circuit open for endpoint {0}")]
    BreakerOpen(Endpoint),

    /// Resolution failed transiently (all stages errored).
    #[error("resolution failed: {0}")]
    Resolution(String),
}

/// Terminal error returned by [`crate::Locator::call`].
#[derive(Debug, Error)]
pub enum LocatorError<E> {
    /// Nothing is registered anywhere in the chain. The operation was never
    /// invoked, and the call was not retried: retrying resolution without
    /// new information is futile.
    #[error("no instances available for `{service}`")]
    NoInstances {
        /// The unresolvable service.
        service: String,
    },

    /// Endpoints were resolved, but every attempt was short-circuited by an
    /// open circuit; the operation was never invoked.
    #[error("all resolved endpoints for `{service}` are unavailable")]
    AllEndpointsUnavailable {
        /// The affected service.
        service: String,
    },

    /// The attempt budget was spent without a success.
    #[error("retries exhausted for `{service}` after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        /// The affected service.
        service: String,
        /// Total attempts made.
        attempts: usize,
        /// Failure of the final attempt.
        last: AttemptFailure<E>,
    },
}

impl<E> LocatorError<E> {
    /// Returns true if nothing is registered for the service.
    pub fn is_no_instances(&self) -> bool {
        matches!(self, LocatorError::NoInstances { .. })
    }

    /// Returns true if every attempt was short-circuited.
    pub fn is_all_endpoints_unavailable(&self) -> bool {
        matches!(self, LocatorError::AllEndpointsUnavailable { .. })
    }

    /// Returns true if the attempt budget was exhausted.
    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, LocatorError::RetriesExhausted { .. })
    }

    /// The transport error of the final attempt, if there was one.
    pub fn into_transport_error(self) -> Option<E> {
        match self {
            LocatorError::RetriesExhausted {
                last: AttemptFailure::Transport(err),
                ..
            } => Some(err),
            _ => None,
        }
    }
}
