//! Timeout wrapper for check clients.
//!
//! Both check backends are wrapped in a [`TimeoutClient`] so that a slow
//! authorization service always surfaces as [`CheckError::Timeout`] instead
//! of stalling the stream indefinitely.

use async_trait::async_trait;
use std::time::Duration;

use crate::check::{CheckClient, CheckError, CheckRequest, CheckResponse};

/// Default per-call timeout when none is configured.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_millis(200);

/// Timeout configuration for a check client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Deadline for one check call, from dispatch to decoded reply
    pub call_timeout: Duration,
}

impl TimeoutConfig {
    /// Create a new timeout configuration.
    pub fn new(call_timeout: Duration) -> Self {
        Self { call_timeout }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CHECK_TIMEOUT)
    }
}

/// Wrapper that enforces a per-call deadline on an inner client.
///
/// The inner future is dropped when the deadline elapses, so inner clients
/// must be cancel-safe (the provided backends are).
pub struct TimeoutClient<C> {
    inner: C,
    config: TimeoutConfig,
}

impl<C> TimeoutClient<C> {
    /// Wrap `inner` with the given deadline.
    pub fn new(inner: C, config: TimeoutConfig) -> Self {
        Self { inner, config }
    }

    /// Get a reference to the timeout configuration.
    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    /// Get a reference to the wrapped client.
    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C> CheckClient for TimeoutClient<C>
where
    C: CheckClient,
{
    async fn check(&self, request: CheckRequest) -> Result<CheckResponse, CheckError> {
        let timeout = self.config.call_timeout;
        match tokio::time::timeout(timeout, self.inner.check(request)).await {
            Ok(result) => result,
            Err(_) => Err(CheckError::Timeout { timeout }),
        }
    }
}
