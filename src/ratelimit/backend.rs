//! Admission trait consumed by the HTTP gateway.

use async_trait::async_trait;

use super::limiter::AllowResult;
use crate::error::Result;

/// Trait for admission decision implementations.
///
/// This lets the gateway work against the store-backed `RateLimiter` or any
/// other decision source, such as a stub in tests.
#[async_trait]
pub trait AdmissionBackend: Send + Sync {
    /// Decide whether a request from `ip` carrying `token` may proceed.
    async fn check(&self, ip: &str, token: &str) -> Result<AllowResult>;
}
