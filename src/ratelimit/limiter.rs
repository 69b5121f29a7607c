//! Admission decision engine.
//!
//! Each check resolves the policy for the identity, consults the store's block
//! marker, and only then counts the request. Nothing is cached locally: every
//! check reads fresh store state, since several gateways may share one store.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::backend::AdmissionBackend;
use super::resolver::{Policy, PolicyConfig, PolicyResolver};
use crate::error::Result;
use crate::store::Store;

/// The outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllowResult {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Whether the identity is (now) in its cool-down period
    pub blocked: bool,
    /// Counter value after this request, zero when the counter was not touched
    pub count: u64,
    /// The limit that applied to this request
    pub limit: u64,
    /// Remaining cool-down. For a block set by this check this is the
    /// intended duration, not a value read back from the store.
    pub block_remaining: Duration,
}

impl AllowResult {
    fn allowed(count: u64, limit: u64) -> Self {
        Self {
            allowed: true,
            blocked: false,
            count,
            limit,
            block_remaining: Duration::ZERO,
        }
    }

    fn denied(count: u64, limit: u64, block_remaining: Duration) -> Self {
        Self {
            allowed: false,
            blocked: true,
            count,
            limit,
            block_remaining,
        }
    }

    /// Requests left in the current window, zero once denied.
    pub fn remaining(&self) -> u64 {
        if self.allowed {
            self.limit.saturating_sub(self.count)
        } else {
            0
        }
    }
}

/// The store-backed rate limiter.
///
/// Holds only immutable configuration and a shared store handle, so one
/// instance can serve any number of concurrent checks without locking.
#[derive(Clone)]
pub struct RateLimiter {
    resolver: PolicyResolver,
    store: Arc<dyn Store>,
}

impl RateLimiter {
    /// Create a new rate limiter over `store` with an immutable policy.
    pub fn new(config: PolicyConfig, store: Arc<dyn Store>) -> Self {
        Self {
            resolver: PolicyResolver::new(config),
            store,
        }
    }

    /// Decide whether a request from `ip` carrying `token` may proceed.
    ///
    /// Store errors from the block query or the increment are returned to the
    /// caller. A failure to record a block is logged and the deny stands.
    pub async fn check(&self, ip: &str, token: &str) -> Result<AllowResult> {
        let policy = self.resolver.resolve(ip, token);
        let key = policy.key.to_string_key();

        trace!(
            key = %key,
            limit = policy.limit,
            window = ?policy.window,
            "Checking admission"
        );

        let status = self.store.is_blocked(&key).await?;
        if status.blocked {
            trace!(key = %key, remaining = ?status.remaining, "Identity is blocked");
            return Ok(AllowResult::denied(0, policy.limit, status.remaining));
        }

        if policy.limit == 0 {
            debug!(key = %key, "Zero limit, denying on first contact");
            self.block(&key, &policy).await;
            return Ok(AllowResult::denied(0, 0, policy.block_duration));
        }

        let count = self.store.increment(&key, policy.window).await?;
        if count > policy.limit {
            debug!(
                key = %key,
                count = count,
                limit = policy.limit,
                block = ?policy.block_duration,
                "Rate limit exceeded, blocking"
            );
            self.block(&key, &policy).await;
            return Ok(AllowResult::denied(count, policy.limit, policy.block_duration));
        }

        Ok(AllowResult::allowed(count, policy.limit))
    }

    async fn block(&self, key: &str, policy: &Policy) {
        if let Err(e) = self.store.set_blocked(key, policy.block_duration).await {
            warn!(key = %key, error = %e, "Failed to record block, denying anyway");
        }
    }
}

#[async_trait]
impl AdmissionBackend for RateLimiter {
    async fn check(&self, ip: &str, token: &str) -> Result<AllowResult> {
        RateLimiter::check(self, ip, token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatekeeperError;
    use crate::ratelimit::rules::{Mode, RateRule, TokenRules};
    use crate::store::{BlockStatus, MemoryStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn limiter(
        mode: Mode,
        limit: u64,
        window_secs: u64,
        block_secs: u64,
        tokens: &str,
    ) -> (RateLimiter, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = PolicyConfig::new(
            mode,
            RateRule::from_secs(limit, window_secs, block_secs),
            TokenRules::parse(tokens),
        );
        (RateLimiter::new(config, store.clone()), store)
    }

    /// A store whose operations can be made to fail individually.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_is_blocked: bool,
        fail_increment: bool,
        fail_set_blocked: bool,
        set_blocked_calls: AtomicUsize,
    }

    fn unavailable() -> GatekeeperError {
        GatekeeperError::Store("store unavailable".to_string())
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn increment(&self, key: &str, window: Duration) -> Result<u64> {
            if self.fail_increment {
                return Err(unavailable());
            }
            self.inner.increment(key, window).await
        }

        async fn set_blocked(&self, key: &str, duration: Duration) -> Result<()> {
            self.set_blocked_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_set_blocked {
                return Err(unavailable());
            }
            self.inner.set_blocked(key, duration).await
        }

        async fn is_blocked(&self, key: &str) -> Result<BlockStatus> {
            if self.fail_is_blocked {
                return Err(unavailable());
            }
            self.inner.is_blocked(key).await
        }
    }

    #[tokio::test]
    async fn test_ip_limit_then_block() {
        let (limiter, store) = limiter(Mode::Ip, 2, 10, 5, "");
        let ip = "1.2.3.4";

        for i in 1..=2 {
            let result = limiter.check(ip, "").await.unwrap();
            assert!(result.allowed, "request {} should be allowed", i);
            assert!(!result.blocked);
            assert_eq!(result.count, i);
            assert_eq!(result.limit, 2);
        }

        let third = limiter.check(ip, "").await.unwrap();
        assert!(!third.allowed);
        assert!(third.blocked);
        assert_eq!(third.count, 3);
        assert_eq!(third.block_remaining, Duration::from_secs(5));

        // Still blocked, and the counter is left alone.
        let fourth = limiter.check(ip, "").await.unwrap();
        assert!(!fourth.allowed);
        assert!(fourth.blocked);
        assert_eq!(fourth.count, 0);
        assert_eq!(store.current_count("ip:1.2.3.4"), Some(3));
    }

    #[tokio::test]
    async fn test_token_overrides_ip_limit() {
        let (limiter, _store) = limiter(Mode::Both, 1, 10, 5, "tok1:3:10:5");

        for i in 1..=3 {
            let ip = format!("9.9.9.{}", i);
            let result = limiter.check(&ip, "tok1").await.unwrap();
            assert!(result.allowed, "token request {} should be allowed", i);
            assert_eq!(result.limit, 3);
        }

        let fourth = limiter.check("1.1.1.1", "tok1").await.unwrap();
        assert!(!fourth.allowed);
        assert!(fourth.blocked);
        assert_eq!(fourth.count, 4);
    }

    #[tokio::test]
    async fn test_token_override_holds_in_every_mode() {
        for mode in [Mode::Ip, Mode::Token, Mode::Both] {
            let (limiter, _store) = limiter(mode, 1, 10, 5, "tok1:3:10:5");
            for _ in 0..3 {
                assert!(limiter.check("5.5.5.5", "tok1").await.unwrap().allowed, "mode {}", mode);
            }
            assert!(!limiter.check("5.5.5.5", "tok1").await.unwrap().allowed);
        }
    }

    #[tokio::test]
    async fn test_token_block_does_not_affect_ip_counter() {
        let (limiter, store) = limiter(Mode::Both, 5, 10, 5, "tok1:1:10:5");

        assert!(limiter.check("2.2.2.2", "tok1").await.unwrap().allowed);
        assert!(!limiter.check("2.2.2.2", "tok1").await.unwrap().allowed);

        // Same client without the token is counted under its IP.
        assert!(limiter.check("2.2.2.2", "").await.unwrap().allowed);
        assert_eq!(store.current_count("ip:2.2.2.2"), Some(1));
    }

    #[tokio::test]
    async fn test_token_mode_without_token_is_denied_immediately() {
        let (limiter, store) = limiter(Mode::Token, 10, 1, 5, "");

        let result = limiter.check("8.8.8.8", "").await.unwrap();
        assert!(!result.allowed);
        assert!(result.blocked);
        assert_eq!(result.count, 0);
        assert_eq!(result.limit, 0);
        assert_eq!(result.block_remaining, Duration::from_secs(5));

        // Blocked without ever being counted.
        assert_eq!(store.current_count("ip:8.8.8.8"), None);
        assert!(store.is_blocked("ip:8.8.8.8").await.unwrap().blocked);
    }

    #[tokio::test]
    async fn test_configured_zero_limit_denies() {
        let (limiter, _store) = limiter(Mode::Both, 10, 1, 5, "frozen:0:10:30");

        let result = limiter.check("3.3.3.3", "frozen").await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.count, 0);
        assert_eq!(result.block_remaining, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_period_does_not_inflate_counter() {
        let (limiter, _store) = limiter(Mode::Ip, 2, 10, 5, "");
        let ip = "4.4.4.4";

        limiter.check(ip, "").await.unwrap();
        limiter.check(ip, "").await.unwrap();
        assert!(!limiter.check(ip, "").await.unwrap().allowed);

        for _ in 0..10 {
            assert!(limiter.check(ip, "").await.unwrap().blocked);
        }

        // Block expired but the window has not: the counter still reads 3.
        tokio::time::advance(Duration::from_secs(6)).await;
        let result = limiter.check(ip, "").await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.count, 4);

        // Once the window rolls over the count starts fresh.
        tokio::time::advance(Duration::from_secs(10)).await;
        let result = limiter.check(ip, "").await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_after_block_and_window_expire() {
        let (limiter, _store) = limiter(Mode::Ip, 1, 1, 3, "");
        let ip = "6.6.6.6";

        assert!(limiter.check(ip, "").await.unwrap().allowed);
        let denied = limiter.check(ip, "").await.unwrap();
        assert!(denied.blocked);

        tokio::time::advance(Duration::from_secs(2)).await;
        let still = limiter.check(ip, "").await.unwrap();
        assert!(still.blocked);
        assert_eq!(still.block_remaining, Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        let result = limiter.check(ip, "").await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.count, 1);
    }

    #[tokio::test]
    async fn test_huge_token_window_is_counted() {
        let (limiter, store) = limiter(Mode::Both, 10, 1, 5, "big:5:18446744073709551615:300");

        let result = limiter.check("1.1.1.1", "big").await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.count, 1);
        assert_eq!(store.current_count("token:big"), Some(1));
    }

    #[tokio::test]
    async fn test_huge_token_block_is_held() {
        let (limiter, _store) = limiter(Mode::Both, 10, 1, 5, "big:0:1:18446744073709551615");

        let first = limiter.check("1.1.1.1", "big").await.unwrap();
        assert!(!first.allowed);
        assert!(first.blocked);

        let second = limiter.check("1.1.1.1", "big").await.unwrap();
        assert!(second.blocked);
        assert!(second.block_remaining > Duration::from_secs(365 * 24 * 60 * 60));
    }

    #[tokio::test]
    async fn test_is_blocked_error_is_propagated() {
        let store = Arc::new(FlakyStore {
            fail_is_blocked: true,
            ..Default::default()
        });
        let limiter = RateLimiter::new(PolicyConfig::default(), store);

        let err = limiter.check("1.1.1.1", "").await.unwrap_err();
        assert!(matches!(err, GatekeeperError::Store(_)));
    }

    #[tokio::test]
    async fn test_increment_error_is_propagated() {
        let store = Arc::new(FlakyStore {
            fail_increment: true,
            ..Default::default()
        });
        let limiter = RateLimiter::new(PolicyConfig::default(), store.clone());

        assert!(limiter.check("1.1.1.1", "").await.is_err());
        assert_eq!(store.set_blocked_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_set_blocked_failure_keeps_deny() {
        let store = Arc::new(FlakyStore {
            fail_set_blocked: true,
            ..Default::default()
        });
        let config = PolicyConfig::new(
            Mode::Ip,
            RateRule::from_secs(1, 10, 5),
            TokenRules::new(),
        );
        let limiter = RateLimiter::new(config, store.clone());

        assert!(limiter.check("1.1.1.1", "").await.unwrap().allowed);
        let result = limiter.check("1.1.1.1", "").await.unwrap();
        assert!(!result.allowed);
        assert!(result.blocked);
        assert_eq!(store.set_blocked_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_set_blocked_failure_on_zero_limit_keeps_deny() {
        let store = Arc::new(FlakyStore {
            fail_set_blocked: true,
            ..Default::default()
        });
        let config = PolicyConfig::new(Mode::Token, RateRule::from_secs(10, 1, 5), TokenRules::new());
        let limiter = RateLimiter::new(config, store);

        let result = limiter.check("1.1.1.1", "").await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.block_remaining, Duration::from_secs(5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_allow_exactly_limit() {
        let (limiter, _store) = limiter(Mode::Ip, 50, 60, 60, "");
        let limiter = Arc::new(limiter);

        let mut handles = Vec::new();
        for _ in 0..200 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.check("7.7.7.7", "").await.unwrap().allowed
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 50);
    }

    #[test]
    fn test_remaining() {
        assert_eq!(AllowResult::allowed(3, 10).remaining(), 7);
        assert_eq!(AllowResult::denied(11, 10, Duration::from_secs(1)).remaining(), 0);
    }
}
