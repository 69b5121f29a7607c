//! Policy resolution: which key and rule apply to a request identity.

use std::time::Duration;
use tracing::trace;

use super::key::CounterKey;
use super::rules::{Mode, RateRule, TokenRules};

/// Immutable policy configuration, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Fallback behaviour when no token rule matches
    pub mode: Mode,
    /// Rule applied to IP identities
    pub default_rule: RateRule,
    /// Per-token rules, which always take precedence
    pub token_rules: TokenRules,
}

impl PolicyConfig {
    pub fn new(mode: Mode, default_rule: RateRule, token_rules: TokenRules) -> Self {
        Self {
            mode,
            default_rule,
            token_rules,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            default_rule: RateRule::from_secs(10, 1, 300),
            token_rules: TokenRules::new(),
        }
    }
}

/// The resolved key and rule to evaluate for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub key: CounterKey,
    pub limit: u64,
    pub window: Duration,
    pub block_duration: Duration,
}

impl Policy {
    fn new(key: CounterKey, rule: RateRule) -> Self {
        Self {
            key,
            limit: rule.limit,
            window: rule.window,
            block_duration: rule.block_duration,
        }
    }
}

/// Maps a request identity to the policy that governs it.
///
/// Resolution is total: every `(ip, token)` pair, including empty strings,
/// resolves to a policy.
#[derive(Debug, Clone, Default)]
pub struct PolicyResolver {
    config: PolicyConfig,
}

impl PolicyResolver {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    /// Resolve the policy for a request carrying `ip` and `token`.
    pub fn resolve(&self, ip: &str, token: &str) -> Policy {
        if !token.is_empty() {
            if let Some(rule) = self.config.token_rules.get(token) {
                trace!(token = %token, "Resolved token rule");
                return Policy::new(CounterKey::token(token), *rule);
            }
        }

        let default = self.config.default_rule;
        match self.config.mode {
            // Without a recognized token, token-only mode denies outright.
            Mode::Token => Policy::new(CounterKey::ip(ip), RateRule { limit: 0, ..default }),
            Mode::Ip | Mode::Both => Policy::new(CounterKey::ip(ip), default),
        }
    }
}
