//! Rate rules and the token rule table.
//!
//! Token rules are supplied as a single delimited string of the form
//! `token:limit:window:block[,token2:limit:window:block...]`, where window and
//! block are whole seconds. Malformed numeric fields fall back to per-field
//! defaults instead of failing the whole table.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Window applied to a token rule whose window field is missing or malformed.
pub const DEFAULT_TOKEN_WINDOW_SECS: u64 = 1;
/// Block duration applied to a token rule whose block field is missing or malformed.
pub const DEFAULT_TOKEN_BLOCK_SECS: u64 = 300;
/// Upper bound for rule windows and block durations.
pub const MAX_RULE_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Which identity is limited when no token rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Limit by client IP address.
    Ip,
    /// Only recognized tokens may pass; everything else is denied.
    Token,
    /// Recognized tokens use their own rule, everything else is limited by IP.
    #[default]
    Both,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Ip => "ip",
            Mode::Token => "token",
            Mode::Both => "both",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A limit, the fixed window it is counted over, and the cool-down applied
/// once it is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRule {
    /// Requests allowed per window. Zero denies on first contact.
    pub limit: u64,
    /// Length of the counting window
    pub window: Duration,
    /// How long an identity stays blocked after exceeding the limit
    pub block_duration: Duration,
}

impl RateRule {
    pub fn new(limit: u64, window: Duration, block_duration: Duration) -> Self {
        Self {
            limit,
            window,
            block_duration,
        }
    }

    /// Build a rule from whole seconds, capping both durations at
    /// [`MAX_RULE_SECS`].
    pub fn from_secs(limit: u64, window_secs: u64, block_secs: u64) -> Self {
        Self::new(
            limit,
            Duration::from_secs(window_secs.min(MAX_RULE_SECS)),
            Duration::from_secs(block_secs.min(MAX_RULE_SECS)),
        )
    }
}

/// Immutable mapping from API token to its rate rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenRules {
    rules: HashMap<String, RateRule>,
}

impl TokenRules {
    /// Create an empty rule table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the delimited `token:limit:window:block` format.
    ///
    /// Entries with fewer than two fields are skipped. A later entry for the
    /// same token replaces an earlier one.
    pub fn parse(raw: &str) -> Self {
        let mut rules = HashMap::new();

        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let fields: Vec<&str> = entry.split(':').collect();
            if fields.len() < 2 {
                warn!(entry = %entry, "Skipping token rule without a limit field");
                continue;
            }

            let token = fields[0].trim();
            let limit = parse_field(entry, "limit", fields.get(1), 0);
            let window = parse_field(entry, "window", fields.get(2), DEFAULT_TOKEN_WINDOW_SECS);
            let block = parse_field(entry, "block", fields.get(3), DEFAULT_TOKEN_BLOCK_SECS);

            // A zero-length window could never elapse.
            let window = if window == 0 {
                DEFAULT_TOKEN_WINDOW_SECS
            } else {
                window
            };

            debug!(
                token = %token,
                limit = limit,
                window_secs = window,
                block_secs = block,
                "Loaded token rule"
            );
            rules.insert(token.to_string(), RateRule::from_secs(limit, window, block));
        }

        Self { rules }
    }

    /// Look up the rule for a token.
    pub fn get(&self, token: &str) -> Option<&RateRule> {
        self.rules.get(token)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn parse_field(entry: &str, name: &str, field: Option<&&str>, default: u64) -> u64 {
    match field {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(
                entry = %entry,
                field = name,
                value = %raw,
                default = default,
                "Malformed token rule field, using default"
            );
            default
        }),
    }
}
