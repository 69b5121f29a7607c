//! Rate limiting logic: policy resolution and the admission decision.

mod backend;
mod key;
mod limiter;
mod resolver;
mod rules;

pub use backend::AdmissionBackend;
pub use key::CounterKey;
pub use limiter::{AllowResult, RateLimiter};
pub use resolver::{Policy, PolicyConfig, PolicyResolver};
pub use rules::{
    Mode, RateRule, TokenRules, DEFAULT_TOKEN_BLOCK_SECS, DEFAULT_TOKEN_WINDOW_SECS, MAX_RULE_SECS,
};
