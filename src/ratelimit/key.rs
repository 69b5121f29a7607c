//! Counter key generation.

use std::fmt;

/// A key that scopes a counter and its block marker in the store.
///
/// IP and token identities live in separate namespaces, so a client's IP
/// counter can never collide with a token counter of the same text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CounterKey {
    /// Counter for a client IP address
    Ip(String),
    /// Counter for an API token
    Token(String),
}

impl CounterKey {
    pub fn ip(addr: impl Into<String>) -> Self {
        CounterKey::Ip(addr.into())
    }

    pub fn token(value: impl Into<String>) -> Self {
        CounterKey::Token(value.into())
    }

    /// Convert the key to the string used by store backends.
    pub fn to_string_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterKey::Ip(addr) => write!(f, "ip:{}", addr),
            CounterKey::Token(value) => write!(f, "token:{}", value),
        }
    }
}
