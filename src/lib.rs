//! Gatekeeper - Request Admission Control
//!
//! This crate decides whether a request may proceed based on its client
//! identity (IP address or API token). Each identity is counted in a fixed
//! window held by a shared store, and an identity that exceeds its limit is
//! blocked for a cool-down period.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
