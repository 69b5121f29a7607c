//! HTTP admission gateway.

mod middleware;
mod server;

pub use middleware::{admission_middleware, api_token, client_ip, AdmissionState, RATE_LIMITED_MESSAGE};
pub use server::{router, HttpServer};
