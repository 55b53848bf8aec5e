//! Provider API client module
//!
//! HTTP client for the source-control provider's runner endpoints, with
//! automatic retry, a client-side token-bucket rate limiter, and
//! secret-safe registration tokens.

mod client;
mod errors;
mod rate_limit;
mod types;

pub use client::{HttpProviderClient, ProviderClient};
pub use errors::{ProviderError, ProviderResult};
pub use rate_limit::{NoopHooks, PolicyHooks, RateLimiter};
pub use types::{ProviderRunner, ProviderRunnerStatus, RegistrationToken};
