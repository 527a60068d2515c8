//! Upstream endpoint management: per-endpoint circuit breakers, the shared HTTP client, the
//! source registry and the failover loop.
//!
//! # Request Path
//!
//! ```text
//! SourceRegistry::resolve_endpoints(source)
//!        │   active endpoints, breaker not open, ascending priority
//!        ▼
//! FailoverExecutor::execute
//!        │   per endpoint: try_admit? → send → classify
//!        │   transient failure → backoff + retry (≤ retry_count) → next endpoint
//!        │   challenge page    → one retry with HeaderProfile::Alternate
//!        ▼
//! FailoverSuccess { response, endpoint_id, position }  |  FailoverExhausted
//! ```
//!
//! Breaker state lives on each [`UpstreamEndpoint`], so failures on one endpoint never contend
//! with traffic to another.

pub mod circuit_breaker;
pub mod endpoint;
pub mod errors;
pub mod failover;
pub mod http_client;
pub mod registry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot, CircuitBreakerState};
pub use endpoint::{HeaderProfile, UpstreamCall, UpstreamEndpoint};
pub use errors::UpstreamError;
pub use failover::{
    AttemptRecord, FailoverExecutor, FailoverExhausted, FailoverOptions, FailoverSuccess,
    RetryPolicy,
};
pub use http_client::{HttpClient, HttpClientConfig};
pub use registry::{
    EndpointBreaker, NewEndpoint, NewSource, RegistryError, SourceRegistry, SourceUpdate,
    SourceView,
};
