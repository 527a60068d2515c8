//! Integration tests for the Relay gateway.
//!
//! Every test runs a real [`relay_core::runtime::RelayRuntime`] against mocked upstream APIs
//! served by `mockito`, so no network access is needed:
//!
//! - `cache_tests`: cache keys, hit accounting, TTL handling and policy caps
//! - `failover_tests`: endpoint priority, circuit breakers, stale and mock fallbacks
//! - `governance_tests`: rate limits and kill switches
//! - `pool_tests`: shared storage pools, membership changes and pool deletion
//! - `http_tests`: full flows through the HTTP router
//! - `mock_infrastructure`: upstream mocks and runtime fixtures shared by the above
//!
//! ```bash
//! cargo test --package tests
//! ```

#[cfg(test)]
mod cache_tests;

#[cfg(test)]
mod failover_tests;

#[cfg(test)]
mod governance_tests;

#[cfg(test)]
mod http_tests;

#[cfg(test)]
mod pool_tests;

pub mod mock_infrastructure;
