//! HTTP API for the gateway: the fetch endpoint plus cache, source, pool, policy, rate limit
//! and kill switch administration.
//!
//! Authentication is handled in front of this service; every route here assumes an already
//! authorised caller.

pub mod audit;
pub mod error;
pub mod handlers;

use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Instant};

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::request::Parts,
};
use relay_core::{config::AppConfig, runtime::RelayComponents};

pub use error::ApiError;

/// Shared state for every handler.
#[derive(Clone)]
pub struct ApiState {
    pub components: RelayComponents,
    pub config: Arc<AppConfig>,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
    /// Application version from `Cargo.toml`.
    pub version: &'static str,
}

impl ApiState {
    #[must_use]
    pub fn new(components: RelayComponents, config: Arc<AppConfig>) -> Self {
        Self {
            components,
            config,
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Peer address of the caller, when the server was started with connect info.
///
/// Never rejects: in-process callers such as tests simply have no address.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub Option<SocketAddr>);

impl<S> FromRequestParts<S> for ClientAddr
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(parts.extensions.get::<ConnectInfo<SocketAddr>>().map(|info| info.0)))
    }
}
