//! HTTP surface of the Relay gateway: route handlers, error mapping, audit logging and
//! transport middleware around [`relay_core`].

pub mod api;
pub mod middleware;
pub mod router;
