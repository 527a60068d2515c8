//! HTTP-level middleware. Request gating (validation, kill switch, rate limiting) happens in
//! `relay_core::middleware` inside the fetch pipeline; this module only deals with transport
//! concerns.

pub mod correlation_id;

pub use correlation_id::{
    create_request_id_layers, request_span, CorrelationId, UuidRequestIdGenerator, X_REQUEST_ID,
};
