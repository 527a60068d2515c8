//! Audit logging for admin mutations and core gateway events.
//!
//! Every record goes to the `audit` tracing target so that it can be routed to durable
//! storage independently of the application log.

use relay_core::events::{EventBus, GatewayEvent};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Audit record for one admin mutation.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// RFC 3339 timestamp of the operation
    pub timestamp: String,
    pub operation: AuditOperation,
    /// Resource type being modified (`source`, `storage_pool`, `rate_limit`, ...)
    pub resource_type: &'static str,
    pub resource_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOperation {
    Create,
    Update,
    Delete,
    /// Bulk removal of cache entries.
    Purge,
}

impl AuditEvent {
    #[must_use]
    pub fn new(
        operation: AuditOperation,
        resource_type: &'static str,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            operation,
            resource_type,
            resource_id: resource_id.into(),
            client_ip: None,
            success: true,
            details: None,
        }
    }

    #[must_use]
    pub fn with_client_ip(mut self, addr: Option<SocketAddr>) -> Self {
        self.client_ip = addr.map(|a| a.ip().to_string());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn log(self) {
        info!(
            target: "audit",
            timestamp = %self.timestamp,
            operation = ?self.operation,
            resource_type = self.resource_type,
            resource_id = %self.resource_id,
            client_ip = ?self.client_ip,
            success = self.success,
            details = ?self.details,
            "admin_api_audit"
        );
    }
}

pub fn log_create(
    resource_type: &'static str,
    resource_id: impl Into<String>,
    client_ip: Option<SocketAddr>,
) {
    AuditEvent::new(AuditOperation::Create, resource_type, resource_id)
        .with_client_ip(client_ip)
        .log();
}

pub fn log_update(
    resource_type: &'static str,
    resource_id: impl Into<String>,
    client_ip: Option<SocketAddr>,
    details: Option<serde_json::Value>,
) {
    let mut event = AuditEvent::new(AuditOperation::Update, resource_type, resource_id)
        .with_client_ip(client_ip);
    if let Some(d) = details {
        event = event.with_details(d);
    }
    event.log();
}

pub fn log_delete(
    resource_type: &'static str,
    resource_id: impl Into<String>,
    client_ip: Option<SocketAddr>,
) {
    AuditEvent::new(AuditOperation::Delete, resource_type, resource_id)
        .with_client_ip(client_ip)
        .log();
}

pub fn log_purge(
    resource_type: &'static str,
    resource_id: impl Into<String>,
    client_ip: Option<SocketAddr>,
    removed: usize,
) {
    AuditEvent::new(AuditOperation::Purge, resource_type, resource_id)
        .with_client_ip(client_ip)
        .with_details(serde_json::json!({ "removed": removed }))
        .log();
}

/// Forwards core [`GatewayEvent`]s to the `audit` target until shutdown.
pub fn spawn_event_forwarder(
    events: &EventBus,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                received = rx.recv() => match received {
                    Ok(event) => log_gateway_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target: "audit", skipped, "audit forwarder lagged, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("audit event forwarder stopped");
    })
}

fn log_gateway_event(event: &GatewayEvent) {
    match serde_json::to_value(event) {
        Ok(details) => info!(target: "audit", details = %details, "gateway_event"),
        Err(e) => warn!(target: "audit", error = %e, "failed to serialize gateway event"),
    }
}
