//! Core component container for the Relay runtime.

use crate::{
    cache::{CacheStore, PolicyEnforcer, StoragePoolManager},
    events::EventBus,
    metrics::MetricsCollector,
    middleware::{KillSwitch, RateLimiter},
    proxy::RequestOrchestrator,
    upstream::SourceRegistry,
};
use std::sync::Arc;

/// Container for all initialized Relay core components.
///
/// The orchestrator owns the shared components; the accessors here hand out the same `Arc`s
/// so that admin handlers and the fetch pipeline always see one state.
#[derive(Clone)]
pub struct RelayComponents {
    orchestrator: Arc<RequestOrchestrator>,
}

impl RelayComponents {
    #[must_use]
    pub fn new(orchestrator: Arc<RequestOrchestrator>) -> Self {
        Self { orchestrator }
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Arc<RequestOrchestrator> {
        &self.orchestrator
    }

    #[must_use]
    pub fn metrics_collector(&self) -> &Arc<MetricsCollector> {
        &self.orchestrator.parts().metrics
    }

    #[must_use]
    pub fn cache_store(&self) -> &Arc<CacheStore> {
        &self.orchestrator.parts().store
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.orchestrator.parts().registry
    }

    #[must_use]
    pub fn pools(&self) -> &Arc<StoragePoolManager> {
        &self.orchestrator.parts().pools
    }

    #[must_use]
    pub fn policies(&self) -> &Arc<PolicyEnforcer> {
        &self.orchestrator.parts().policies
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.orchestrator.parts().rate_limiter
    }

    #[must_use]
    pub fn kill_switch(&self) -> &Arc<KillSwitch> {
        &self.orchestrator.parts().kill_switch
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.orchestrator.parts().events
    }
}
