//! Registry of logical sources and their prioritized endpoints.
//!
//! Sources are grouped by explicit id: every [`Endpoint`] carries the id of the source it
//! belongs to. Reads go straight to the sharded maps; writes are serialised by an admin lock so
//! that the cross-record invariants below hold after every mutation:
//!
//! - a source with more than one endpoint uses shared storage
//! - shared storage names an existing pool, dedicated storage names none
//! - a dedicated pool has at most one member source
//! - auth descriptors are complete and base URLs are absolute `http(s)` URLs

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
    cache::StoragePoolManager,
    types::{AuthDescriptor, Endpoint, FallbackMode, Source, StorageMode, UpstreamResponse},
    upstream::{
        circuit_breaker::CircuitBreakerSnapshot, endpoint::UpstreamEndpoint,
        http_client::HttpClient,
    },
};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("source '{0}' not found")]
    SourceNotFound(String),

    #[error("endpoint '{0}' not found")]
    EndpointNotFound(String),

    #[error("{0} already exists")]
    Conflict(String),

    #[error("storage pool '{0}' does not exist")]
    UnknownPool(String),

    #[error("source '{source_id}' has several endpoints and must use shared storage")]
    MultiEndpointRequiresShared { source_id: String },

    #[error("dedicated storage pool '{pool_id}' already has a member source")]
    DedicatedPoolOccupied { pool_id: String },

    #[error("invalid source configuration: {0}")]
    Invalid(String),
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_threshold() -> u32 {
    5
}

/// Input for a new endpoint, used by [`SourceRegistry::create_source`] and
/// [`SourceRegistry::add_endpoint`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEndpoint {
    #[serde(default)]
    pub id: Option<String>,
    pub base_url: String,
    #[serde(default)]
    pub auth: AuthDescriptor,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default)]
    pub fallback_mode: FallbackMode,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl NewEndpoint {
    /// An endpoint with default settings for the given base URL.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            id: None,
            base_url: base_url.into(),
            auth: AuthDescriptor::None,
            priority: 0,
            timeout_ms: default_timeout_ms(),
            retry_count: 0,
            circuit_breaker_threshold: default_threshold(),
            fallback_mode: FallbackMode::None,
            is_active: true,
        }
    }
}

/// Input for [`SourceRegistry::create_source`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSource {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub storage_mode: StorageMode,
    #[serde(default)]
    pub pool_id: Option<String>,
    #[serde(default)]
    pub cost_per_request: f64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub bypass_bot_detection: bool,
    #[serde(default)]
    pub mock_response: Option<UpstreamResponse>,
    #[serde(default)]
    pub endpoints: Vec<NewEndpoint>,
}

impl Default for NewSource {
    fn default() -> Self {
        Self {
            id: None,
            name: String::new(),
            storage_mode: StorageMode::Dedicated,
            pool_id: None,
            cost_per_request: 0.0,
            is_active: true,
            bypass_bot_detection: false,
            mock_response: None,
            endpoints: Vec::new(),
        }
    }
}

/// Partial update for [`SourceRegistry::update_source`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub cost_per_request: Option<f64>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub bypass_bot_detection: Option<bool>,
    #[serde(default)]
    pub mock_response: Option<UpstreamResponse>,
    /// Removes the configured mock payload.
    #[serde(default)]
    pub clear_mock_response: bool,
}

/// A source together with its endpoints, credentials redacted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceView {
    #[serde(flatten)]
    pub source: Source,
    pub endpoints: Vec<Endpoint>,
}

/// Breaker state of one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointBreaker {
    pub endpoint_id: String,
    pub base_url: String,
    pub priority: u32,
    #[serde(flatten)]
    pub breaker: CircuitBreakerSnapshot,
}

pub struct SourceRegistry {
    sources: DashMap<String, Source>,
    endpoints: DashMap<String, Arc<UpstreamEndpoint>>,
    http_client: Arc<HttpClient>,
    pools: Arc<StoragePoolManager>,
    breaker_cooldown: Duration,
    admin: Mutex<()>,
}

impl SourceRegistry {
    #[must_use]
    pub fn new(
        http_client: Arc<HttpClient>,
        pools: Arc<StoragePoolManager>,
        breaker_cooldown: Duration,
    ) -> Self {
        Self {
            sources: DashMap::new(),
            endpoints: DashMap::new(),
            http_client,
            pools,
            breaker_cooldown,
            admin: Mutex::new(()),
        }
    }

    /// Creates a source and its initial endpoints atomically.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] if any invariant of the module documentation would be
    /// violated, or the id or name is already taken.
    pub fn create_source(&self, input: NewSource) -> Result<Source, RegistryError> {
        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(RegistryError::Invalid("source name must not be empty".to_string()));
        }
        validate_cost(input.cost_per_request)?;

        let _admin = self.admin.lock();

        let id = input.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if self.sources.contains_key(&id) {
            return Err(RegistryError::Conflict(format!("source '{id}'")));
        }
        if self.sources.iter().any(|source| source.name.eq_ignore_ascii_case(&name)) {
            return Err(RegistryError::Conflict(format!("source named '{name}'")));
        }

        self.check_storage(&id, input.storage_mode, input.pool_id.as_deref())?;
        if input.endpoints.len() > 1 && input.storage_mode != StorageMode::Shared {
            return Err(RegistryError::MultiEndpointRequiresShared { source_id: id });
        }

        let endpoints = input
            .endpoints
            .into_iter()
            .map(|endpoint| self.build_endpoint(&id, endpoint))
            .collect::<Result<Vec<_>, _>>()?;
        let mut ids: Vec<&str> = endpoints.iter().map(UpstreamEndpoint::id).collect();
        ids.sort_unstable();
        if ids.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(RegistryError::Conflict("duplicate endpoint id".to_string()));
        }

        let now = Utc::now();
        let source = Source {
            id: id.clone(),
            name,
            storage_mode: input.storage_mode,
            pool_id: input.pool_id,
            cost_per_request: input.cost_per_request,
            is_active: input.is_active,
            bypass_bot_detection: input.bypass_bot_detection,
            mock_response: input.mock_response,
            created_at: now,
            updated_at: now,
        };

        for endpoint in endpoints {
            self.endpoints.insert(endpoint.id().to_string(), Arc::new(endpoint));
        }
        self.sources.insert(id.clone(), source.clone());

        info!(
            source_id = %id,
            name = %source.name,
            storage_mode = ?source.storage_mode,
            pool_id = ?source.pool_id,
            endpoints = self.endpoint_count(&id),
            "source registered"
        );
        Ok(source)
    }

    /// # Errors
    ///
    /// Returns [`RegistryError::SourceNotFound`] for an unknown id, or
    /// [`RegistryError::Conflict`] when renaming onto an existing name.
    pub fn update_source(&self, id: &str, update: SourceUpdate) -> Result<Source, RegistryError> {
        if let Some(cost) = update.cost_per_request {
            validate_cost(cost)?;
        }

        let _admin = self.admin.lock();

        if let Some(name) = update.name.as_deref().map(str::trim) {
            if name.is_empty() {
                return Err(RegistryError::Invalid("source name must not be empty".to_string()));
            }
            if self.sources.iter().any(|s| s.id != id && s.name.eq_ignore_ascii_case(name)) {
                return Err(RegistryError::Conflict(format!("source named '{name}'")));
            }
        }

        let mut source =
            self.sources.get_mut(id).ok_or_else(|| RegistryError::SourceNotFound(id.to_string()))?;
        if let Some(name) = update.name {
            source.name = name.trim().to_string();
        }
        if let Some(cost) = update.cost_per_request {
            source.cost_per_request = cost;
        }
        if let Some(is_active) = update.is_active {
            source.is_active = is_active;
        }
        if let Some(bypass) = update.bypass_bot_detection {
            source.bypass_bot_detection = bypass;
        }
        if update.clear_mock_response {
            source.mock_response = None;
        }
        if let Some(mock) = update.mock_response {
            source.mock_response = Some(mock);
        }
        source.updated_at = Utc::now();

        info!(source_id = %id, "source updated");
        Ok(source.clone())
    }

    /// Removes a source and all of its endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::SourceNotFound`] for an unknown id.
    pub fn delete_source(&self, id: &str) -> Result<Source, RegistryError> {
        let _admin = self.admin.lock();
        let (_, source) =
            self.sources.remove(id).ok_or_else(|| RegistryError::SourceNotFound(id.to_string()))?;
        self.endpoints.retain(|_, endpoint| endpoint.config().source_id != id);
        info!(source_id = %id, name = %source.name, "source removed");
        Ok(source)
    }

    /// Adds an endpoint to an existing source.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::MultiEndpointRequiresShared`] if the source would end up with
    /// several endpoints while using dedicated storage, or a validation error.
    pub fn add_endpoint(
        &self,
        source_id: &str,
        input: NewEndpoint,
    ) -> Result<Endpoint, RegistryError> {
        let _admin = self.admin.lock();

        let source = self
            .sources
            .get(source_id)
            .map(|s| s.clone())
            .ok_or_else(|| RegistryError::SourceNotFound(source_id.to_string()))?;

        if self.endpoint_count(source_id) >= 1 && source.storage_mode != StorageMode::Shared {
            return Err(RegistryError::MultiEndpointRequiresShared {
                source_id: source_id.to_string(),
            });
        }

        let endpoint = self.build_endpoint(source_id, input)?;
        let config = endpoint.config().clone();
        self.endpoints.insert(config.id.clone(), Arc::new(endpoint));

        info!(
            source_id = %source_id,
            endpoint = %config.id,
            base_url = %config.base_url,
            priority = config.priority,
            "endpoint added"
        );
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns [`RegistryError::EndpointNotFound`] if the endpoint does not belong to the source.
    pub fn remove_endpoint(
        &self,
        source_id: &str,
        endpoint_id: &str,
    ) -> Result<Endpoint, RegistryError> {
        let _admin = self.admin.lock();
        let (_, endpoint) = self
            .endpoints
            .remove_if(endpoint_id, |_, endpoint| endpoint.config().source_id == source_id)
            .ok_or_else(|| RegistryError::EndpointNotFound(endpoint_id.to_string()))?;
        info!(source_id = %source_id, endpoint = %endpoint_id, "endpoint removed");
        Ok(endpoint.config().clone())
    }

    /// Moves a source between storage modes and pools.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] if the target pool is unknown or full, or if a
    /// multi-endpoint source would be left in dedicated storage.
    pub fn set_storage(
        &self,
        source_id: &str,
        storage_mode: StorageMode,
        pool_id: Option<String>,
    ) -> Result<Source, RegistryError> {
        let _admin = self.admin.lock();

        if !self.sources.contains_key(source_id) {
            return Err(RegistryError::SourceNotFound(source_id.to_string()));
        }
        self.check_storage(source_id, storage_mode, pool_id.as_deref())?;
        if storage_mode == StorageMode::Dedicated && self.endpoint_count(source_id) > 1 {
            return Err(RegistryError::MultiEndpointRequiresShared {
                source_id: source_id.to_string(),
            });
        }

        let mut source = self
            .sources
            .get_mut(source_id)
            .ok_or_else(|| RegistryError::SourceNotFound(source_id.to_string()))?;
        source.storage_mode = storage_mode;
        source.pool_id = pool_id;
        source.updated_at = Utc::now();
        Ok(source.clone())
    }

    #[must_use]
    pub fn get_source(&self, id: &str) -> Option<Source> {
        self.sources.get(id).map(|source| source.clone())
    }

    /// Looks a source up by id, then by case-insensitive name.
    #[must_use]
    pub fn find_source(&self, id_or_name: &str) -> Option<Source> {
        self.get_source(id_or_name).or_else(|| {
            self.sources
                .iter()
                .find(|source| source.name.eq_ignore_ascii_case(id_or_name))
                .map(|source| source.clone())
        })
    }

    #[must_use]
    pub fn list_sources(&self) -> Vec<Source> {
        let mut sources: Vec<Source> = self.sources.iter().map(|s| s.clone()).collect();
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        sources
    }

    /// Source with its endpoints; credentials are redacted.
    #[must_use]
    pub fn view(&self, id: &str) -> Option<SourceView> {
        let source = self.get_source(id)?;
        let endpoints = self
            .endpoints_for(id)
            .iter()
            .map(|endpoint| {
                let mut config = endpoint.config().clone();
                config.auth = config.auth.redacted();
                config
            })
            .collect();
        Some(SourceView { source, endpoints })
    }

    #[must_use]
    pub fn sources_in_pool(&self, pool_id: &str) -> Vec<Source> {
        self.sources
            .iter()
            .filter(|source| source.pool_id.as_deref() == Some(pool_id))
            .map(|source| source.clone())
            .collect()
    }

    #[must_use]
    pub fn endpoint_count(&self, source_id: &str) -> usize {
        self.endpoints.iter().filter(|e| e.config().source_id == source_id).count()
    }

    /// Every endpoint of a source in ascending priority order, including inactive ones.
    #[must_use]
    pub fn endpoints_for(&self, source_id: &str) -> Vec<Arc<UpstreamEndpoint>> {
        let mut endpoints: Vec<Arc<UpstreamEndpoint>> = self
            .endpoints
            .iter()
            .filter(|endpoint| endpoint.config().source_id == source_id)
            .map(|endpoint| endpoint.value().clone())
            .collect();
        endpoints.sort_by(|a, b| {
            a.config().priority.cmp(&b.config().priority).then_with(|| a.id().cmp(b.id()))
        });
        endpoints
    }

    /// Candidate endpoints for a request: active, breaker not open, ascending priority.
    pub async fn resolve_endpoints(&self, source_id: &str) -> Vec<Arc<UpstreamEndpoint>> {
        let mut candidates = Vec::new();
        for endpoint in self.endpoints_for(source_id) {
            if !endpoint.config().is_active {
                continue;
            }
            if endpoint.circuit_breaker().is_open().await {
                tracing::debug!(
                    source_id = %source_id,
                    endpoint = %endpoint.id(),
                    "skipping endpoint with open circuit"
                );
                continue;
            }
            candidates.push(endpoint);
        }
        candidates
    }

    /// Fallback mode of the source's primary (lowest priority value) endpoint.
    #[must_use]
    pub fn fallback_mode(&self, source_id: &str) -> FallbackMode {
        self.endpoints_for(source_id)
            .first()
            .map_or(FallbackMode::None, |endpoint| endpoint.config().fallback_mode)
    }

    /// Finds the source whose endpoint base URL is the longest prefix of `url`.
    ///
    /// The prefix must end on a path boundary. Returns the source and the remaining path and
    /// query, which is re-rooted onto each endpoint during failover.
    #[must_use]
    pub fn match_url(&self, url: &str) -> Option<(Source, String)> {
        let (source_id, suffix) = longest_match(
            self.endpoints.iter().map(|endpoint| endpoint.value().clone()),
            url,
        )?;
        self.get_source(&source_id).map(|source| (source, suffix))
    }

    /// Like [`match_url`](Self::match_url) but only considers the given source's endpoints.
    #[must_use]
    pub fn match_source_url(&self, source_id: &str, url: &str) -> Option<String> {
        longest_match(self.endpoints_for(source_id), url).map(|(_, suffix)| suffix)
    }

    /// Breaker snapshots for every endpoint of a source.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::SourceNotFound`] for an unknown source.
    pub async fn breakers(&self, source_id: &str) -> Result<Vec<EndpointBreaker>, RegistryError> {
        if !self.sources.contains_key(source_id) {
            return Err(RegistryError::SourceNotFound(source_id.to_string()));
        }
        let mut breakers = Vec::new();
        for endpoint in self.endpoints_for(source_id) {
            breakers.push(EndpointBreaker {
                endpoint_id: endpoint.id().to_string(),
                base_url: endpoint.config().base_url.clone(),
                priority: endpoint.config().priority,
                breaker: endpoint.breaker_snapshot().await,
            });
        }
        Ok(breakers)
    }

    /// Forces an endpoint's breaker closed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::EndpointNotFound`] if the endpoint does not belong to the source.
    pub async fn reset_breaker(
        &self,
        source_id: &str,
        endpoint_id: &str,
    ) -> Result<(), RegistryError> {
        let endpoint = self
            .endpoints
            .get(endpoint_id)
            .filter(|endpoint| endpoint.config().source_id == source_id)
            .map(|endpoint| endpoint.value().clone())
            .ok_or_else(|| RegistryError::EndpointNotFound(endpoint_id.to_string()))?;
        endpoint.circuit_breaker().reset().await;
        info!(source_id = %source_id, endpoint = %endpoint_id, "circuit breaker reset");
        Ok(())
    }

    /// Every endpoint across sources, for metrics.
    #[must_use]
    pub fn all_endpoints(&self) -> Vec<Arc<UpstreamEndpoint>> {
        self.endpoints.iter().map(|endpoint| endpoint.value().clone()).collect()
    }

    fn check_storage(
        &self,
        source_id: &str,
        storage_mode: StorageMode,
        pool_id: Option<&str>,
    ) -> Result<(), RegistryError> {
        match (storage_mode, pool_id) {
            (StorageMode::Shared, None) => Err(RegistryError::Invalid(
                "shared storage requires a pool_id".to_string(),
            )),
            (StorageMode::Dedicated, Some(_)) => Err(RegistryError::Invalid(
                "dedicated storage must not reference a pool".to_string(),
            )),
            (StorageMode::Dedicated, None) => Ok(()),
            (StorageMode::Shared, Some(pool_id)) => {
                let pool = self
                    .pools
                    .get(pool_id)
                    .ok_or_else(|| RegistryError::UnknownPool(pool_id.to_string()))?;
                if pool.dedicated &&
                    self.sources.iter().any(|source| {
                        source.id != source_id && source.pool_id.as_deref() == Some(pool_id)
                    })
                {
                    return Err(RegistryError::DedicatedPoolOccupied {
                        pool_id: pool_id.to_string(),
                    });
                }
                Ok(())
            }
        }
    }

    fn build_endpoint(
        &self,
        source_id: &str,
        input: NewEndpoint,
    ) -> Result<UpstreamEndpoint, RegistryError> {
        let base_url = input.base_url.trim().to_string();
        let parsed = Url::parse(&base_url)
            .map_err(|e| RegistryError::Invalid(format!("invalid base_url '{base_url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RegistryError::Invalid(format!(
                "base_url '{base_url}' must use http or https"
            )));
        }
        input.auth.validate().map_err(RegistryError::Invalid)?;
        if input.circuit_breaker_threshold == 0 {
            return Err(RegistryError::Invalid(
                "circuit_breaker_threshold must be at least 1".to_string(),
            ));
        }
        if input.timeout_ms == 0 {
            return Err(RegistryError::Invalid("timeout_ms must be positive".to_string()));
        }

        let id = input.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if self.endpoints.contains_key(&id) {
            return Err(RegistryError::Conflict(format!("endpoint '{id}'")));
        }

        let config = Endpoint {
            id,
            source_id: source_id.to_string(),
            base_url,
            auth: input.auth,
            priority: input.priority,
            timeout_ms: input.timeout_ms,
            retry_count: input.retry_count,
            circuit_breaker_threshold: input.circuit_breaker_threshold,
            fallback_mode: input.fallback_mode,
            is_active: input.is_active,
        };
        Ok(UpstreamEndpoint::new(config, self.http_client.clone(), self.breaker_cooldown))
    }
}

fn validate_cost(cost: f64) -> Result<(), RegistryError> {
    if cost.is_finite() && cost >= 0.0 {
        Ok(())
    } else {
        Err(RegistryError::Invalid("cost_per_request must be a non-negative number".to_string()))
    }
}

fn longest_match<I>(endpoints: I, url: &str) -> Option<(String, String)>
where
    I: IntoIterator<Item = Arc<UpstreamEndpoint>>,
{
    let mut best: Option<(usize, String, String)> = None;

    for endpoint in endpoints {
        let base = endpoint.config().base_url.trim_end_matches('/');
        let Some(rest) = url.strip_prefix(base) else {
            continue;
        };
        if !(rest.is_empty() || rest.starts_with('/') || rest.starts_with('?')) {
            continue;
        }
        if best.as_ref().map_or(true, |(len, _, _)| base.len() > *len) {
            best = Some((base.len(), endpoint.config().source_id.clone(), rest.to_string()));
        }
    }

    best.map(|(_, source_id, suffix)| (source_id, suffix))
}
