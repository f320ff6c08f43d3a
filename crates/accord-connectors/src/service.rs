//! Connector configuration service
//!
//! Persists connector configuration through a [`ConfigStore`] and keeps the
//! [`ConnectorRegistry`] in step with it.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use accord_core::{
    with_deadline, AccordError, ConfigStore, Connector, ConnectorConfig, ConnectorId,
    ConnectorSummary, CreateConnectorRequest, Result, TenantId, UpdateConnectorRequest,
};

use crate::registry::ConnectorRegistry;

/// Tunables for the connector service
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Upper bound on instantiation and health checks
    pub operation_timeout: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
        }
    }
}

pub struct ConnectorService<C>
where
    C: ConfigStore,
{
    store: Arc<C>,
    registry: Arc<ConnectorRegistry>,
    settings: ServiceSettings,
}

impl<C> ConnectorService<C>
where
    C: ConfigStore + 'static,
{
    pub fn new(store: Arc<C>, registry: Arc<ConnectorRegistry>) -> Self {
        Self::with_settings(store, registry, ServiceSettings::default())
    }

    pub fn with_settings(
        store: Arc<C>,
        registry: Arc<ConnectorRegistry>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            store,
            registry,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectorRegistry> {
        &self.registry
    }

    // =========================================================================
    // CRUD
    // =========================================================================

    /// Persist a new enabled connector and try to bring it live.
    ///
    /// Instantiation failure is logged; the configuration is kept so it can
    /// be fixed and toggled later.
    #[instrument(skip(self, request), fields(tenant_id = %tenant_id, connector_type = %request.connector_type))]
    pub async fn create_connector(
        &self,
        tenant_id: TenantId,
        request: CreateConnectorRequest,
    ) -> Result<ConnectorConfig> {
        if request.name.trim().is_empty() {
            return Err(AccordError::invalid_input("connector name is required"));
        }
        if request.connector_type.trim().is_empty() {
            return Err(AccordError::invalid_input("connector type is required"));
        }

        let mut config = ConnectorConfig::new(
            tenant_id,
            request.name,
            request.connector_type,
            request.endpoint,
        )
        .with_credentials(request.credentials);
        config.settings = request.settings;

        let config = self.store.create(&config).await?;
        info!(connector_id = %config.id, "Connector created: {}", config.name);

        self.instantiate_best_effort(&config).await;

        Ok(config)
    }

    pub async fn get_connector(
        &self,
        tenant_id: TenantId,
        id: ConnectorId,
    ) -> Result<ConnectorConfig> {
        self.store
            .get(tenant_id, id)
            .await?
            .ok_or_else(|| AccordError::not_found("connector", id.to_string()))
    }

    /// Connectors of a tenant with credential values redacted
    pub async fn list_connectors(&self, tenant_id: TenantId) -> Result<Vec<ConnectorSummary>> {
        let configs = self.store.list(tenant_id).await?;
        Ok(configs.iter().map(ConnectorConfig::summary).collect())
    }

    /// Apply a partial update and rebuild the live instance.
    ///
    /// Credentials omitted from the request are preserved; supplied keys are
    /// merged over the existing ones.
    #[instrument(skip(self, request), fields(tenant_id = %tenant_id, connector_id = %id))]
    pub async fn update_connector(
        &self,
        tenant_id: TenantId,
        id: ConnectorId,
        request: UpdateConnectorRequest,
    ) -> Result<ConnectorConfig> {
        let mut config = self.get_connector(tenant_id, id).await?;

        if let Some(name) = request.name {
            if name.trim().is_empty() {
                return Err(AccordError::invalid_input("connector name is required"));
            }
            config.name = name;
        }
        if let Some(endpoint) = request.endpoint {
            config.endpoint = endpoint;
        }
        if let Some(credentials) = request.credentials {
            config.credentials.merge(credentials);
        }
        if let Some(settings) = request.settings {
            config.settings = settings;
        }
        config.updated_at = Utc::now();

        let config = self.store.update(&config).await?;
        info!("Connector updated: {}", config.name);

        self.discard_instance(id).await;
        if config.enabled {
            self.instantiate_best_effort(&config).await;
        }

        Ok(config)
    }

    /// Persist the enabled flag; enabling builds a fresh instance, disabling
    /// removes the live one
    #[instrument(skip(self), fields(tenant_id = %tenant_id, connector_id = %id))]
    pub async fn toggle_connector(
        &self,
        tenant_id: TenantId,
        id: ConnectorId,
        enabled: bool,
    ) -> Result<ConnectorConfig> {
        let config = self.store.set_enabled(tenant_id, id, enabled).await?;

        self.discard_instance(id).await;
        if enabled {
            self.instantiate_best_effort(&config).await;
        }

        info!(enabled, "Connector toggled: {}", config.name);
        Ok(config)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, connector_id = %id))]
    pub async fn delete_connector(&self, tenant_id: TenantId, id: ConnectorId) -> Result<()> {
        self.store.delete(tenant_id, id).await?;
        self.discard_instance(id).await;

        info!("Connector deleted");
        Ok(())
    }

    // =========================================================================
    // Live instances
    // =========================================================================

    /// Build a throwaway instance from `config`, health-check it, and close it.
    /// The registry's instance table is never touched.
    #[instrument(skip(self, config), fields(connector_id = %config.id, connector_type = %config.connector_type))]
    pub async fn test_connection(&self, config: &ConnectorConfig) -> Result<bool> {
        let timeout = self.settings.operation_timeout;

        let connector = with_deadline(
            timeout,
            "connector initialization",
            self.registry.build_detached(&config.connector_type, config),
        )
        .await?;

        let health = with_deadline(timeout, "health check", connector.health_check()).await;

        if let Err(e) = connector.close().await {
            debug!("Closing test connector failed: {}", e);
        }

        let healthy = health?;
        info!(healthy, "Connection test finished");
        Ok(healthy)
    }

    pub async fn is_live(&self, id: ConnectorId) -> bool {
        self.registry.contains(id).await
    }

    /// Instantiate every enabled connector in the store. Returns how many
    /// became live.
    #[instrument(skip(self))]
    pub async fn load_enabled(&self) -> Result<usize> {
        let configs = self.store.list_enabled().await?;
        let total = configs.len();
        let mut live = 0;

        for config in &configs {
            if self.instantiate(config).await.is_ok() {
                live += 1;
            }
        }

        info!("Loaded {}/{} enabled connectors", live, total);
        Ok(live)
    }

    async fn instantiate(&self, config: &ConnectorConfig) -> Result<Arc<dyn Connector>> {
        let result = with_deadline(
            self.settings.operation_timeout,
            "connector initialization",
            self.registry.create(&config.connector_type, config),
        )
        .await;

        match result {
            Ok(registration) => {
                if let Some(previous) = registration.replaced {
                    if let Err(e) = previous.close().await {
                        warn!(connector_id = %config.id, "Failed to close replaced instance: {}", e);
                    }
                }
                Ok(registration.instance)
            }
            Err(e) => {
                error!(
                    connector_id = %config.id,
                    connector_type = %config.connector_type,
                    error_kind = e.kind(),
                    "Failed to instantiate connector: {}",
                    e
                );
                Err(e)
            }
        }
    }

    async fn instantiate_best_effort(&self, config: &ConnectorConfig) {
        let _ = self.instantiate(config).await;
    }

    /// Remove a live instance if there is one
    async fn discard_instance(&self, id: ConnectorId) {
        match self.registry.remove(id).await {
            Ok(()) => debug!(connector_id = %id, "Live instance removed"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(connector_id = %id, "Instance close failed during removal: {}", e),
        }
    }
}
