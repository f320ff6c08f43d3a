//! Connector Registry - factories per connector type and live instances per config
//!
//! The registry provides:
//! - Factory registration keyed by connector type
//! - Instance lifecycle (build, initialize, replace, close)
//! - Instance lookup for dispatch
//! - Health snapshots across all live instances
//!
//! Factories and instances sit behind separate locks, and neither lock is held
//! while a connector is built, initialized, closed or health-checked.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use accord_core::{
    with_deadline, AccordError, Connector, ConnectorConfig, ConnectorFactory, ConnectorId, Result,
};

/// Outcome of [`ConnectorRegistry::create`]
pub struct Registration {
    pub instance: Arc<dyn Connector>,
    /// Instance previously stored under the same id. The caller owns closing it.
    pub replaced: Option<Arc<dyn Connector>>,
}

/// Registry of connector factories and live connector instances
pub struct ConnectorRegistry {
    factories: RwLock<HashMap<String, Arc<dyn ConnectorFactory>>>,
    instances: RwLock<HashMap<ConnectorId, Arc<dyn Connector>>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Register the factory for a connector type; a later call for the same
    /// type replaces the earlier factory
    pub async fn register(
        &self,
        connector_type: impl Into<String>,
        factory: impl ConnectorFactory + 'static,
    ) {
        let connector_type = connector_type.into();
        debug!("Registering connector factory: {}", connector_type);

        self.factories
            .write()
            .await
            .insert(connector_type, Arc::new(factory));
    }

    pub async fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.read().await.keys().cloned().collect();
        types.sort();
        types
    }

    async fn factory(&self, connector_type: &str) -> Result<Arc<dyn ConnectorFactory>> {
        self.factories
            .read()
            .await
            .get(connector_type)
            .cloned()
            .ok_or_else(|| AccordError::unknown_type(connector_type))
    }

    /// Build and initialize an instance without storing it
    #[instrument(skip(self, config), fields(connector_id = %config.id, connector_type = %connector_type))]
    pub async fn build_detached(
        &self,
        connector_type: &str,
        config: &ConnectorConfig,
    ) -> Result<Box<dyn Connector>> {
        let factory = self.factory(connector_type).await?;
        let mut connector = factory.build(config)?;

        if let Err(e) = connector.initialize(config).await {
            warn!("Connector initialization failed: {}", e);
            if let Err(close_err) = connector.close().await {
                debug!("Close after failed initialization also failed: {}", close_err);
            }
            return Err(e);
        }

        Ok(connector)
    }

    /// Build, initialize and store an instance under the config id
    #[instrument(skip(self, config), fields(connector_id = %config.id, connector_type = %connector_type))]
    pub async fn create(
        &self,
        connector_type: &str,
        config: &ConnectorConfig,
    ) -> Result<Registration> {
        let instance: Arc<dyn Connector> =
            Arc::from(self.build_detached(connector_type, config).await?);

        let replaced = self
            .instances
            .write()
            .await
            .insert(config.id, instance.clone());

        if replaced.is_some() {
            debug!("Replaced existing connector instance");
        }
        info!("Connector instance created: {}", config.name);

        Ok(Registration { instance, replaced })
    }

    pub async fn get(&self, id: ConnectorId) -> Option<Arc<dyn Connector>> {
        self.instances.read().await.get(&id).cloned()
    }

    pub async fn contains(&self, id: ConnectorId) -> bool {
        self.instances.read().await.contains_key(&id)
    }

    /// Snapshot of all live instances
    pub async fn list(&self) -> Vec<Arc<dyn Connector>> {
        self.instances.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    /// Remove and close an instance. `NotFound` if no instance is stored.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: ConnectorId) -> Result<()> {
        let instance = self
            .instances
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| AccordError::not_found("connector instance", id.to_string()))?;

        info!("Removing connector instance: {}", instance.name());
        instance.close().await
    }

    /// Health of every live instance, each check bounded by `deadline`
    pub async fn health_check(&self, deadline: Duration) -> HashMap<ConnectorId, bool> {
        let snapshot: Vec<(ConnectorId, Arc<dyn Connector>)> = self
            .instances
            .read()
            .await
            .iter()
            .map(|(id, c)| (*id, c.clone()))
            .collect();

        let checks = snapshot.into_iter().map(|(id, connector)| async move {
            let healthy = match with_deadline(deadline, "health check", connector.health_check()).await {
                Ok(healthy) => healthy,
                Err(e) => {
                    debug!(connector_id = %id, "Health check failed: {}", e);
                    false
                }
            };
            (id, healthy)
        });

        join_all(checks).await.into_iter().collect()
    }

    /// Drain and close every instance; close failures are logged
    #[instrument(skip(self))]
    pub async fn close_all(&self) {
        let drained: Vec<Arc<dyn Connector>> =
            self.instances.write().await.drain().map(|(_, c)| c).collect();

        info!("Closing {} connector instances", drained.len());
        for connector in drained {
            if let Err(e) = connector.close().await {
                warn!(connector_id = %connector.id(), "Failed to close connector: {}", e);
            }
        }
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
