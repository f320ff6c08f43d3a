//! Connector configuration and the identity payloads exchanged with connectors

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::{
    error::{AccordError, Result},
    ids::{ConnectorId, TenantId},
};

// =============================================================================
// Connector Types
// =============================================================================

/// Connector type keys for the bundled adapters
pub mod connector_types {
    pub const SCIM: &str = "scim";
    pub const AZURE_AD: &str = "azure_ad";
    pub const GOOGLE: &str = "google";
    pub const LDAP: &str = "ldap";
}

// =============================================================================
// Credentials
// =============================================================================

/// Opaque secret material for a connector.
///
/// `Debug` prints key names only. Values are sealed before they reach storage.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(BTreeMap<String, String>);

impl Credentials {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overlay `update` on top of the current keys; keys absent from the
    /// update keep their current value
    pub fn merge(&mut self, update: Credentials) {
        self.0.extend(update.0);
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|k| (k, "<redacted>")))
            .finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Credentials {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

// =============================================================================
// Connector Configuration
// =============================================================================

/// Persisted description of one external identity system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub id: ConnectorId,
    pub tenant_id: TenantId,
    pub name: String,
    pub connector_type: String,
    pub enabled: bool,
    pub endpoint: String,

    /// Secret material (encrypted at rest)
    #[serde(skip_serializing, default)]
    pub credentials: Credentials,

    /// Adapter-specific, non-secret settings
    #[serde(default)]
    pub settings: HashMap<String, serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConnectorConfig {
    pub fn new(
        tenant_id: TenantId,
        name: impl Into<String>,
        connector_type: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ConnectorId::new(),
            tenant_id,
            name: name.into(),
            connector_type: connector_type.into(),
            enabled: true,
            endpoint: endpoint.into(),
            credentials: Credentials::new(),
            settings: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    pub fn credential(&self, key: &str) -> Option<&str> {
        self.credentials.get(key)
    }

    /// Credential lookup for adapters; absence is a configuration defect
    pub fn require_credential(&self, key: &str) -> Result<&str> {
        self.credentials.get(key).ok_or_else(|| {
            AccordError::permanent(format!(
                "connector {} is missing credential '{}'",
                self.id, key
            ))
        })
    }

    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(|v| v.as_str())
    }

    pub fn setting_u64(&self, key: &str) -> Option<u64> {
        self.settings.get(key).and_then(|v| v.as_u64())
    }

    pub fn setting_bool(&self, key: &str) -> Option<bool> {
        self.settings.get(key).and_then(|v| v.as_bool())
    }

    /// Projection safe to return from list calls
    pub fn summary(&self) -> ConnectorSummary {
        ConnectorSummary {
            id: self.id,
            tenant_id: self.tenant_id,
            name: self.name.clone(),
            connector_type: self.connector_type.clone(),
            enabled: self.enabled,
            endpoint: self.endpoint.clone(),
            credential_keys: self.credentials.keys(),
            settings: self.settings.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Connector configuration without secret values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorSummary {
    pub id: ConnectorId,
    pub tenant_id: TenantId,
    pub name: String,
    pub connector_type: String,
    pub enabled: bool,
    pub endpoint: String,
    pub credential_keys: Vec<String>,
    pub settings: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to create a connector
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateConnectorRequest {
    pub name: String,
    pub connector_type: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub settings: HashMap<String, serde_json::Value>,
}

/// Partial update of a connector; `None` keeps the current value
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateConnectorRequest {
    pub name: Option<String>,
    pub endpoint: Option<String>,
    /// Merged key-by-key into the existing credentials
    pub credentials: Option<Credentials>,
    /// Replaces the settings map
    pub settings: Option<HashMap<String, serde_json::Value>>,
}

// =============================================================================
// Identity Payloads
// =============================================================================

/// A user as seen by an external identity system
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectorUser {
    /// Identifier assigned by the external system (absent before creation)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, serde_json::Value>,
}

fn default_active() -> bool {
    true
}

impl ConnectorUser {
    pub fn new(user_name: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            active: true,
            ..Default::default()
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn with_names(mut self, given: impl Into<String>, family: impl Into<String>) -> Self {
        self.given_name = Some(given.into());
        self.family_name = Some(family.into());
        self
    }
}

/// A group as seen by an external identity system
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectorGroup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl ConnectorGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

// =============================================================================
// Pagination
// =============================================================================

/// Cursor-based page request. The cursor is opaque and adapter-specific.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub cursor: Option<String>,
    pub limit: u32,
}

impl PageRequest {
    pub const DEFAULT_LIMIT: u32 = 100;

    pub fn first(limit: u32) -> Self {
        Self {
            cursor: None,
            limit,
        }
    }

    pub fn after(cursor: impl Into<String>, limit: u32) -> Self {
        Self {
            cursor: Some(cursor.into()),
            limit,
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::first(Self::DEFAULT_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Cursor for the next page, `None` on the last page
    pub next_cursor: Option<String>,
    /// Total result count when the external system reports one
    pub total: Option<u64>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
            total: None,
        }
    }

    pub fn has_more(&self) -> bool {
        self.next_cursor.is_some()
    }
}
