//! SCIM 2.0 connector
//!
//! Speaks RFC 7644 against a target's `/Users` and `/Groups` endpoints.
//! Membership changes go through PATCH on the group; listing uses
//! `startIndex`/`count` pagination with the next start index as cursor.
//!
//! Credentials: `token` (bearer) or `username` + `password` (basic).

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, instrument};

use accord_core::{
    connector_types, AccordError, Connector, ConnectorConfig, ConnectorGroup, ConnectorId,
    ConnectorUser, Page, PageRequest, Result,
};

use super::common::*;

const SCIM_CONTENT_TYPE: &str = "application/scim+json";
const USER_SCHEMA: &str = "urn:ietf:params:scim:schemas:core:2.0:User";
const GROUP_SCHEMA: &str = "urn:ietf:params:scim:schemas:core:2.0:Group";
const PATCH_SCHEMA: &str = "urn:ietf:params:scim:api:messages:2.0:PatchOp";

#[derive(Clone)]
enum ScimAuth {
    Bearer(String),
    Basic { username: String, password: String },
}

impl ScimAuth {
    fn from_config(config: &ConnectorConfig) -> Result<Self> {
        if let Some(token) = config.credential("token") {
            return Ok(Self::Bearer(token.to_string()));
        }

        match (config.credential("username"), config.credential("password")) {
            (Some(username), Some(password)) => Ok(Self::Basic {
                username: username.to_string(),
                password: password.to_string(),
            }),
            _ => Err(AccordError::permanent(format!(
                "connector {} needs a 'token' or 'username'/'password' credential",
                config.id
            ))),
        }
    }

    fn apply(&self, builder: RequestBuilder) -> RequestBuilder {
        match self {
            Self::Bearer(token) => builder.bearer_auth(token),
            Self::Basic { username, password } => builder.basic_auth(username, Some(password)),
        }
    }
}

pub struct ScimConnector {
    id: ConnectorId,
    name: String,
    base_url: String,
    auth: ScimAuth,
    http_client: HttpClient,
}

impl ScimConnector {
    pub fn new(config: &ConnectorConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(AccordError::invalid_input("SCIM connector requires an endpoint"));
        }

        Ok(Self {
            id: config.id,
            name: config.name.clone(),
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            auth: ScimAuth::from_config(config)?,
            http_client: HttpClient::from_config(config)?,
        })
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let builder = self
            .http_client
            .inner()
            .request(method, self.url(path))
            .header(reqwest::header::ACCEPT, SCIM_CONTENT_TYPE);
        self.auth.apply(builder)
    }

    async fn read<T: for<'de> Deserialize<'de>>(&self, path: &str, what: &str) -> Result<T> {
        let response = self
            .http_client
            .execute_with_retry(self.request(reqwest::Method::GET, path))
            .await?;
        decode_json(response, what).await
    }

    async fn write<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &B,
        what: &str,
    ) -> Result<T> {
        let response = self
            .http_client
            .send(
                self.request(method, path)
                    .header(reqwest::header::CONTENT_TYPE, SCIM_CONTENT_TYPE)
                    .json(body),
            )
            .await?;
        decode_json(response, what).await
    }

    async fn patch_group(&self, group_id: &str, operations: Vec<PatchOperation>) -> Result<()> {
        let patch = PatchRequest {
            schemas: vec![PATCH_SCHEMA.to_string()],
            operations,
        };

        self.http_client
            .send(
                self.request(reqwest::Method::PATCH, &resource_path("Groups", group_id)?)
                    .header(reqwest::header::CONTENT_TYPE, SCIM_CONTENT_TYPE)
                    .json(&patch),
            )
            .await?;
        Ok(())
    }

    async fn list<T: for<'de> Deserialize<'de>>(
        &self,
        resource: &str,
        page: &PageRequest,
    ) -> Result<Page<T>> {
        let start_index = parse_start_index(page.cursor.as_deref())?;
        let path = format!("{}?startIndex={}&count={}", resource, start_index, page.limit);

        let response: ScimListResponse<T> = self.read(&path, "SCIM list response").await?;
        Ok(response.into_page(start_index))
    }
}

#[async_trait]
impl Connector for ScimConnector {
    fn id(&self) -> ConnectorId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn connector_type(&self) -> &str {
        connector_types::SCIM
    }

    #[instrument(skip(self, _config), fields(connector_id = %self.id))]
    async fn initialize(&mut self, _config: &ConnectorConfig) -> Result<()> {
        info!("SCIM connector ready at {}", self.base_url);
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let _: serde_json::Value = self
            .read("ServiceProviderConfig", "ServiceProviderConfig")
            .await?;
        Ok(true)
    }

    async fn close(&self) -> Result<()> {
        debug!(connector_id = %self.id, "Closing SCIM connector");
        Ok(())
    }

    #[instrument(skip(self, user), fields(connector_id = %self.id))]
    async fn create_user(&self, user: &ConnectorUser) -> Result<ConnectorUser> {
        let created: ScimUser = self
            .write(
                reqwest::Method::POST,
                "Users",
                &ScimUser::from_connector(user),
                "SCIM user",
            )
            .await?;
        Ok(created.into_connector())
    }

    async fn get_user(&self, user_id: &str) -> Result<ConnectorUser> {
        let user: ScimUser = self
            .read(&resource_path("Users", user_id)?, "SCIM user")
            .await?;
        Ok(user.into_connector())
    }

    #[instrument(skip(self, user), fields(connector_id = %self.id))]
    async fn update_user(&self, user_id: &str, user: &ConnectorUser) -> Result<ConnectorUser> {
        let mut body = ScimUser::from_connector(user);
        body.id = Some(user_id.to_string());

        let updated: ScimUser = self
            .write(
                reqwest::Method::PUT,
                &resource_path("Users", user_id)?,
                &body,
                "SCIM user",
            )
            .await?;
        Ok(updated.into_connector())
    }

    #[instrument(skip(self), fields(connector_id = %self.id))]
    async fn delete_user(&self, user_id: &str) -> Result<()> {
        self.http_client
            .send(self.request(
                reqwest::Method::DELETE,
                &resource_path("Users", user_id)?,
            ))
            .await?;
        Ok(())
    }

    async fn list_users(&self, page: &PageRequest) -> Result<Page<ConnectorUser>> {
        let page: Page<ScimUser> = self.list("Users", page).await?;
        Ok(Page {
            items: page.items.into_iter().map(ScimUser::into_connector).collect(),
            next_cursor: page.next_cursor,
            total: page.total,
        })
    }

    #[instrument(skip(self, group), fields(connector_id = %self.id))]
    async fn create_group(&self, group: &ConnectorGroup) -> Result<ConnectorGroup> {
        let created: ScimGroup = self
            .write(
                reqwest::Method::POST,
                "Groups",
                &ScimGroup::from_connector(group),
                "SCIM group",
            )
            .await?;
        Ok(created.into_connector())
    }

    async fn get_group(&self, group_id: &str) -> Result<ConnectorGroup> {
        let group: ScimGroup = self
            .read(&resource_path("Groups", group_id)?, "SCIM group")
            .await?;
        Ok(group.into_connector())
    }

    #[instrument(skip(self, group), fields(connector_id = %self.id))]
    async fn update_group(&self, group_id: &str, group: &ConnectorGroup) -> Result<ConnectorGroup> {
        self.patch_group(
            group_id,
            vec![PatchOperation {
                op: "replace".to_string(),
                path: Some("displayName".to_string()),
                value: Some(serde_json::json!(group.name)),
            }],
        )
        .await?;
        self.get_group(group_id).await
    }

    #[instrument(skip(self), fields(connector_id = %self.id))]
    async fn delete_group(&self, group_id: &str) -> Result<()> {
        self.http_client
            .send(self.request(
                reqwest::Method::DELETE,
                &resource_path("Groups", group_id)?,
            ))
            .await?;
        Ok(())
    }

    async fn list_groups(&self, page: &PageRequest) -> Result<Page<ConnectorGroup>> {
        let page: Page<ScimGroup> = self.list("Groups", page).await?;
        Ok(Page {
            items: page.items.into_iter().map(ScimGroup::into_connector).collect(),
            next_cursor: page.next_cursor,
            total: page.total,
        })
    }

    #[instrument(skip(self), fields(connector_id = %self.id))]
    async fn add_user_to_group(&self, group_id: &str, user_id: &str) -> Result<()> {
        self.patch_group(
            group_id,
            vec![PatchOperation {
                op: "add".to_string(),
                path: Some("members".to_string()),
                value: Some(serde_json::json!([{ "value": user_id }])),
            }],
        )
        .await
    }

    #[instrument(skip(self), fields(connector_id = %self.id))]
    async fn remove_user_from_group(&self, group_id: &str, user_id: &str) -> Result<()> {
        self.patch_group(
            group_id,
            vec![PatchOperation {
                op: "remove".to_string(),
                path: Some(format!(
                    "members[value eq \"{}\"]",
                    escape_filter_value(user_id)
                )),
                value: None,
            }],
        )
        .await
    }

    async fn get_group_members(&self, group_id: &str) -> Result<Vec<String>> {
        let group: ScimGroup = self
            .read(
                &format!("{}?attributes=members", resource_path("Groups", group_id)?),
                "SCIM group",
            )
            .await?;
        Ok(group.members.into_iter().map(|m| m.value).collect())
    }
}

/// `<resource>/<id>` with the id percent-encoded as a single path segment
pub(crate) fn resource_path(resource: &str, id: &str) -> Result<String> {
    if id.is_empty() || id == "." || id == ".." {
        return Err(AccordError::invalid_input(format!(
            "'{}' is not a valid SCIM resource id",
            id
        )));
    }
    Ok(format!("{}/{}", resource, urlencoding::encode(id)))
}

fn parse_start_index(cursor: Option<&str>) -> Result<u64> {
    match cursor {
        None => Ok(1),
        Some(c) => c
            .parse::<u64>()
            .ok()
            .filter(|n| *n >= 1)
            .ok_or_else(|| AccordError::invalid_input(format!("bad SCIM cursor '{}'", c))),
    }
}

/// Escape a value for use inside a quoted SCIM filter string
pub(crate) fn escape_filter_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

// =============================================================================
// SCIM Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScimListResponse<T> {
    #[serde(default)]
    total_results: Option<u64>,
    #[serde(rename = "Resources", default = "Vec::new")]
    resources: Vec<T>,
}

impl<T> ScimListResponse<T> {
    fn into_page(self, start_index: u64) -> Page<T> {
        let returned = self.resources.len() as u64;
        let next = start_index + returned;
        let next_cursor = match self.total_results {
            Some(total) if returned > 0 && next <= total => Some(next.to_string()),
            _ => None,
        };

        Page {
            items: self.resources,
            next_cursor,
            total: self.total_results,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScimUser {
    #[serde(default)]
    schemas: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    external_id: Option<String>,
    user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<ScimName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    emails: Vec<ScimEmail>,
    #[serde(default = "default_true")]
    active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScimName {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    given_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    family_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ScimEmail {
    value: String,
    #[serde(default)]
    primary: bool,
}

impl ScimUser {
    fn from_connector(user: &ConnectorUser) -> Self {
        let name = if user.given_name.is_some() || user.family_name.is_some() {
            Some(ScimName {
                given_name: user.given_name.clone(),
                family_name: user.family_name.clone(),
            })
        } else {
            None
        };

        Self {
            schemas: vec![USER_SCHEMA.to_string()],
            id: user.id.clone(),
            external_id: user
                .attributes
                .get("external_id")
                .and_then(|v| v.as_str())
                .map(String::from),
            user_name: user.user_name.clone(),
            name,
            display_name: user.display_name.clone(),
            emails: user
                .email
                .iter()
                .map(|e| ScimEmail {
                    value: e.clone(),
                    primary: true,
                })
                .collect(),
            active: user.active,
        }
    }

    fn into_connector(self) -> ConnectorUser {
        let email = self
            .emails
            .iter()
            .find(|e| e.primary)
            .or_else(|| self.emails.first())
            .map(|e| e.value.clone());

        let mut attributes = HashMap::new();
        if let Some(external_id) = self.external_id {
            attributes.insert("external_id".to_string(), serde_json::json!(external_id));
        }

        let (given_name, family_name) = match self.name {
            Some(n) => (n.given_name, n.family_name),
            None => (None, None),
        };

        ConnectorUser {
            id: self.id,
            user_name: self.user_name,
            email,
            display_name: self.display_name,
            given_name,
            family_name,
            active: self.active,
            attributes,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScimGroup {
    #[serde(default)]
    schemas: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default)]
    display_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    members: Vec<ScimMember>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ScimMember {
    value: String,
}

impl ScimGroup {
    fn from_connector(group: &ConnectorGroup) -> Self {
        Self {
            schemas: vec![GROUP_SCHEMA.to_string()],
            id: group.id.clone(),
            display_name: group.name.clone(),
            members: Vec::new(),
        }
    }

    fn into_connector(self) -> ConnectorGroup {
        ConnectorGroup {
            id: self.id,
            name: self.display_name,
            description: None,
            attributes: HashMap::new(),
        }
    }
}

#[derive(Debug, Serialize)]
struct PatchRequest {
    schemas: Vec<String>,
    #[serde(rename = "Operations")]
    operations: Vec<PatchOperation>,
}

#[derive(Debug, Serialize)]
struct PatchOperation {
    op: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<serde_json::Value>,
}
