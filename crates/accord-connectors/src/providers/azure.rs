//! Azure Active Directory / Entra ID connector over Microsoft Graph
//!
//! Authenticates with the client-credentials grant and caches the token until
//! shortly before expiry. Listing follows `@odata.nextLink`, which is handed
//! out verbatim as the page cursor.
//!
//! Credentials: `client_id`, `client_secret`.
//! Settings: `tenant_id` (directory id), optional `token_url` override.
//! The endpoint defaults to the Graph v1.0 root.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, instrument};

use accord_core::{
    connector_types, AccordError, Connector, ConnectorConfig, ConnectorGroup, ConnectorId,
    ConnectorUser, Page, PageRequest, Result,
};

use super::common::*;

const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

pub struct AzureAdConnector {
    id: ConnectorId,
    name: String,
    base_url: String,
    token_url: String,
    client_id: String,
    client_secret: String,
    http_client: HttpClient,
    tokens: TokenCache,
}

impl AzureAdConnector {
    pub fn new(config: &ConnectorConfig) -> Result<Self> {
        let client_id = config.require_credential("client_id")?.to_string();
        let client_secret = config.require_credential("client_secret")?.to_string();

        let token_url = match config.setting_str("token_url") {
            Some(url) => url.to_string(),
            None => {
                let directory = config
                    .setting_str("tenant_id")
                    .or_else(|| config.credential("tenant_id"))
                    .ok_or_else(|| {
                        AccordError::invalid_input("Azure AD connector requires a tenant_id setting")
                    })?;
                format!(
                    "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
                    directory
                )
            }
        };

        let base_url = if config.endpoint.trim().is_empty() {
            GRAPH_BASE_URL.to_string()
        } else {
            config.endpoint.trim_end_matches('/').to_string()
        };

        Ok(Self {
            id: config.id,
            name: config.name.clone(),
            base_url,
            token_url,
            client_id,
            client_secret,
            http_client: HttpClient::from_config(config)?,
            tokens: TokenCache::new(),
        })
    }

    /// Get an access token for Microsoft Graph
    async fn graph_token(&self) -> Result<String> {
        self.tokens
            .get_or_fetch(|| async {
                debug!("Requesting Graph access token");
                let params = [
                    ("client_id", self.client_id.as_str()),
                    ("client_secret", self.client_secret.as_str()),
                    ("scope", GRAPH_SCOPE),
                    ("grant_type", "client_credentials"),
                ];

                let response = self
                    .http_client
                    .execute_with_retry(self.http_client.inner().post(&self.token_url).form(&params))
                    .await?;

                let token: AzureTokenResponse = decode_json(response, "token response").await?;
                Ok::<_, AccordError>(IssuedToken {
                    access_token: token.access_token,
                    expires_in: token.expires_in.unwrap_or(3600),
                })
            })
            .await
    }

    async fn request(&self, method: Method, url: &str) -> Result<RequestBuilder> {
        let token = self.graph_token().await?;
        Ok(self
            .http_client
            .inner()
            .request(method, url)
            .bearer_auth(token))
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    async fn graph_get<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T> {
        let builder = self.request(Method::GET, url).await?;
        let response = self.http_client.execute_with_retry(builder).await?;
        decode_json(response, "Graph response").await
    }

    async fn graph_send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let mut builder = self.request(method, &self.url(path)).await?;
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let path = response.url().path().to_string();
        let body = response.text().await.unwrap_or_default();

        // Graph reports duplicate membership as 400 with a descriptive message
        if status == StatusCode::BAD_REQUEST && body.contains("already exist") {
            return Err(AccordError::conflict(format!("HTTP 400 - {}", body)));
        }
        Err(status_error(status, &path, &body))
    }

    async fn graph_page<T: for<'de> Deserialize<'de>>(
        &self,
        collection: &str,
        page: &PageRequest,
    ) -> Result<Page<T>> {
        let url = match &page.cursor {
            Some(next_link) => next_link.clone(),
            None => format!("{}?$top={}", self.url(collection), page.limit),
        };

        let list: GraphListResponse<T> = self.graph_get(&url).await?;
        Ok(Page {
            items: list.value,
            next_cursor: list.next_link,
            total: None,
        })
    }

    fn directory_object_ref(&self, id: &str) -> serde_json::Value {
        serde_json::json!({
            "@odata.id": format!("{}/directoryObjects/{}", self.base_url, id)
        })
    }
}

#[async_trait]
impl Connector for AzureAdConnector {
    fn id(&self) -> ConnectorId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn connector_type(&self) -> &str {
        connector_types::AZURE_AD
    }

    #[instrument(skip(self, _config), fields(connector_id = %self.id))]
    async fn initialize(&mut self, _config: &ConnectorConfig) -> Result<()> {
        self.graph_token().await?;
        info!("Azure AD connector authenticated");
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let _: GraphListResponse<serde_json::Value> =
            self.graph_get(&self.url("organization?$select=id")).await?;
        Ok(true)
    }

    async fn close(&self) -> Result<()> {
        self.tokens.invalidate().await;
        Ok(())
    }

    #[instrument(skip(self, user), fields(connector_id = %self.id))]
    async fn create_user(&self, user: &ConnectorUser) -> Result<ConnectorUser> {
        let mut body = serde_json::to_value(AzureUser::from_connector(user))?;
        if let Some(password) = user.attributes.get("password").and_then(|v| v.as_str()) {
            body["passwordProfile"] = serde_json::json!({
                "password": password,
                "forceChangePasswordNextSignIn": true,
            });
        }

        let response = self.graph_send(Method::POST, "users", Some(body)).await?;
        let created: AzureUser = decode_json(response, "Graph user").await?;
        Ok(created.into_connector())
    }

    async fn get_user(&self, user_id: &str) -> Result<ConnectorUser> {
        let user: AzureUser = self
            .graph_get(&self.url(&format!("users/{}", urlencoding::encode(user_id))))
            .await?;
        Ok(user.into_connector())
    }

    #[instrument(skip(self, user), fields(connector_id = %self.id))]
    async fn update_user(&self, user_id: &str, user: &ConnectorUser) -> Result<ConnectorUser> {
        let mut body = AzureUser::from_connector(user);
        body.id = None;

        self.graph_send(
            Method::PATCH,
            &format!("users/{}", urlencoding::encode(user_id)),
            Some(serde_json::to_value(body)?),
        )
        .await?;

        let mut updated = user.clone();
        updated.id = Some(user_id.to_string());
        Ok(updated)
    }

    #[instrument(skip(self), fields(connector_id = %self.id))]
    async fn delete_user(&self, user_id: &str) -> Result<()> {
        self.graph_send(
            Method::DELETE,
            &format!("users/{}", urlencoding::encode(user_id)),
            None,
        )
        .await?;
        Ok(())
    }

    async fn list_users(&self, page: &PageRequest) -> Result<Page<ConnectorUser>> {
        let page: Page<AzureUser> = self.graph_page("users", page).await?;
        Ok(Page {
            items: page.items.into_iter().map(AzureUser::into_connector).collect(),
            next_cursor: page.next_cursor,
            total: page.total,
        })
    }

    #[instrument(skip(self, group), fields(connector_id = %self.id))]
    async fn create_group(&self, group: &ConnectorGroup) -> Result<ConnectorGroup> {
        let body = serde_json::to_value(AzureGroup::from_connector(group))?;
        let response = self.graph_send(Method::POST, "groups", Some(body)).await?;
        let created: AzureGroup = decode_json(response, "Graph group").await?;
        Ok(created.into_connector())
    }

    async fn get_group(&self, group_id: &str) -> Result<ConnectorGroup> {
        let group: AzureGroup = self
            .graph_get(&self.url(&format!("groups/{}", urlencoding::encode(group_id))))
            .await?;
        Ok(group.into_connector())
    }

    #[instrument(skip(self, group), fields(connector_id = %self.id))]
    async fn update_group(&self, group_id: &str, group: &ConnectorGroup) -> Result<ConnectorGroup> {
        let body = serde_json::json!({
            "displayName": group.name,
            "description": group.description,
        });
        self.graph_send(
            Method::PATCH,
            &format!("groups/{}", urlencoding::encode(group_id)),
            Some(body),
        )
        .await?;

        let mut updated = group.clone();
        updated.id = Some(group_id.to_string());
        Ok(updated)
    }

    #[instrument(skip(self), fields(connector_id = %self.id))]
    async fn delete_group(&self, group_id: &str) -> Result<()> {
        self.graph_send(
            Method::DELETE,
            &format!("groups/{}", urlencoding::encode(group_id)),
            None,
        )
        .await?;
        Ok(())
    }

    async fn list_groups(&self, page: &PageRequest) -> Result<Page<ConnectorGroup>> {
        let page: Page<AzureGroup> = self.graph_page("groups", page).await?;
        Ok(Page {
            items: page.items.into_iter().map(AzureGroup::into_connector).collect(),
            next_cursor: page.next_cursor,
            total: page.total,
        })
    }

    #[instrument(skip(self), fields(connector_id = %self.id))]
    async fn add_user_to_group(&self, group_id: &str, user_id: &str) -> Result<()> {
        self.graph_send(
            Method::POST,
            &format!("groups/{}/members/$ref", urlencoding::encode(group_id)),
            Some(self.directory_object_ref(user_id)),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(connector_id = %self.id))]
    async fn remove_user_from_group(&self, group_id: &str, user_id: &str) -> Result<()> {
        self.graph_send(
            Method::DELETE,
            &format!(
                "groups/{}/members/{}/$ref",
                urlencoding::encode(group_id),
                urlencoding::encode(user_id)
            ),
            None,
        )
        .await?;
        Ok(())
    }

    async fn get_group_members(&self, group_id: &str) -> Result<Vec<String>> {
        let mut members = Vec::new();
        let mut url = self.url(&format!(
            "groups/{}/members?$select=id",
            urlencoding::encode(group_id)
        ));

        loop {
            let page: GraphListResponse<AzureDirectoryObject> = self.graph_get(&url).await?;
            members.extend(page.value.into_iter().map(|o| o.id));

            match page.next_link {
                Some(next) => url = next,
                None => break,
            }
        }

        Ok(members)
    }
}

// =============================================================================
// Microsoft Graph API Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct GraphListResponse<T> {
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzureUser {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default)]
    user_principal_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mail_nickname: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    given_name: Option<String>,
    #[serde(default)]
    surname: Option<String>,
    #[serde(default)]
    mail: Option<String>,
    #[serde(default)]
    account_enabled: Option<bool>,
}

impl AzureUser {
    fn from_connector(user: &ConnectorUser) -> Self {
        let nickname = user
            .user_name
            .split('@')
            .next()
            .unwrap_or(&user.user_name)
            .to_string();

        Self {
            id: user.id.clone(),
            user_principal_name: Some(user.user_name.clone()),
            mail_nickname: Some(nickname),
            display_name: Some(
                user.display_name
                    .clone()
                    .unwrap_or_else(|| user.user_name.clone()),
            ),
            given_name: user.given_name.clone(),
            surname: user.family_name.clone(),
            mail: user.email.clone(),
            account_enabled: Some(user.active),
        }
    }

    fn into_connector(self) -> ConnectorUser {
        ConnectorUser {
            id: self.id,
            user_name: self
                .user_principal_name
                .clone()
                .or_else(|| self.mail.clone())
                .unwrap_or_default(),
            email: self.mail.or(self.user_principal_name),
            display_name: self.display_name,
            given_name: self.given_name,
            family_name: self.surname,
            active: self.account_enabled.unwrap_or(true),
            attributes: HashMap::new(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzureGroup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mail_nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mail_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    security_enabled: Option<bool>,
}

impl AzureGroup {
    fn from_connector(group: &ConnectorGroup) -> Self {
        let nickname: String = group
            .name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();

        Self {
            id: None,
            display_name: Some(group.name.clone()),
            description: group.description.clone(),
            mail_nickname: Some(nickname),
            mail_enabled: Some(false),
            security_enabled: Some(true),
        }
    }

    fn into_connector(self) -> ConnectorGroup {
        ConnectorGroup {
            id: self.id,
            name: self.display_name.unwrap_or_default(),
            description: self.description,
            attributes: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AzureDirectoryObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct AzureTokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}
