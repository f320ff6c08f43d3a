//! Google Workspace connector over the Admin SDK Directory API
//!
//! Authenticates as a service account with domain-wide delegation: a signed
//! RS256 assertion impersonating the admin is exchanged for an access token,
//! which is cached until shortly before expiry. Listing uses `pageToken`.
//!
//! Credentials: `service_account_key` (the JSON key file), `admin_email`.
//! Settings: optional `customer` (defaults to `my_customer`).

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, instrument};

use accord_core::{
    connector_types, AccordError, Connector, ConnectorConfig, ConnectorGroup, ConnectorId,
    ConnectorUser, Page, PageRequest, Result,
};

use super::common::*;

const DIRECTORY_BASE_URL: &str = "https://admin.googleapis.com/admin/directory/v1";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const DIRECTORY_SCOPES: &str = "https://www.googleapis.com/auth/admin.directory.user \
https://www.googleapis.com/auth/admin.directory.group";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;

pub struct GoogleWorkspaceConnector {
    id: ConnectorId,
    name: String,
    base_url: String,
    customer: String,
    service_account: ServiceAccountKey,
    signing_key: EncodingKey,
    admin_email: String,
    http_client: HttpClient,
    tokens: TokenCache,
}

impl GoogleWorkspaceConnector {
    pub fn new(config: &ConnectorConfig) -> Result<Self> {
        let key_json = config.require_credential("service_account_key")?;
        let service_account: ServiceAccountKey = serde_json::from_str(key_json).map_err(|e| {
            AccordError::invalid_input(format!("service_account_key is not a valid key file: {}", e))
        })?;
        let signing_key = EncodingKey::from_rsa_pem(service_account.private_key.as_bytes())
            .map_err(|e| {
                AccordError::invalid_input(format!("service account private key is invalid: {}", e))
            })?;

        let base_url = if config.endpoint.trim().is_empty() {
            DIRECTORY_BASE_URL.to_string()
        } else {
            config.endpoint.trim_end_matches('/').to_string()
        };

        Ok(Self {
            id: config.id,
            name: config.name.clone(),
            base_url,
            customer: config
                .setting_str("customer")
                .unwrap_or("my_customer")
                .to_string(),
            service_account,
            signing_key,
            admin_email: config.require_credential("admin_email")?.to_string(),
            http_client: HttpClient::from_config(config)?,
            tokens: TokenCache::new(),
        })
    }

    fn token_uri(&self) -> &str {
        self.service_account
            .token_uri
            .as_deref()
            .unwrap_or(DEFAULT_TOKEN_URI)
    }

    /// Signed assertion impersonating the admin user
    fn assertion(&self) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &self.service_account.client_email,
            sub: &self.admin_email,
            scope: DIRECTORY_SCOPES,
            aud: self.token_uri(),
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };

        encode(&Header::new(Algorithm::RS256), &claims, &self.signing_key)
            .map_err(|e| AccordError::permanent(format!("Failed to sign assertion: {}", e)))
    }

    async fn admin_token(&self) -> Result<String> {
        self.tokens
            .get_or_fetch(|| async {
                debug!("Exchanging service account assertion for access token");
                let assertion = self.assertion()?;
                let params = [("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())];

                let response = self
                    .http_client
                    .execute_with_retry(self.http_client.inner().post(self.token_uri()).form(&params))
                    .await?;

                let token: GoogleTokenResponse = decode_json(response, "token response").await?;
                Ok::<_, AccordError>(IssuedToken {
                    access_token: token.access_token,
                    expires_in: token.expires_in.unwrap_or(3600),
                })
            })
            .await
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    async fn request(&self, method: Method, url: &str) -> Result<RequestBuilder> {
        let token = self.admin_token().await?;
        Ok(self
            .http_client
            .inner()
            .request(method, url)
            .bearer_auth(token))
    }

    async fn admin_get<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T> {
        let builder = self.request(Method::GET, url).await?;
        let response = self.http_client.execute_with_retry(builder).await?;
        decode_json(response, "Directory API response").await
    }

    async fn admin_send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let mut builder = self.request(method, &self.url(path)).await?;
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        self.http_client.send(builder).await
    }

    fn page_url(&self, collection: &str, extra: &str, page: &PageRequest) -> String {
        let mut url = format!(
            "{}?maxResults={}{}",
            self.url(collection),
            page.limit,
            extra
        );
        if let Some(token) = &page.cursor {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }
        url
    }
}

#[async_trait]
impl Connector for GoogleWorkspaceConnector {
    fn id(&self) -> ConnectorId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn connector_type(&self) -> &str {
        connector_types::GOOGLE
    }

    #[instrument(skip(self, _config), fields(connector_id = %self.id))]
    async fn initialize(&mut self, _config: &ConnectorConfig) -> Result<()> {
        self.admin_token().await?;
        info!("Google Workspace connector authenticated");
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!(
            "{}?customer={}&maxResults=1",
            self.url("users"),
            urlencoding::encode(&self.customer)
        );
        let _: GoogleUserList = self.admin_get(&url).await?;
        Ok(true)
    }

    async fn close(&self) -> Result<()> {
        self.tokens.invalidate().await;
        Ok(())
    }

    #[instrument(skip(self, user), fields(connector_id = %self.id))]
    async fn create_user(&self, user: &ConnectorUser) -> Result<ConnectorUser> {
        let mut body = serde_json::to_value(GoogleUser::from_connector(user))?;
        if let Some(password) = user.attributes.get("password").and_then(|v| v.as_str()) {
            body["password"] = serde_json::json!(password);
            body["changePasswordAtNextLogin"] = serde_json::json!(true);
        }

        let response = self.admin_send(Method::POST, "users", Some(body)).await?;
        let created: GoogleUser = decode_json(response, "Directory user").await?;
        Ok(created.into_connector())
    }

    async fn get_user(&self, user_id: &str) -> Result<ConnectorUser> {
        let user: GoogleUser = self
            .admin_get(&self.url(&format!("users/{}", urlencoding::encode(user_id))))
            .await?;
        Ok(user.into_connector())
    }

    #[instrument(skip(self, user), fields(connector_id = %self.id))]
    async fn update_user(&self, user_id: &str, user: &ConnectorUser) -> Result<ConnectorUser> {
        let mut body = GoogleUser::from_connector(user);
        body.id = None;

        let response = self
            .admin_send(
                Method::PUT,
                &format!("users/{}", urlencoding::encode(user_id)),
                Some(serde_json::to_value(body)?),
            )
            .await?;
        let updated: GoogleUser = decode_json(response, "Directory user").await?;
        Ok(updated.into_connector())
    }

    #[instrument(skip(self), fields(connector_id = %self.id))]
    async fn delete_user(&self, user_id: &str) -> Result<()> {
        self.admin_send(
            Method::DELETE,
            &format!("users/{}", urlencoding::encode(user_id)),
            None,
        )
        .await?;
        Ok(())
    }

    async fn list_users(&self, page: &PageRequest) -> Result<Page<ConnectorUser>> {
        let extra = format!("&customer={}", urlencoding::encode(&self.customer));
        let list: GoogleUserList = self.admin_get(&self.page_url("users", &extra, page)).await?;

        Ok(Page {
            items: list
                .users
                .into_iter()
                .map(GoogleUser::into_connector)
                .collect(),
            next_cursor: list.next_page_token,
            total: None,
        })
    }

    #[instrument(skip(self, group), fields(connector_id = %self.id))]
    async fn create_group(&self, group: &ConnectorGroup) -> Result<ConnectorGroup> {
        let body = serde_json::to_value(GoogleGroup::from_connector(group)?)?;
        let response = self.admin_send(Method::POST, "groups", Some(body)).await?;
        let created: GoogleGroup = decode_json(response, "Directory group").await?;
        Ok(created.into_connector())
    }

    async fn get_group(&self, group_id: &str) -> Result<ConnectorGroup> {
        let group: GoogleGroup = self
            .admin_get(&self.url(&format!("groups/{}", urlencoding::encode(group_id))))
            .await?;
        Ok(group.into_connector())
    }

    #[instrument(skip(self, group), fields(connector_id = %self.id))]
    async fn update_group(&self, group_id: &str, group: &ConnectorGroup) -> Result<ConnectorGroup> {
        let body = serde_json::json!({
            "name": group.name,
            "description": group.description,
        });

        let response = self
            .admin_send(
                Method::PATCH,
                &format!("groups/{}", urlencoding::encode(group_id)),
                Some(body),
            )
            .await?;
        let updated: GoogleGroup = decode_json(response, "Directory group").await?;
        Ok(updated.into_connector())
    }

    #[instrument(skip(self), fields(connector_id = %self.id))]
    async fn delete_group(&self, group_id: &str) -> Result<()> {
        self.admin_send(
            Method::DELETE,
            &format!("groups/{}", urlencoding::encode(group_id)),
            None,
        )
        .await?;
        Ok(())
    }

    async fn list_groups(&self, page: &PageRequest) -> Result<Page<ConnectorGroup>> {
        let extra = format!("&customer={}", urlencoding::encode(&self.customer));
        let list: GoogleGroupList = self.admin_get(&self.page_url("groups", &extra, page)).await?;

        Ok(Page {
            items: list
                .groups
                .into_iter()
                .map(GoogleGroup::into_connector)
                .collect(),
            next_cursor: list.next_page_token,
            total: None,
        })
    }

    #[instrument(skip(self), fields(connector_id = %self.id))]
    async fn add_user_to_group(&self, group_id: &str, user_id: &str) -> Result<()> {
        let member = if user_id.contains('@') {
            serde_json::json!({ "email": user_id, "role": "MEMBER" })
        } else {
            serde_json::json!({ "id": user_id, "role": "MEMBER" })
        };

        self.admin_send(
            Method::POST,
            &format!("groups/{}/members", urlencoding::encode(group_id)),
            Some(member),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(connector_id = %self.id))]
    async fn remove_user_from_group(&self, group_id: &str, user_id: &str) -> Result<()> {
        self.admin_send(
            Method::DELETE,
            &format!(
                "groups/{}/members/{}",
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
        let mut page = PageRequest::first(200);
        let collection = format!("groups/{}/members", urlencoding::encode(group_id));

        loop {
            let list: GoogleMemberList = self.admin_get(&self.page_url(&collection, "", &page)).await?;
            members.extend(list.members.into_iter().map(|m| m.id));

            match list.next_page_token {
                Some(next) => page = PageRequest::after(next, page.limit),
                None => break,
            }
        }

        Ok(members)
    }
}

// =============================================================================
// Google API Types
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct GoogleTokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleUserList {
    #[serde(default)]
    users: Vec<GoogleUser>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleGroupList {
    #[serde(default)]
    groups: Vec<GoogleGroup>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleMemberList {
    #[serde(default)]
    members: Vec<GoogleMember>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleMember {
    id: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleUser {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    primary_email: String,
    #[serde(default)]
    name: Option<GoogleUserName>,
    #[serde(default)]
    suspended: Option<bool>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleUserName {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    given_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    family_name: Option<String>,
}

impl GoogleUser {
    fn from_connector(user: &ConnectorUser) -> Self {
        Self {
            id: user.id.clone(),
            primary_email: user.email.clone().unwrap_or_else(|| user.user_name.clone()),
            name: Some(GoogleUserName {
                full_name: None,
                given_name: user.given_name.clone(),
                family_name: user.family_name.clone(),
            }),
            suspended: Some(!user.active),
        }
    }

    fn into_connector(self) -> ConnectorUser {
        let name = self.name.unwrap_or_default();
        ConnectorUser {
            id: self.id,
            user_name: self.primary_email.clone(),
            email: Some(self.primary_email),
            display_name: name.full_name,
            given_name: name.given_name,
            family_name: name.family_name,
            active: !self.suspended.unwrap_or(false),
            attributes: HashMap::new(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GoogleGroup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    email: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

impl GoogleGroup {
    /// Directory groups are addressed by email; take it from the `email`
    /// attribute or from a name that already is one
    fn from_connector(group: &ConnectorGroup) -> Result<Self> {
        let email = group
            .attributes
            .get("email")
            .and_then(|v| v.as_str())
            .map(String::from)
            .or_else(|| group.name.contains('@').then(|| group.name.clone()))
            .ok_or_else(|| AccordError::invalid_input("Google groups need an email address"))?;

        Ok(Self {
            id: None,
            email,
            name: Some(group.name.clone()),
            description: group.description.clone(),
        })
    }

    fn into_connector(self) -> ConnectorGroup {
        let mut attributes = HashMap::new();
        attributes.insert("email".to_string(), serde_json::json!(self.email));

        ConnectorGroup {
            id: self.id,
            name: self.name.unwrap_or_else(|| self.email.clone()),
            description: self.description,
            attributes,
        }
    }
}
