//! LDAP / Active Directory connector
//!
//! Binds once at initialize and keeps the connection behind a mutex; every
//! operation runs on that single session. Users and groups are addressed by
//! DN. Membership is the group's `member` attribute.
//!
//! Credentials: `bind_dn`, `bind_password`.
//! Settings: `user_base_dn`, `group_base_dn`, optional `user_rdn_attribute`
//! (default `uid`), `user_object_classes`, `group_object_class`
//! (default `groupOfNames`), `start_tls`.
//!
//! Requires the `ldap` feature to be enabled.

use async_trait::async_trait;
use ldap3::{
    dn_escape, ldap_escape, Ldap, LdapConnAsync, LdapConnSettings, LdapError, Mod, Scope,
    SearchEntry,
};
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use accord_core::{
    connector_types, AccordError, Connector, ConnectorConfig, ConnectorGroup, ConnectorId,
    ConnectorUser, Page, PageRequest, Result,
};

// LDAP result codes (RFC 4511 Appendix A)
const RC_NO_SUCH_ATTRIBUTE: u32 = 16;
const RC_ATTRIBUTE_OR_VALUE_EXISTS: u32 = 20;
const RC_NO_SUCH_OBJECT: u32 = 32;
const RC_INVALID_CREDENTIALS: u32 = 49;
const RC_INSUFFICIENT_ACCESS: u32 = 50;
const RC_BUSY: u32 = 51;
const RC_UNAVAILABLE: u32 = 52;
const RC_ENTRY_ALREADY_EXISTS: u32 = 68;

const USER_ATTRS: [&str; 7] = ["uid", "cn", "sn", "givenName", "displayName", "mail", "description"];

pub struct LdapConnector {
    id: ConnectorId,
    name: String,
    server_url: String,
    bind_dn: String,
    bind_password: String,
    user_base_dn: String,
    group_base_dn: String,
    user_rdn_attribute: String,
    user_object_classes: Vec<String>,
    group_object_class: String,
    start_tls: bool,
    conn: Mutex<Option<Ldap>>,
}

impl LdapConnector {
    pub fn new(config: &ConnectorConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(AccordError::invalid_input("LDAP connector requires a server URL"));
        }

        let required_setting = |key: &str| -> Result<String> {
            config
                .setting_str(key)
                .map(String::from)
                .ok_or_else(|| AccordError::invalid_input(format!("LDAP connector requires '{}'", key)))
        };

        let user_object_classes = config
            .settings
            .get("user_object_classes")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect::<Vec<_>>()
            })
            .filter(|classes| !classes.is_empty())
            .unwrap_or_else(|| {
                vec![
                    "top".to_string(),
                    "person".to_string(),
                    "organizationalPerson".to_string(),
                    "inetOrgPerson".to_string(),
                ]
            });

        Ok(Self {
            id: config.id,
            name: config.name.clone(),
            server_url: config.endpoint.clone(),
            bind_dn: config.require_credential("bind_dn")?.to_string(),
            bind_password: config.require_credential("bind_password")?.to_string(),
            user_base_dn: required_setting("user_base_dn")?,
            group_base_dn: required_setting("group_base_dn")?,
            user_rdn_attribute: config
                .setting_str("user_rdn_attribute")
                .unwrap_or("uid")
                .to_string(),
            user_object_classes,
            group_object_class: config
                .setting_str("group_object_class")
                .unwrap_or("groupOfNames")
                .to_string(),
            start_tls: config.setting_bool("start_tls").unwrap_or(false),
            conn: Mutex::new(None),
        })
    }

    async fn connect(&self) -> Result<Ldap> {
        let settings = LdapConnSettings::new().set_starttls(self.start_tls);

        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &self.server_url)
            .await
            .map_err(|e| AccordError::transient(format!("LDAP connection failed: {}", e)))?;

        ldap3::drive!(conn);

        ldap.simple_bind(&self.bind_dn, &self.bind_password)
            .await
            .and_then(|r| r.success())
            .map_err(map_ldap_error)?;

        Ok(ldap)
    }

    /// Handle to the bound session. `Ldap` is a cheap clone over one
    /// connection; the lock keeps operations on it serialized.
    async fn session(&self) -> Result<tokio::sync::MutexGuard<'_, Option<Ldap>>> {
        let guard = self.conn.lock().await;
        if guard.is_none() {
            return Err(AccordError::unavailable(format!(
                "LDAP connector {} is not connected",
                self.id
            )));
        }
        Ok(guard)
    }

    fn user_dn(&self, user_name: &str) -> String {
        format!(
            "{}={},{}",
            self.user_rdn_attribute,
            dn_escape(user_name),
            self.user_base_dn
        )
    }

    fn group_dn(&self, name: &str) -> String {
        format!("cn={},{}", dn_escape(name), self.group_base_dn)
    }

    fn user_attributes(&self, user: &ConnectorUser) -> Vec<(String, HashSet<String>)> {
        let mut attrs = vec![(
            self.user_rdn_attribute.clone(),
            HashSet::from([user.user_name.clone()]),
        )];

        let cn = user
            .display_name
            .clone()
            .unwrap_or_else(|| user.user_name.clone());
        if self.user_rdn_attribute != "cn" {
            attrs.push(("cn".to_string(), HashSet::from([cn])));
        }
        attrs.push((
            "sn".to_string(),
            HashSet::from([user
                .family_name
                .clone()
                .unwrap_or_else(|| user.user_name.clone())]),
        ));

        for (attr, value) in [
            ("mail", &user.email),
            ("givenName", &user.given_name),
            ("displayName", &user.display_name),
        ] {
            if let Some(v) = value {
                attrs.push((attr.to_string(), HashSet::from([v.clone()])));
            }
        }

        attrs
    }

    async fn search_base(&self, dn: &str, attrs: Vec<&str>) -> Result<SearchEntry> {
        let mut guard = self.session().await?;
        let ldap = guard.as_mut().ok_or_else(|| AccordError::unavailable("LDAP session closed"))?;

        let (entries, _) = ldap
            .search(dn, Scope::Base, "(objectClass=*)", attrs)
            .await
            .and_then(|r| r.success())
            .map_err(map_ldap_error)?;

        entries
            .into_iter()
            .next()
            .map(SearchEntry::construct)
            .ok_or_else(|| AccordError::not_found("ldap entry", dn))
    }

    async fn search_page(
        &self,
        base: &str,
        filter: &str,
        attrs: Vec<&str>,
        page: &PageRequest,
    ) -> Result<Page<SearchEntry>> {
        let offset = match &page.cursor {
            None => 0,
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| AccordError::invalid_input(format!("bad LDAP cursor '{}'", c)))?,
        };

        let mut guard = self.session().await?;
        let ldap = guard.as_mut().ok_or_else(|| AccordError::unavailable("LDAP session closed"))?;

        let (entries, _) = ldap
            .search(base, Scope::Subtree, filter, attrs)
            .await
            .and_then(|r| r.success())
            .map_err(map_ldap_error)?;

        let mut entries: Vec<SearchEntry> = entries.into_iter().map(SearchEntry::construct).collect();
        entries.sort_by(|a, b| a.dn.cmp(&b.dn));

        let total = entries.len();
        let end = (offset + page.limit as usize).min(total);
        let items: Vec<SearchEntry> = entries.into_iter().skip(offset).take(end.saturating_sub(offset)).collect();

        Ok(Page {
            items,
            next_cursor: (end < total).then(|| end.to_string()),
            total: Some(total as u64),
        })
    }

    async fn modify(&self, dn: &str, mods: Vec<Mod<String>>) -> Result<()> {
        let mut guard = self.session().await?;
        let ldap = guard.as_mut().ok_or_else(|| AccordError::unavailable("LDAP session closed"))?;

        ldap.modify(dn, mods)
            .await
            .and_then(|r| r.success())
            .map_err(map_ldap_error)?;
        Ok(())
    }

    async fn delete_entry(&self, dn: &str) -> Result<()> {
        let mut guard = self.session().await?;
        let ldap = guard.as_mut().ok_or_else(|| AccordError::unavailable("LDAP session closed"))?;

        ldap.delete(dn)
            .await
            .and_then(|r| r.success())
            .map_err(map_ldap_error)?;
        Ok(())
    }

    async fn add_entry(&self, dn: &str, attrs: Vec<(String, HashSet<String>)>) -> Result<()> {
        let mut guard = self.session().await?;
        let ldap = guard.as_mut().ok_or_else(|| AccordError::unavailable("LDAP session closed"))?;

        ldap.add(dn, attrs)
            .await
            .and_then(|r| r.success())
            .map_err(map_ldap_error)?;
        Ok(())
    }
}

#[async_trait]
impl Connector for LdapConnector {
    fn id(&self) -> ConnectorId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn connector_type(&self) -> &str {
        connector_types::LDAP
    }

    #[instrument(skip(self, _config), fields(connector_id = %self.id))]
    async fn initialize(&mut self, _config: &ConnectorConfig) -> Result<()> {
        let ldap = self.connect().await?;
        *self.conn.get_mut() = Some(ldap);

        info!("LDAP connector bound to {}", self.server_url);
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        self.search_base("", vec!["namingContexts"]).await?;
        Ok(true)
    }

    async fn close(&self) -> Result<()> {
        let taken = self.conn.lock().await.take();
        if let Some(mut ldap) = taken {
            debug!(connector_id = %self.id, "Unbinding LDAP session");
            if let Err(e) = ldap.unbind().await {
                warn!(connector_id = %self.id, "LDAP unbind failed: {}", e);
            }
        }
        Ok(())
    }

    #[instrument(skip(self, user), fields(connector_id = %self.id))]
    async fn create_user(&self, user: &ConnectorUser) -> Result<ConnectorUser> {
        let dn = self.user_dn(&user.user_name);

        let mut attrs = vec![(
            "objectClass".to_string(),
            self.user_object_classes.iter().cloned().collect::<HashSet<_>>(),
        )];
        attrs.extend(self.user_attributes(user));

        self.add_entry(&dn, attrs).await?;

        let mut created = user.clone();
        created.id = Some(dn);
        Ok(created)
    }

    async fn get_user(&self, user_id: &str) -> Result<ConnectorUser> {
        let entry = self.search_base(user_id, USER_ATTRS.to_vec()).await?;
        Ok(self.entry_to_user(entry))
    }

    #[instrument(skip(self, user), fields(connector_id = %self.id))]
    async fn update_user(&self, user_id: &str, user: &ConnectorUser) -> Result<ConnectorUser> {
        let mods = self
            .user_attributes(user)
            .into_iter()
            .filter(|(attr, _)| *attr != self.user_rdn_attribute)
            .map(|(attr, values)| Mod::Replace(attr, values))
            .collect();

        self.modify(user_id, mods).await?;

        let mut updated = user.clone();
        updated.id = Some(user_id.to_string());
        Ok(updated)
    }

    #[instrument(skip(self), fields(connector_id = %self.id))]
    async fn delete_user(&self, user_id: &str) -> Result<()> {
        self.delete_entry(user_id).await
    }

    async fn list_users(&self, page: &PageRequest) -> Result<Page<ConnectorUser>> {
        let filter = format!(
            "(objectClass={})",
            ldap_escape(self.user_object_classes.last().map(String::as_str).unwrap_or("person"))
        );
        let page = self
            .search_page(&self.user_base_dn, &filter, USER_ATTRS.to_vec(), page)
            .await?;

        Ok(Page {
            items: page.items.into_iter().map(|e| self.entry_to_user(e)).collect(),
            next_cursor: page.next_cursor,
            total: page.total,
        })
    }

    #[instrument(skip(self, group), fields(connector_id = %self.id))]
    async fn create_group(&self, group: &ConnectorGroup) -> Result<ConnectorGroup> {
        let dn = self.group_dn(&group.name);

        let mut attrs = vec![
            (
                "objectClass".to_string(),
                HashSet::from(["top".to_string(), self.group_object_class.clone()]),
            ),
            ("cn".to_string(), HashSet::from([group.name.clone()])),
        ];
        if let Some(description) = &group.description {
            attrs.push(("description".to_string(), HashSet::from([description.clone()])));
        }
        if let Some(initial) = group.attributes.get("initial_member").and_then(|v| v.as_str()) {
            attrs.push(("member".to_string(), HashSet::from([initial.to_string()])));
        }

        self.add_entry(&dn, attrs).await?;

        let mut created = group.clone();
        created.id = Some(dn);
        Ok(created)
    }

    async fn get_group(&self, group_id: &str) -> Result<ConnectorGroup> {
        let entry = self.search_base(group_id, vec!["cn", "description"]).await?;
        Ok(entry_to_group(entry))
    }

    #[instrument(skip(self, group), fields(connector_id = %self.id))]
    async fn update_group(&self, group_id: &str, group: &ConnectorGroup) -> Result<ConnectorGroup> {
        let description: HashSet<String> = group.description.iter().cloned().collect();
        self.modify(group_id, vec![Mod::Replace("description".to_string(), description)])
            .await?;

        let mut updated = group.clone();
        updated.id = Some(group_id.to_string());
        Ok(updated)
    }

    #[instrument(skip(self), fields(connector_id = %self.id))]
    async fn delete_group(&self, group_id: &str) -> Result<()> {
        self.delete_entry(group_id).await
    }

    async fn list_groups(&self, page: &PageRequest) -> Result<Page<ConnectorGroup>> {
        let filter = format!("(objectClass={})", ldap_escape(&self.group_object_class));
        let page = self
            .search_page(&self.group_base_dn, &filter, vec!["cn", "description"], page)
            .await?;

        Ok(Page {
            items: page.items.into_iter().map(entry_to_group).collect(),
            next_cursor: page.next_cursor,
            total: page.total,
        })
    }

    #[instrument(skip(self), fields(connector_id = %self.id))]
    async fn add_user_to_group(&self, group_id: &str, user_id: &str) -> Result<()> {
        self.modify(
            group_id,
            vec![Mod::Add("member".to_string(), HashSet::from([user_id.to_string()]))],
        )
        .await
    }

    #[instrument(skip(self), fields(connector_id = %self.id))]
    async fn remove_user_from_group(&self, group_id: &str, user_id: &str) -> Result<()> {
        self.modify(
            group_id,
            vec![Mod::Delete("member".to_string(), HashSet::from([user_id.to_string()]))],
        )
        .await
    }

    async fn get_group_members(&self, group_id: &str) -> Result<Vec<String>> {
        let entry = self.search_base(group_id, vec!["member"]).await?;
        Ok(entry.attrs.get("member").cloned().unwrap_or_default())
    }
}

impl LdapConnector {
    fn entry_to_user(&self, entry: SearchEntry) -> ConnectorUser {
        let get_attr =
            |name: &str| -> Option<String> { entry.attrs.get(name)?.first().cloned() };

        let mut attributes = HashMap::new();
        if let Some(description) = get_attr("description") {
            attributes.insert("description".to_string(), serde_json::json!(description));
        }

        ConnectorUser {
            user_name: get_attr(&self.user_rdn_attribute)
                .or_else(|| get_attr("uid"))
                .or_else(|| get_attr("cn"))
                .unwrap_or_default(),
            email: get_attr("mail"),
            display_name: get_attr("displayName"),
            given_name: get_attr("givenName"),
            family_name: get_attr("sn"),
            active: true,
            attributes,
            id: Some(entry.dn.clone()),
        }
    }
}

fn entry_to_group(entry: SearchEntry) -> ConnectorGroup {
    let get_attr = |name: &str| -> Option<String> { entry.attrs.get(name)?.first().cloned() };

    ConnectorGroup {
        name: get_attr("cn").unwrap_or_default(),
        description: get_attr("description"),
        attributes: HashMap::new(),
        id: Some(entry.dn.clone()),
    }
}

/// Map an LDAP failure onto the error taxonomy
fn map_ldap_error(e: LdapError) -> AccordError {
    match e {
        LdapError::LdapResult { result } => {
            let detail = format!("LDAP rc={} {}", result.rc, result.text);
            match result.rc {
                RC_NO_SUCH_OBJECT | RC_NO_SUCH_ATTRIBUTE => {
                    AccordError::not_found("ldap entry", result.matched)
                }
                RC_ENTRY_ALREADY_EXISTS | RC_ATTRIBUTE_OR_VALUE_EXISTS => {
                    AccordError::conflict(detail)
                }
                RC_INVALID_CREDENTIALS => AccordError::unauthenticated(detail),
                RC_INSUFFICIENT_ACCESS => AccordError::forbidden(detail),
                RC_BUSY | RC_UNAVAILABLE => AccordError::transient(detail),
                _ => AccordError::permanent(detail),
            }
        }
        other => AccordError::transient(format!("LDAP operation failed: {}", other)),
    }
}
