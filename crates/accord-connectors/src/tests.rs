//! Tests for the connector registry, connector service and adapters

// =============================================================================
// Registry Tests
// =============================================================================

#[cfg(test)]
mod registry_tests {
    use crate::registry::ConnectorRegistry;
    use crate::testing::{Outcome, Script, SCRIPTED_TYPE};
    use accord_core::{AccordError, Connector, ConnectorConfig, ConnectorId, TenantId};
    use std::time::Duration;

    fn config() -> ConnectorConfig {
        ConnectorConfig::new(TenantId::new(), "scripted", SCRIPTED_TYPE, "")
    }

    async fn registry_with(script: &Script) -> ConnectorRegistry {
        let registry = ConnectorRegistry::new();
        registry.register(SCRIPTED_TYPE, script.factory()).await;
        registry
    }

    #[tokio::test]
    async fn test_unknown_type() {
        let registry = ConnectorRegistry::new();
        let err = registry.create("nope", &config()).await.err().unwrap();
        assert!(matches!(err, AccordError::UnknownType { .. }));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let script = Script::new();
        let registry = registry_with(&script).await;
        let config = config();

        let registration = registry.create(SCRIPTED_TYPE, &config).await.unwrap();
        assert!(registration.replaced.is_none());
        assert_eq!(registration.instance.id(), config.id);

        assert!(registry.contains(config.id).await);
        assert_eq!(registry.len().await, 1);
        assert_eq!(script.initializations(), 1);
        assert_eq!(registry.registered_types().await, vec![SCRIPTED_TYPE.to_string()]);
    }

    #[tokio::test]
    async fn test_create_replaces_and_hands_back_previous() {
        let script = Script::new();
        let registry = registry_with(&script).await;
        let config = config();

        registry.create(SCRIPTED_TYPE, &config).await.unwrap();
        let second = registry.create(SCRIPTED_TYPE, &config).await.unwrap();

        let replaced = second.replaced.expect("previous instance");
        assert_eq!(registry.len().await, 1);
        assert_eq!(script.closes(), 0);

        replaced.close().await.unwrap();
        assert_eq!(script.closes(), 1);
    }

    #[tokio::test]
    async fn test_failed_initialize_is_closed_and_not_stored() {
        let script = Script::new();
        script.fail_initialize(true);
        let registry = registry_with(&script).await;
        let config = config();

        let err = registry.create(SCRIPTED_TYPE, &config).await.err().unwrap();
        assert!(matches!(err, AccordError::Unauthenticated { .. }));
        assert!(!registry.contains(config.id).await);
        assert_eq!(script.closes(), 1);
    }

    #[tokio::test]
    async fn test_remove() {
        let script = Script::new();
        let registry = registry_with(&script).await;
        let config = config();
        registry.create(SCRIPTED_TYPE, &config).await.unwrap();

        registry.remove(config.id).await.unwrap();
        assert!(!registry.contains(config.id).await);
        assert_eq!(script.closes(), 1);

        assert!(registry.remove(config.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_remove_unknown_leaves_instances_untouched() {
        let script = Script::new();
        let registry = registry_with(&script).await;
        let live = config();
        registry.create(SCRIPTED_TYPE, &live).await.unwrap();

        let unknown = ConnectorId::new();
        assert!(registry.remove(unknown).await.unwrap_err().is_not_found());

        assert_eq!(registry.len().await, 1);
        assert!(registry.contains(live.id).await);
        assert!(registry.get(live.id).await.is_some());
        assert_eq!(script.closes(), 0);
    }

    #[tokio::test]
    async fn test_health_check_bounded_by_deadline() {
        let healthy = Script::new();
        let slow = Script::new();
        slow.set_delay(Duration::from_millis(500));

        let registry = ConnectorRegistry::new();
        registry.register("healthy", healthy.factory()).await;
        registry.register("slow", slow.factory()).await;

        let a = config();
        let b = config();
        registry.create("healthy", &a).await.unwrap();
        registry.create("slow", &b).await.unwrap();

        let report = registry.health_check(Duration::from_millis(50)).await;
        assert_eq!(report.get(&a.id), Some(&true));
        assert_eq!(report.get(&b.id), Some(&false));
    }

    #[tokio::test]
    async fn test_close_all_drains() {
        let script = Script::new();
        script.always(Outcome::Ok);
        let registry = registry_with(&script).await;
        for _ in 0..3 {
            registry.create(SCRIPTED_TYPE, &config()).await.unwrap();
        }

        registry.close_all().await;
        assert!(registry.is_empty().await);
        assert_eq!(script.closes(), 3);
    }
}

// =============================================================================
// Service Tests
// =============================================================================

#[cfg(test)]
mod service_tests {
    use crate::registry::ConnectorRegistry;
    use crate::service::{ConnectorService, ServiceSettings};
    use crate::testing::{Script, SCRIPTED_TYPE};
    use accord_core::{
        ConfigStore, Connector, ConnectorConfig, ConnectorId, CreateConnectorRequest,
        Credentials, TenantId, UpdateConnectorRequest,
    };
    use accord_db::InMemoryConfigStore;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        service: ConnectorService<InMemoryConfigStore>,
        store: Arc<InMemoryConfigStore>,
        script: Script,
    }

    async fn fixture() -> Fixture {
        let script = Script::new();
        let registry = Arc::new(ConnectorRegistry::new());
        registry.register(SCRIPTED_TYPE, script.factory()).await;

        let store = Arc::new(InMemoryConfigStore::new());
        let service = ConnectorService::with_settings(
            store.clone(),
            registry,
            ServiceSettings {
                operation_timeout: Duration::from_millis(200),
            },
        );

        Fixture {
            service,
            store,
            script,
        }
    }

    fn request(connector_type: &str) -> CreateConnectorRequest {
        let mut credentials = Credentials::new();
        credentials.insert("token", "secret-token");
        CreateConnectorRequest {
            name: "directory".to_string(),
            connector_type: connector_type.to_string(),
            endpoint: "https://idp.example.com".to_string(),
            credentials,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_brings_connector_live() {
        let f = fixture().await;
        let tenant = TenantId::new();

        let config = f
            .service
            .create_connector(tenant, request(SCRIPTED_TYPE))
            .await
            .unwrap();

        assert!(config.enabled);
        assert!(f.service.is_live(config.id).await);
        assert!(f.store.get(tenant, config.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_create_keeps_config_when_instantiation_fails() {
        let f = fixture().await;
        let tenant = TenantId::new();

        let config = f
            .service
            .create_connector(tenant, request("unregistered"))
            .await
            .unwrap();

        assert!(!f.service.is_live(config.id).await);
        assert!(f.store.get(tenant, config.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_create_validates_request() {
        let f = fixture().await;
        let mut bad = request(SCRIPTED_TYPE);
        bad.name = "  ".to_string();
        assert!(f.service.create_connector(TenantId::new(), bad).await.is_err());
    }

    #[tokio::test]
    async fn test_get_is_tenant_scoped() {
        let f = fixture().await;
        let config = f
            .service
            .create_connector(TenantId::new(), request(SCRIPTED_TYPE))
            .await
            .unwrap();

        let err = f
            .service
            .get_connector(TenantId::new(), config.id)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_redacts_credentials() {
        let f = fixture().await;
        let tenant = TenantId::new();
        f.service
            .create_connector(tenant, request(SCRIPTED_TYPE))
            .await
            .unwrap();

        let listed = f.service.list_connectors(tenant).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].credential_keys, vec!["token".to_string()]);
        let json = serde_json::to_string(&listed[0]).unwrap();
        assert!(!json.contains("secret-token"));
    }

    #[tokio::test]
    async fn test_update_rebuilds_instance_and_merges_credentials() {
        let f = fixture().await;
        let tenant = TenantId::new();
        let config = f
            .service
            .create_connector(tenant, request(SCRIPTED_TYPE))
            .await
            .unwrap();

        let mut extra = Credentials::new();
        extra.insert("refresh", "r-1");
        let updated = f
            .service
            .update_connector(
                tenant,
                config.id,
                UpdateConnectorRequest {
                    name: Some("renamed".to_string()),
                    credentials: Some(extra),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.credential("token"), Some("secret-token"));
        assert_eq!(updated.credential("refresh"), Some("r-1"));

        assert_eq!(f.script.builds(), 2);
        assert_eq!(f.script.closes(), 1);
        let live = f.service.registry().get(config.id).await.unwrap();
        assert_eq!(live.name(), "renamed");
    }

    #[tokio::test]
    async fn test_toggle() {
        let f = fixture().await;
        let tenant = TenantId::new();
        let config = f
            .service
            .create_connector(tenant, request(SCRIPTED_TYPE))
            .await
            .unwrap();

        let disabled = f
            .service
            .toggle_connector(tenant, config.id, false)
            .await
            .unwrap();
        assert!(!disabled.enabled);
        assert!(!f.service.is_live(config.id).await);
        assert_eq!(f.script.closes(), 1);

        f.service
            .toggle_connector(tenant, config.id, true)
            .await
            .unwrap();
        assert!(f.service.is_live(config.id).await);
        assert_eq!(f.script.builds(), 2);
    }

    #[tokio::test]
    async fn test_update_of_disabled_connector_stays_offline() {
        let f = fixture().await;
        let tenant = TenantId::new();
        let config = f
            .service
            .create_connector(tenant, request(SCRIPTED_TYPE))
            .await
            .unwrap();
        f.service
            .toggle_connector(tenant, config.id, false)
            .await
            .unwrap();

        f.service
            .update_connector(
                tenant,
                config.id,
                UpdateConnectorRequest {
                    endpoint: Some("https://other.example.com".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(!f.service.is_live(config.id).await);
        assert_eq!(f.script.builds(), 1);
    }

    #[tokio::test]
    async fn test_delete_closes_instance() {
        let f = fixture().await;
        let tenant = TenantId::new();
        let config = f
            .service
            .create_connector(tenant, request(SCRIPTED_TYPE))
            .await
            .unwrap();

        f.service.delete_connector(tenant, config.id).await.unwrap();
        assert!(!f.service.is_live(config.id).await);
        assert!(f.store.get(tenant, config.id).await.unwrap().is_none());
        assert_eq!(f.script.closes(), 1);

        let err = f
            .service
            .delete_connector(tenant, config.id)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_test_connection_leaves_registry_alone() {
        let f = fixture().await;
        let tenant = TenantId::new();
        let config = f
            .service
            .create_connector(tenant, request(SCRIPTED_TYPE))
            .await
            .unwrap();
        let live_before = f.service.registry().get(config.id).await.unwrap();

        assert!(f.service.test_connection(&config).await.unwrap());

        let live_after = f.service.registry().get(config.id).await.unwrap();
        assert!(Arc::ptr_eq(&live_before, &live_after));
        assert_eq!(f.service.registry().len().await, 1);
        assert_eq!(f.script.builds(), 2);
        assert_eq!(f.script.closes(), 1);
    }

    #[tokio::test]
    async fn test_test_connection_reports_unhealthy() {
        let f = fixture().await;
        f.script.set_healthy(false);
        let config = ConnectorConfig::new(TenantId::new(), "candidate", SCRIPTED_TYPE, "");

        assert!(!f.service.test_connection(&config).await.unwrap());
        assert!(f.service.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_test_connection_times_out() {
        let f = fixture().await;
        f.script.set_delay(Duration::from_secs(2));
        let config = ConnectorConfig::new(TenantId::new(), "candidate", SCRIPTED_TYPE, "");

        let err = f.service.test_connection(&config).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(f.script.closes(), 1);
    }

    #[tokio::test]
    async fn test_load_enabled() {
        let f = fixture().await;
        let tenant = TenantId::new();

        let live = f
            .service
            .create_connector(tenant, request(SCRIPTED_TYPE))
            .await
            .unwrap();
        let off = f
            .service
            .create_connector(tenant, request(SCRIPTED_TYPE))
            .await
            .unwrap();
        f.service.toggle_connector(tenant, off.id, false).await.unwrap();
        f.service
            .create_connector(tenant, request("unregistered"))
            .await
            .unwrap();

        f.service.registry().close_all().await;

        let loaded = f.service.load_enabled().await.unwrap();
        assert_eq!(loaded, 1);
        assert!(f.service.is_live(live.id).await);
        assert!(!f.service.is_live(off.id).await);
        assert!(!f.service.is_live(ConnectorId::new()).await);
    }
}

// =============================================================================
// SCIM Adapter Tests
// =============================================================================

#[cfg(test)]
mod scim_tests {
    use crate::providers::scim::ScimConnector;
    use accord_core::{
        AccordError, Connector, ConnectorConfig, ConnectorUser, Credentials, PageRequest,
        TenantId,
    };
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> ConnectorConfig {
        let mut credentials = Credentials::new();
        credentials.insert("token", "scim-token");
        ConnectorConfig::new(
            TenantId::new(),
            "scim",
            "scim",
            format!("{}/scim/v2", server.uri()),
        )
        .with_credentials(credentials)
        .with_setting("max_retries", json!(0))
    }

    #[test]
    fn test_requires_credentials() {
        let config = ConnectorConfig::new(TenantId::new(), "scim", "scim", "https://x.example.com");
        assert!(ScimConnector::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_create_user() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/scim/v2/Users"))
            .and(header("authorization", "Bearer scim-token"))
            .and(header("content-type", "application/scim+json"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "schemas": ["urn:ietf:params:scim:schemas:core:2.0:User"],
                "id": "remote-1",
                "userName": "ada@example.com",
                "active": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        let connector = ScimConnector::new(&config(&server)).unwrap();
        let created = connector
            .create_user(&ConnectorUser::new("ada@example.com").with_email("ada@example.com"))
            .await
            .unwrap();

        assert_eq!(created.id.as_deref(), Some("remote-1"));
        assert_eq!(created.user_name, "ada@example.com");
    }

    #[tokio::test]
    async fn test_resource_ids_stay_in_one_path_segment() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/scim/v2/Users/..%2FGroups%2Fadmins"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/scim/v2/Users/u1%3Fx%3D1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let connector = ScimConnector::new(&config(&server)).unwrap();
        connector.delete_user("../Groups/admins").await.unwrap();
        connector.delete_user("u1?x=1").await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.url.query().is_none()));
        assert!(requests
            .iter()
            .all(|r| r.url.path().starts_with("/scim/v2/Users/")));

        let err = connector.delete_group("..").await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/scim/v2/Users"))
            .respond_with(ResponseTemplate::new(409).set_body_string("uniqueness"))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/scim/v2/Users/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/scim/v2/Users/busy"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/scim/v2/Users/locked"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let connector = ScimConnector::new(&config(&server)).unwrap();

        let err = connector
            .create_user(&ConnectorUser::new("dup"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        assert!(connector.delete_user("gone").await.unwrap_err().is_not_found());
        assert!(connector.delete_user("busy").await.unwrap_err().is_retryable());
        assert!(matches!(
            connector.delete_user("locked").await.unwrap_err(),
            AccordError::Forbidden { .. }
        ));
    }

    #[tokio::test]
    async fn test_list_users_pagination() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/scim/v2/Users"))
            .and(query_param("startIndex", "1"))
            .and(query_param("count", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "totalResults": 3,
                "Resources": [
                    {"id": "1", "userName": "a"},
                    {"id": "2", "userName": "b"}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/scim/v2/Users"))
            .and(query_param("startIndex", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "totalResults": 3,
                "Resources": [{"id": "3", "userName": "c"}]
            })))
            .mount(&server)
            .await;

        let connector = ScimConnector::new(&config(&server)).unwrap();

        let first = connector.list_users(&PageRequest::first(2)).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.next_cursor.as_deref(), Some("3"));
        assert_eq!(first.total, Some(3));

        let second = connector
            .list_users(&PageRequest::after("3", 2))
            .await
            .unwrap();
        assert_eq!(second.items[0].user_name, "c");
        assert!(!second.has_more());
    }

    #[tokio::test]
    async fn test_membership_patch_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/scim/v2/Groups/g-1"))
            .and(body_json(json!({
                "schemas": ["urn:ietf:params:scim:api:messages:2.0:PatchOp"],
                "Operations": [{"op": "add", "path": "members", "value": [{"value": "u-1"}]}]
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/scim/v2/Groups/g-1"))
            .and(body_json(json!({
                "schemas": ["urn:ietf:params:scim:api:messages:2.0:PatchOp"],
                "Operations": [{"op": "remove", "path": "members[value eq \"u-1\"]"}]
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let connector = ScimConnector::new(&config(&server)).unwrap();
        connector.add_user_to_group("g-1", "u-1").await.unwrap();
        connector.remove_user_from_group("g-1", "u-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_group_members() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/scim/v2/Groups/g-1"))
            .and(query_param("attributes", "members"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "g-1",
                "displayName": "Engineering",
                "members": [{"value": "u-1"}, {"value": "u-2"}]
            })))
            .mount(&server)
            .await;

        let connector = ScimConnector::new(&config(&server)).unwrap();
        let members = connector.get_group_members("g-1").await.unwrap();
        assert_eq!(members, vec!["u-1".to_string(), "u-2".to_string()]);
    }

    #[tokio::test]
    async fn test_health_check() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/scim/v2/ServiceProviderConfig"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"patch": {"supported": true}})))
            .mount(&server)
            .await;

        let connector = ScimConnector::new(&config(&server)).unwrap();
        assert!(connector.health_check().await.unwrap());
    }

    #[test]
    fn test_filter_value_escaping() {
        assert_eq!(
            crate::providers::scim::escape_filter_value(r#"a"b\c"#),
            r#"a\"b\\c"#
        );
    }
}

// =============================================================================
// Azure AD Adapter Tests
// =============================================================================

#[cfg(test)]
mod azure_tests {
    use crate::providers::azure::AzureAdConnector;
    use accord_core::{Connector, ConnectorConfig, ConnectorUser, Credentials, TenantId};
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> ConnectorConfig {
        let mut credentials = Credentials::new();
        credentials.insert("client_id", "app");
        credentials.insert("client_secret", "shh");
        ConnectorConfig::new(TenantId::new(), "entra", "azure_ad", server.uri())
            .with_credentials(credentials)
            .with_setting("token_url", json!(format!("{}/token", server.uri())))
            .with_setting("max_retries", json!(0))
    }

    async fn mount_token(server: &MockServer, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "graph-token",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    #[test]
    fn test_requires_directory() {
        let mut credentials = Credentials::new();
        credentials.insert("client_id", "app");
        credentials.insert("client_secret", "shh");
        let config = ConnectorConfig::new(TenantId::new(), "entra", "azure_ad", "")
            .with_credentials(credentials);
        assert!(AzureAdConnector::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_token_is_cached_across_calls() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/users"))
            .and(header("authorization", "Bearer graph-token"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "az-1",
                "userPrincipalName": "ada@contoso.com",
                "displayName": "Ada"
            })))
            .expect(2)
            .mount(&server)
            .await;

        let config = config(&server);
        let mut connector = AzureAdConnector::new(&config).unwrap();
        connector.initialize(&config).await.unwrap();

        for _ in 0..2 {
            let created = connector
                .create_user(&ConnectorUser::new("ada@contoso.com"))
                .await
                .unwrap();
            assert_eq!(created.id.as_deref(), Some("az-1"));
        }
    }

    #[tokio::test]
    async fn test_duplicate_membership_is_conflict() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/groups/g-1/members/$ref"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {
                    "code": "Request_BadRequest",
                    "message": "One or more added object references already exist for the following modified properties: 'members'."
                }
            })))
            .mount(&server)
            .await;

        let connector = AzureAdConnector::new(&config(&server)).unwrap();
        let err = connector.add_user_to_group("g-1", "u-1").await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_list_users_follows_next_link() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("GET"))
            .and(path("/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{"id": "1", "userPrincipalName": "a@contoso.com"}],
                "@odata.nextLink": format!("{}/users?$skiptoken=abc", server.uri())
            })))
            .mount(&server)
            .await;

        let connector = AzureAdConnector::new(&config(&server)).unwrap();
        let page = connector
            .list_users(&accord_core::PageRequest::first(1))
            .await
            .unwrap();

        assert_eq!(page.items[0].user_name, "a@contoso.com");
        assert!(page.next_cursor.unwrap().contains("skiptoken=abc"));
    }

    #[tokio::test]
    async fn test_bad_client_secret_is_unauthenticated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid_client"))
            .mount(&server)
            .await;

        let config = config(&server);
        let mut connector = AzureAdConnector::new(&config).unwrap();
        let err = connector.initialize(&config).await.unwrap_err();
        assert!(matches!(err, accord_core::AccordError::Unauthenticated { .. }));
    }
}

// =============================================================================
// Shared HTTP Plumbing Tests
// =============================================================================

#[cfg(test)]
mod common_tests {
    use crate::providers::{join_url, status_error, HttpClient, IssuedToken, TokenCache};
    use accord_core::{AccordError, ConnectorConfig, TenantId};
    use reqwest::StatusCode;
    use serde_json::json;
    use std::time::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_status_error_taxonomy() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, "/x", ""),
            AccordError::Unauthenticated { .. }
        ));
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "/x", "").is_retryable());
        assert!(status_error(StatusCode::BAD_GATEWAY, "/x", "").is_retryable());
        assert!(status_error(StatusCode::NOT_FOUND, "/x", "").is_not_found());
        assert!(!status_error(StatusCode::BAD_REQUEST, "/x", "").is_retryable());
    }

    #[test]
    fn test_retry_settings_out_of_range() {
        let config = ConnectorConfig::new(TenantId::new(), "scim", "scim", "https://x.example.com")
            .with_setting("max_retries", json!(u64::MAX));
        let client = HttpClient::from_config(&config).unwrap();
        assert_eq!(client.max_retries(), 2);

        let client = HttpClient::new(Duration::from_secs(1), u32::MAX, 500).unwrap();
        assert_eq!(client.retry_delay(0), Duration::from_millis(500));
        assert_eq!(client.retry_delay(3), Duration::from_millis(4000));
        assert_eq!(client.retry_delay(64), Duration::from_millis(u64::MAX));
        assert_eq!(client.retry_delay(u32::MAX), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("https://a/b/", "/Users"), "https://a/b/Users");
        assert_eq!(join_url("https://a/b", "Users"), "https://a/b/Users");
    }

    #[tokio::test]
    async fn test_token_cache_refreshes_near_expiry() {
        let cache = TokenCache::new();
        let fetches = AtomicUsize::new(0);

        for _ in 0..2 {
            cache
                .get_or_fetch(|| async {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Ok(IssuedToken {
                        access_token: "short".to_string(),
                        expires_in: 30,
                    })
                })
                .await
                .unwrap();
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 2);

        cache.invalidate().await;
        for _ in 0..2 {
            cache
                .get_or_fetch(|| async {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Ok(IssuedToken {
                        access_token: "long".to_string(),
                        expires_in: 3600,
                    })
                })
                .await
                .unwrap();
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 3);
    }
}
