//! Tests for the provisioning engine and worker

#[cfg(test)]
mod retry_tests {
    use crate::retry::RetryPolicy;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    #[test]
    fn test_backoff_doubles_from_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(60));
        assert_eq!(policy.backoff(1), Duration::from_secs(120));
        assert_eq!(policy.backoff(2), Duration::from_secs(240));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        for n in 0..80 {
            assert!(policy.backoff(n) <= Duration::from_secs(3600));
        }
        assert_eq!(policy.backoff(6), Duration::from_secs(3600));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn test_next_attempt_at() {
        let policy = RetryPolicy::new(10, 25);
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(
            policy.next_attempt_at(now, 1),
            now + chrono::Duration::seconds(20)
        );
        assert_eq!(
            policy.next_attempt_at(now, 5),
            now + chrono::Duration::seconds(25)
        );
    }
}

#[cfg(test)]
mod engine_tests {
    use crate::engine::{EngineSettings, ProvisioningEngine};
    use accord_connectors::testing::{Outcome, Script, SCRIPTED_TYPE};
    use accord_connectors::ConnectorRegistry;
    use accord_core::{
        AccordError, ConnectorConfig, ConnectorId, ConnectorUser, ManualClock, NewTask,
        ProvisioningOperation, TaskFilter, TaskStatus, TaskStore, TenantId,
    };
    use accord_db::InMemoryTaskStore;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    struct Harness {
        engine: ProvisioningEngine<InMemoryTaskStore>,
        store: Arc<InMemoryTaskStore>,
        registry: Arc<ConnectorRegistry>,
        clock: Arc<ManualClock>,
        script: Script,
        tenant: TenantId,
        connector: ConnectorId,
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    async fn harness() -> Harness {
        harness_with(EngineSettings::default()).await
    }

    async fn harness_with(settings: EngineSettings) -> Harness {
        let script = Script::new();
        let registry = Arc::new(ConnectorRegistry::new());
        registry.register(SCRIPTED_TYPE, script.factory()).await;

        let tenant = TenantId::new();
        let config = ConnectorConfig::new(tenant, "target", SCRIPTED_TYPE, "");
        registry.create(SCRIPTED_TYPE, &config).await.unwrap();

        let store = Arc::new(InMemoryTaskStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let engine = ProvisioningEngine::new(store.clone(), registry.clone(), settings)
            .with_clock(clock.clone());

        Harness {
            engine,
            store,
            registry,
            clock,
            script,
            tenant,
            connector: config.id,
        }
    }

    impl Harness {
        fn new_task(&self, operation: ProvisioningOperation) -> NewTask {
            NewTask::new(self.tenant, self.connector, operation)
        }
    }

    fn create_user() -> ProvisioningOperation {
        ProvisioningOperation::create_user(ConnectorUser::new("ada@example.com"))
    }

    // =========================================================================
    // Enqueue
    // =========================================================================

    #[tokio::test]
    async fn test_enqueue_creates_pending_task() {
        let h = harness().await;
        let task = h.engine.enqueue(h.new_task(create_user())).await.unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.scheduled_at, start());
        assert_eq!(task.created_at, start());
        assert_eq!(task.resource_type, "user");

        let stored = h.engine.get_task(h.tenant, task.id).await.unwrap();
        assert_eq!(stored, task);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_payload() {
        let h = harness().await;
        let err = h
            .engine
            .enqueue(h.new_task(ProvisioningOperation::delete_user("  ")))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_enqueue_raw() {
        let h = harness().await;

        let task = h
            .engine
            .enqueue_raw(
                h.tenant,
                h.connector,
                "add_to_group",
                json!({"group_id": "g-1", "user_id": "u-1"}),
                Some(5),
            )
            .await
            .unwrap();
        assert_eq!(task.max_retries, 5);
        assert_eq!(task.resource_id.as_deref(), Some("g-1"));

        let unknown = h
            .engine
            .enqueue_raw(h.tenant, h.connector, "rename_user", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(unknown, AccordError::Permanent { .. }));

        let malformed = h
            .engine
            .enqueue_raw(h.tenant, h.connector, "delete_user", json!({"id": 1}), None)
            .await
            .unwrap_err();
        assert!(matches!(malformed, AccordError::Permanent { .. }));
        assert_eq!(h.store.len().await, 1);
    }

    #[tokio::test]
    async fn test_get_task_is_tenant_scoped() {
        let h = harness().await;
        let task = h.engine.enqueue(h.new_task(create_user())).await.unwrap();
        let err = h
            .engine
            .get_task(TenantId::new(), task.id)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    // =========================================================================
    // Outcomes
    // =========================================================================

    #[tokio::test]
    async fn test_success_completes_task() {
        let h = harness().await;
        let task = h.engine.enqueue(h.new_task(create_user())).await.unwrap();
        h.clock.advance(chrono::Duration::seconds(5));

        let report = h.engine.run_once().await.unwrap();
        assert_eq!(report.selected, 1);
        assert_eq!(report.claimed, 1);
        assert_eq!(report.completed, 1);

        let done = h.engine.get_task(h.tenant, task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.processed_at, Some(start() + chrono::Duration::seconds(5)));
        assert_eq!(h.script.calls_to("create_user"), 1);
    }

    #[tokio::test]
    async fn test_dispatch_selects_contract_method() {
        let h = harness().await;
        let operations = vec![
            ProvisioningOperation::update_user("u-1", ConnectorUser::new("ada")),
            ProvisioningOperation::delete_user("u-2"),
            ProvisioningOperation::add_to_group("g-1", "u-1"),
            ProvisioningOperation::remove_from_group("g-1", "u-2"),
        ];
        for operation in operations {
            h.engine.enqueue(h.new_task(operation)).await.unwrap();
        }

        let report = h.engine.run_once().await.unwrap();
        assert_eq!(report.completed, 4);

        let calls = h.script.calls();
        let find = |method: &str| calls.iter().find(|c| c.method == method).unwrap().args.clone();
        assert_eq!(find("update_user"), vec!["u-1", "ada"]);
        assert_eq!(find("delete_user"), vec!["u-2"]);
        assert_eq!(find("add_user_to_group"), vec!["g-1", "u-1"]);
        assert_eq!(find("remove_user_from_group"), vec!["g-1", "u-2"]);
    }

    #[tokio::test]
    async fn test_zero_retries_fails_immediately() {
        let h = harness().await;
        h.script.always(Outcome::Transient);
        let task = h
            .engine
            .enqueue(h.new_task(create_user()).with_max_retries(0))
            .await
            .unwrap();

        let report = h.engine.run_once().await.unwrap();
        assert_eq!(report.failed, 1);

        let failed = h.engine.get_task(h.tenant, task.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 0);
        assert!(failed.processed_at.is_some());
        assert!(failed.error_message.unwrap().contains("service unavailable"));
    }

    #[tokio::test]
    async fn test_exhausts_three_retries_with_backoff() {
        let h = harness().await;
        h.script.always(Outcome::Transient);
        let task = h
            .engine
            .enqueue(h.new_task(create_user()).with_max_retries(3))
            .await
            .unwrap();

        for k in 1..=3u32 {
            let report = h.engine.run_once().await.unwrap();
            assert_eq!(report.retried, 1, "attempt {}", k);

            let pending = h.engine.get_task(h.tenant, task.id).await.unwrap();
            assert_eq!(pending.status, TaskStatus::Pending);
            assert_eq!(pending.retry_count, k);
            assert!(pending.retry_count <= pending.max_retries);
            let min_delay = chrono::Duration::minutes(1 << (k - 1));
            assert!(pending.scheduled_at >= task.created_at + min_delay);

            // Not due yet
            assert!(h.engine.run_once().await.unwrap().is_idle());
            h.clock.set(pending.scheduled_at);
        }

        let report = h.engine.run_once().await.unwrap();
        assert_eq!(report.failed, 1);

        let failed = h.engine.get_task(h.tenant, task.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 3);
        assert_eq!(h.script.calls_to("create_user"), 4);

        // Terminal tasks are never selected again
        h.clock.advance(chrono::Duration::days(1));
        assert!(h.engine.run_once().await.unwrap().is_idle());
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let h = harness().await;
        h.script.times(2, Outcome::Transient).then(Outcome::Ok);
        let task = h
            .engine
            .enqueue(h.new_task(create_user()).with_max_retries(2))
            .await
            .unwrap();

        for _ in 0..3 {
            h.engine.run_once().await.unwrap();
            let current = h.engine.get_task(h.tenant, task.id).await.unwrap();
            h.clock.set(current.scheduled_at);
        }

        let done = h.engine.get_task(h.tenant, task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.retry_count, 2);
        assert!(done.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_missing_connector_is_terminal() {
        let h = harness().await;
        let task = h
            .engine
            .enqueue(NewTask::new(h.tenant, ConnectorId::new(), create_user()))
            .await
            .unwrap();

        let report = h.engine.run_once().await.unwrap();
        assert_eq!(report.failed, 1);

        let failed = h.engine.get_task(h.tenant, task.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 0);
        assert!(failed.error_message.unwrap().contains("connector not found"));
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_terminal() {
        let h = harness().await;
        h.script.then(Outcome::Forbidden);
        let task = h.engine.enqueue(h.new_task(create_user())).await.unwrap();

        h.engine.run_once().await.unwrap();

        let failed = h.engine.get_task(h.tenant, task.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 0);
    }

    #[tokio::test]
    async fn test_conflict_on_first_attempt_fails() {
        let h = harness().await;
        h.script.then(Outcome::Conflict);
        let task = h.engine.enqueue(h.new_task(create_user())).await.unwrap();

        h.engine.run_once().await.unwrap();

        let failed = h.engine.get_task(h.tenant, task.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_conflict_after_retry_means_applied() {
        let h = harness().await;
        h.script.then(Outcome::Transient).then(Outcome::Conflict);
        let task = h.engine.enqueue(h.new_task(create_user())).await.unwrap();

        h.engine.run_once().await.unwrap();
        let pending = h.engine.get_task(h.tenant, task.id).await.unwrap();
        h.clock.set(pending.scheduled_at);
        h.engine.run_once().await.unwrap();

        let done = h.engine.get_task(h.tenant, task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.retry_count, 1);
    }

    #[tokio::test]
    async fn test_not_found_after_retry_means_deleted() {
        let h = harness().await;
        h.script.then(Outcome::Transient).then(Outcome::NotFound);
        let task = h
            .engine
            .enqueue(h.new_task(ProvisioningOperation::delete_user("u-1")))
            .await
            .unwrap();

        h.engine.run_once().await.unwrap();
        let pending = h.engine.get_task(h.tenant, task.id).await.unwrap();
        h.clock.set(pending.scheduled_at);
        h.engine.run_once().await.unwrap();

        let done = h.engine.get_task(h.tenant, task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_not_found_on_update_is_not_applied() {
        let h = harness().await;
        h.script.then(Outcome::Transient).then(Outcome::NotFound);
        let task = h
            .engine
            .enqueue(h.new_task(ProvisioningOperation::update_user(
                "u-1",
                ConnectorUser::new("ada"),
            )))
            .await
            .unwrap();

        h.engine.run_once().await.unwrap();
        let pending = h.engine.get_task(h.tenant, task.id).await.unwrap();
        h.clock.set(pending.scheduled_at);
        h.engine.run_once().await.unwrap();

        let failed = h.engine.get_task(h.tenant, task.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_slow_connector_times_out_and_retries() {
        let h = harness_with(EngineSettings {
            operation_timeout: Duration::from_millis(50),
            ..Default::default()
        })
        .await;
        h.script.set_delay(Duration::from_millis(500));
        let task = h.engine.enqueue(h.new_task(create_user())).await.unwrap();

        let report = h.engine.run_once().await.unwrap();
        assert_eq!(report.retried, 1);

        let pending = h.engine.get_task(h.tenant, task.id).await.unwrap();
        assert!(pending.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_selection_respects_batch_size() {
        let h = harness_with(EngineSettings {
            batch_size: 2,
            ..Default::default()
        })
        .await;
        for i in 0..5 {
            h.engine
                .enqueue(h.new_task(ProvisioningOperation::delete_user(format!("u-{}", i))))
                .await
                .unwrap();
        }

        let report = h.engine.run_once().await.unwrap();
        assert_eq!(report.selected, 2);
        assert_eq!(report.completed, 2);

        let pending = h
            .engine
            .list_tasks(
                h.tenant,
                &TaskFilter {
                    status: Some(TaskStatus::Pending),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(pending.len(), 3);
    }

    // =========================================================================
    // Concurrency and Recovery
    // =========================================================================

    #[tokio::test]
    async fn test_competing_engines_claim_once() {
        let h = harness().await;
        let other = ProvisioningEngine::new(
            h.store.clone(),
            h.registry.clone(),
            EngineSettings::default(),
        )
        .with_clock(h.clock.clone());

        let task = h.engine.enqueue(h.new_task(create_user())).await.unwrap();

        let (a, b) = tokio::join!(h.engine.run_once(), other.run_once());
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.claimed + b.claimed, 1);
        assert_eq!(h.script.calls_to("create_user"), 1);
        assert_eq!(
            h.engine.get_task(h.tenant, task.id).await.unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_release_stale_claims() {
        let h = harness().await;
        let task = h.engine.enqueue(h.new_task(create_user())).await.unwrap();

        // A worker claimed the task and died before recording an outcome
        h.store.claim(task.id, start()).await.unwrap().unwrap();
        assert!(h.engine.run_once().await.unwrap().is_idle());

        h.clock.advance(chrono::Duration::minutes(2));
        let released = h
            .engine
            .release_stale_claims(Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(released, 0);

        h.clock.advance(chrono::Duration::minutes(10));
        let released = h
            .engine
            .release_stale_claims(Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(released, 1);

        let pending = h.engine.get_task(h.tenant, task.id).await.unwrap();
        assert_eq!(pending.status, TaskStatus::Pending);
        assert_eq!(pending.retry_count, 0);

        assert_eq!(h.engine.run_once().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_late_outcome_of_released_claim_is_discarded() {
        let h = harness().await;
        h.script.set_delay(Duration::from_millis(300));
        let task = h.engine.enqueue(h.new_task(create_user())).await.unwrap();

        let second = ProvisioningEngine::new(
            h.store.clone(),
            h.registry.clone(),
            EngineSettings::default(),
        )
        .with_clock(h.clock.clone());

        let (first_report, (released, second_report)) = tokio::join!(
            h.engine.run_once(),
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                h.clock.advance(chrono::Duration::minutes(10));
                let released = second
                    .release_stale_claims(Duration::from_secs(300))
                    .await
                    .unwrap();
                (released, second.run_once().await.unwrap())
            }
        );
        let first_report = first_report.unwrap();

        assert_eq!(released, 1);
        assert_eq!(first_report.errors, 1);
        assert_eq!(first_report.completed, 0);
        assert_eq!(second_report.completed, 1);

        let done = h.engine.get_task(h.tenant, task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.claimed_at, Some(start() + chrono::Duration::minutes(10)));
        assert_eq!(done.release_count, 1);
    }

    #[tokio::test]
    async fn test_conflict_after_release_means_applied() {
        let h = harness().await;
        h.script.then(Outcome::Conflict);
        let task = h.engine.enqueue(h.new_task(create_user())).await.unwrap();

        h.store.claim(task.id, start()).await.unwrap().unwrap();
        h.clock.advance(chrono::Duration::minutes(10));
        h.engine
            .release_stale_claims(Duration::from_secs(300))
            .await
            .unwrap();

        assert_eq!(h.engine.run_once().await.unwrap().completed, 1);
        let done = h.engine.get_task(h.tenant, task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.retry_count, 0);
    }

    #[tokio::test]
    async fn test_stale_threshold_must_exceed_operation_timeout() {
        let h = harness().await;
        let task = h.engine.enqueue(h.new_task(create_user())).await.unwrap();
        h.store.claim(task.id, start()).await.unwrap().unwrap();
        h.clock.advance(chrono::Duration::minutes(10));

        let err = h
            .engine
            .release_stale_claims(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "config");

        let still = h.engine.get_task(h.tenant, task.id).await.unwrap();
        assert_eq!(still.status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn test_toggled_connector_gets_fresh_instance() {
        let h = harness().await;
        h.engine.enqueue(h.new_task(create_user())).await.unwrap();
        h.engine.run_once().await.unwrap();

        h.registry.remove(h.connector).await.unwrap();
        let config = ConnectorConfig {
            id: h.connector,
            ..ConnectorConfig::new(h.tenant, "target", SCRIPTED_TYPE, "")
        };
        h.registry.create(SCRIPTED_TYPE, &config).await.unwrap();

        h.engine
            .enqueue(h.new_task(ProvisioningOperation::delete_user("u-1")))
            .await
            .unwrap();
        h.engine.run_once().await.unwrap();

        let instances: Vec<_> = h.script.calls().iter().map(|c| c.instance).collect();
        assert_eq!(instances, vec![1, 2]);
    }
}

#[cfg(test)]
mod worker_tests {
    use crate::engine::{EngineSettings, ProvisioningEngine};
    use crate::worker::{ProvisioningWorker, WorkerConfig};
    use accord_connectors::testing::{Script, SCRIPTED_TYPE};
    use accord_connectors::ConnectorRegistry;
    use accord_core::{ConnectorConfig, NewTask, ProvisioningOperation, TaskStatus, TenantId};
    use accord_db::InMemoryTaskStore;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_stale_threshold_validation() {
        let config = WorkerConfig::default();
        assert!(config.validate(Duration::from_secs(30)).is_ok());

        let config = WorkerConfig {
            stale_after_secs: 30,
            ..Default::default()
        };
        assert!(config.validate(Duration::from_secs(30)).is_err());
        assert!(config.validate(Duration::from_millis(29_999)).is_ok());
    }

    #[tokio::test]
    async fn test_worker_processes_and_shuts_down() {
        let script = Script::new();
        let registry = Arc::new(ConnectorRegistry::new());
        registry.register(SCRIPTED_TYPE, script.factory()).await;
        let tenant = TenantId::new();
        let config = ConnectorConfig::new(tenant, "target", SCRIPTED_TYPE, "");
        registry.create(SCRIPTED_TYPE, &config).await.unwrap();

        let store = Arc::new(InMemoryTaskStore::new());
        let engine = Arc::new(ProvisioningEngine::new(
            store,
            registry,
            EngineSettings::default(),
        ));
        let task = engine
            .enqueue(NewTask::new(
                tenant,
                config.id,
                ProvisioningOperation::delete_user("u-1"),
            ))
            .await
            .unwrap();

        let worker = Arc::new(ProvisioningWorker::new(
            engine.clone(),
            WorkerConfig {
                poll_interval_ms: 10,
                ..Default::default()
            },
        ));
        let running = worker.clone();
        let handle = tokio::spawn(async move { running.run().await });

        let mut status = TaskStatus::Pending;
        for _ in 0..200 {
            status = engine.get_task(tenant, task.id).await.unwrap().status;
            if status == TaskStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, TaskStatus::Completed);

        worker.shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker stops")
            .unwrap();
        assert!(worker.is_shutdown());
    }
}
