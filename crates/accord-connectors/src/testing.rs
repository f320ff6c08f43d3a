//! Scripted connector double for exercising the registry, service and engine
//! without a network.
//!
//! A [`Script`] is shared by every instance its factory builds, so a test can
//! queue outcomes, inspect recorded calls and count builds and closes across
//! instance replacement.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use accord_core::{
    AccordError, Connector, ConnectorConfig, ConnectorFactory, ConnectorGroup, ConnectorId,
    ConnectorUser, Page, PageRequest, Result,
};

pub const SCRIPTED_TYPE: &str = "scripted";

/// Result the next contract call produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Transient,
    Permanent,
    Conflict,
    NotFound,
    Unauthenticated,
    Forbidden,
}

impl Outcome {
    fn into_result(self, method: &str) -> Result<()> {
        match self {
            Self::Ok => Ok(()),
            Self::Transient => Err(AccordError::transient(format!("{}: service unavailable", method))),
            Self::Permanent => Err(AccordError::permanent(format!("{}: rejected", method))),
            Self::Conflict => Err(AccordError::conflict(format!("{}: already exists", method))),
            Self::NotFound => Err(AccordError::not_found("remote resource", method)),
            Self::Unauthenticated => Err(AccordError::unauthenticated(format!("{}: bad token", method))),
            Self::Forbidden => Err(AccordError::forbidden(format!("{}: denied", method))),
        }
    }
}

/// One recorded contract call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub connector_id: ConnectorId,
    /// Build number of the instance that served the call, starting at 1
    pub instance: usize,
    pub method: &'static str,
    pub args: Vec<String>,
}

struct ScriptInner {
    queued: Mutex<VecDeque<Outcome>>,
    fallback: Mutex<Outcome>,
    calls: Mutex<Vec<Call>>,
    delay: Mutex<Option<Duration>>,
    builds: AtomicUsize,
    initializations: AtomicUsize,
    closes: AtomicUsize,
    fail_initialize: AtomicBool,
    healthy: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone)]
pub struct Script {
    inner: Arc<ScriptInner>,
}

impl Script {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScriptInner {
                queued: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(Outcome::Ok),
                calls: Mutex::new(Vec::new()),
                delay: Mutex::new(None),
                builds: AtomicUsize::new(0),
                initializations: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                fail_initialize: AtomicBool::new(false),
                healthy: AtomicBool::new(true),
            }),
        }
    }

    /// Queue the outcome of the next unscripted call
    pub fn then(&self, outcome: Outcome) -> &Self {
        lock(&self.inner.queued).push_back(outcome);
        self
    }

    /// Queue `times` copies of `outcome`
    pub fn times(&self, times: usize, outcome: Outcome) -> &Self {
        lock(&self.inner.queued).extend(std::iter::repeat(outcome).take(times));
        self
    }

    /// Outcome once the queue is drained
    pub fn always(&self, outcome: Outcome) -> &Self {
        *lock(&self.inner.fallback) = outcome;
        self
    }

    pub fn fail_initialize(&self, fail: bool) -> &Self {
        self.inner.fail_initialize.store(fail, Ordering::SeqCst);
        self
    }

    pub fn set_healthy(&self, healthy: bool) -> &Self {
        self.inner.healthy.store(healthy, Ordering::SeqCst);
        self
    }

    /// Sleep this long inside every contract call
    pub fn set_delay(&self, delay: Duration) -> &Self {
        *lock(&self.inner.delay) = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.inner.calls).clone()
    }

    pub fn calls_to(&self, method: &str) -> usize {
        lock(&self.inner.calls)
            .iter()
            .filter(|c| c.method == method)
            .count()
    }

    pub fn builds(&self) -> usize {
        self.inner.builds.load(Ordering::SeqCst)
    }

    pub fn initializations(&self) -> usize {
        self.inner.initializations.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    /// Factory building instances that follow this script
    pub fn factory(&self) -> impl ConnectorFactory + 'static {
        let script = self.clone();
        move |config: &ConnectorConfig| -> Result<Box<dyn Connector>> {
            Ok(Box::new(ScriptedConnector::new(config, script.clone())))
        }
    }

    fn next_outcome(&self) -> Outcome {
        lock(&self.inner.queued)
            .pop_front()
            .unwrap_or(*lock(&self.inner.fallback))
    }
}

impl Default for Script {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ScriptedConnector {
    id: ConnectorId,
    name: String,
    connector_type: String,
    instance: usize,
    script: Script,
}

impl ScriptedConnector {
    pub fn new(config: &ConnectorConfig, script: Script) -> Self {
        let instance = script.inner.builds.fetch_add(1, Ordering::SeqCst) + 1;
        Self {
            id: config.id,
            name: config.name.clone(),
            connector_type: config.connector_type.clone(),
            instance,
            script,
        }
    }

    pub fn instance(&self) -> usize {
        self.instance
    }

    async fn record(&self, method: &'static str, args: &[&str]) -> Result<()> {
        lock(&self.script.inner.calls).push(Call {
            connector_id: self.id,
            instance: self.instance,
            method,
            args: args.iter().map(|a| a.to_string()).collect(),
        });

        let delay = *lock(&self.script.inner.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.script.next_outcome().into_result(method)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    fn id(&self) -> ConnectorId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn connector_type(&self) -> &str {
        &self.connector_type
    }

    async fn initialize(&mut self, _config: &ConnectorConfig) -> Result<()> {
        self.script.inner.initializations.fetch_add(1, Ordering::SeqCst);
        if self.script.inner.fail_initialize.load(Ordering::SeqCst) {
            return Err(AccordError::unauthenticated("scripted initialization failure"));
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let delay = *lock(&self.script.inner.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.script.inner.healthy.load(Ordering::SeqCst))
    }

    async fn close(&self) -> Result<()> {
        self.script.inner.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_user(&self, user: &ConnectorUser) -> Result<ConnectorUser> {
        self.record("create_user", &[user.user_name.as_str()]).await?;
        let mut created = user.clone();
        created.id = Some(format!("ext-{}", user.user_name));
        Ok(created)
    }

    async fn get_user(&self, user_id: &str) -> Result<ConnectorUser> {
        self.record("get_user", &[user_id]).await?;
        let mut user = ConnectorUser::new(user_id);
        user.id = Some(user_id.to_string());
        Ok(user)
    }

    async fn update_user(&self, user_id: &str, user: &ConnectorUser) -> Result<ConnectorUser> {
        self.record("update_user", &[user_id, user.user_name.as_str()]).await?;
        let mut updated = user.clone();
        updated.id = Some(user_id.to_string());
        Ok(updated)
    }

    async fn delete_user(&self, user_id: &str) -> Result<()> {
        self.record("delete_user", &[user_id]).await
    }

    async fn list_users(&self, _page: &PageRequest) -> Result<Page<ConnectorUser>> {
        self.record("list_users", &[]).await?;
        Ok(Page::last(Vec::new()))
    }

    async fn create_group(&self, group: &ConnectorGroup) -> Result<ConnectorGroup> {
        self.record("create_group", &[group.name.as_str()]).await?;
        let mut created = group.clone();
        created.id = Some(format!("ext-{}", group.name));
        Ok(created)
    }

    async fn get_group(&self, group_id: &str) -> Result<ConnectorGroup> {
        self.record("get_group", &[group_id]).await?;
        let mut group = ConnectorGroup::new(group_id);
        group.id = Some(group_id.to_string());
        Ok(group)
    }

    async fn update_group(&self, group_id: &str, group: &ConnectorGroup) -> Result<ConnectorGroup> {
        self.record("update_group", &[group_id, group.name.as_str()]).await?;
        let mut updated = group.clone();
        updated.id = Some(group_id.to_string());
        Ok(updated)
    }

    async fn delete_group(&self, group_id: &str) -> Result<()> {
        self.record("delete_group", &[group_id]).await
    }

    async fn list_groups(&self, _page: &PageRequest) -> Result<Page<ConnectorGroup>> {
        self.record("list_groups", &[]).await?;
        Ok(Page::last(Vec::new()))
    }

    async fn add_user_to_group(&self, group_id: &str, user_id: &str) -> Result<()> {
        self.record("add_user_to_group", &[group_id, user_id]).await
    }

    async fn remove_user_from_group(&self, group_id: &str, user_id: &str) -> Result<()> {
        self.record("remove_user_from_group", &[group_id, user_id]).await
    }

    async fn get_group_members(&self, group_id: &str) -> Result<Vec<String>> {
        self.record("get_group_members", &[group_id]).await?;
        Ok(Vec::new())
    }
}
