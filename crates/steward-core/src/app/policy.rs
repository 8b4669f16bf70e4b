//! Policy engine - エンティティに紐づくリアクティブなコントローラ
//!
//! # 実装詳細
//! - ポリシー 1 つにつき tokio タスク 1 本。状態はそのタスクだけが持つ
//! - 全購読のイベントを 1 本の mpsc に集約し、1 件ずつ `on_event` に渡す
//! - `deactivate` で購読を解除し、タスクを abort（状態も破棄される）
//! - `PolicyContext` は `Weak` を持つので、ポリシーがコンテキストを延命しない

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::app::bus::{BoxError, Callback};
use crate::app::context::ContextInner;
use crate::app::effector::EffectorHandle;
use crate::config::RuntimeConfig;
use crate::domain::{
    AttributeValue, EntityId, InvokeOptions, Lifecycle, Parameters, PolicyId, PolicySpec, Result,
    Sensor, SensorEvent, StewardError, SubscriptionFilter, SubscriptionId,
};

#[async_trait]
pub trait Policy: Send + 'static {
    fn name(&self) -> &str;

    /// Filters to subscribe when the policy is attached to `entity`.
    fn subscriptions(&self, entity: EntityId) -> Vec<SubscriptionFilter>;

    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    async fn on_start(&mut self, _ctx: &PolicyContext) -> Result<()> {
        Ok(())
    }

    /// Events arrive one at a time in delivery order. Observations of
    /// different sensors may be stale or duplicated.
    async fn on_event(&mut self, ctx: &PolicyContext, event: SensorEvent) -> Result<()>;

    async fn on_tick(&mut self, _ctx: &PolicyContext) -> Result<()> {
        Ok(())
    }
}

/// What a policy reaction may do.
#[derive(Clone)]
pub struct PolicyContext {
    inner: Weak<ContextInner>,
    entity: EntityId,
    policy: PolicyId,
}

impl PolicyContext {
    fn upgrade(&self) -> Result<Arc<ContextInner>> {
        let inner = self.inner.upgrade().ok_or(StewardError::ContextTerminated)?;
        inner.ensure_active()?;
        Ok(inner)
    }

    /// The entity this policy is attached to.
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn policy_id(&self) -> PolicyId {
        self.policy
    }

    pub fn now(&self) -> Result<DateTime<Utc>> {
        Ok(self.upgrade()?.clock.now())
    }

    pub fn config(&self) -> Result<RuntimeConfig> {
        Ok(self.upgrade()?.config.clone())
    }

    pub fn attribute(&self, entity: EntityId, name: &str) -> Result<Option<AttributeValue>> {
        Ok(self.upgrade()?.entity(entity)?.attribute(name))
    }

    pub fn lifecycle(&self, entity: EntityId) -> Result<Lifecycle> {
        Ok(self.upgrade()?.entity(entity)?.lifecycle())
    }

    pub fn children(&self, entity: EntityId) -> Result<Vec<EntityId>> {
        Ok(self.upgrade()?.entity(entity)?.children())
    }

    pub fn set_sensor(
        &self,
        entity: EntityId,
        sensor: &Sensor,
        value: AttributeValue,
    ) -> Result<Option<AttributeValue>> {
        self.upgrade()?.entity(entity)?.set_sensor(sensor, value)
    }

    pub fn invoke(&self, entity: EntityId, effector: &str, params: Parameters) -> Result<EffectorHandle> {
        self.upgrade()?
            .invoke(entity, effector, params, InvokeOptions::default())
    }
}

struct ActivePolicy {
    entity: EntityId,
    name: String,
    spec: Option<PolicySpec>,
    subscriptions: Vec<SubscriptionId>,
    task: JoinHandle<()>,
}

#[derive(Default)]
pub struct PolicyManager {
    active: Mutex<HashMap<PolicyId, ActivePolicy>>,
}

impl PolicyManager {
    /// Subscribes, then spawns the policy task. Events published after this
    /// returns reach the policy.
    pub(crate) fn activate(
        &self,
        inner: &Arc<ContextInner>,
        entity: EntityId,
        policy: Box<dyn Policy>,
        spec: Option<PolicySpec>,
    ) -> PolicyId {
        let id = inner.ids.policy_id();
        let name = policy.name().to_string();
        let (tx, rx) = mpsc::unbounded_channel::<SensorEvent>();

        let subscriptions = policy
            .subscriptions(entity)
            .into_iter()
            .map(|filter| {
                let tx = tx.clone();
                let sid = inner.ids.subscription_id();
                let callback: Callback = Arc::new(move |ev: &SensorEvent| -> std::result::Result<(), BoxError> {
                    tx.send(ev.clone()).map_err(|_| "policy task is gone".into())
                });
                inner.bus.subscribe(sid, filter, callback);
                sid
            })
            .collect();
        drop(tx);

        let ctx = PolicyContext {
            inner: Arc::downgrade(inner),
            entity,
            policy: id,
        };
        let task = inner.runtime.spawn(run_policy(policy, ctx, rx));

        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                ActivePolicy {
                    entity,
                    name: name.clone(),
                    spec,
                    subscriptions,
                    task,
                },
            );
        info!(policy = %id, name = %name, entity = %entity, "policy activated");
        id
    }

    pub(crate) fn deactivate(&self, inner: &ContextInner, id: PolicyId) -> Result<EntityId> {
        let removed = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        let Some(policy) = removed else {
            return Err(StewardError::PolicyNotFound(id.to_string()));
        };
        for sid in &policy.subscriptions {
            inner.bus.unsubscribe(*sid);
        }
        policy.task.abort();
        debug!(policy = %id, name = %policy.name, "policy deactivated");
        Ok(policy.entity)
    }

    pub(crate) fn deactivate_for(&self, inner: &ContextInner, entity: EntityId) {
        for id in self.ids_for(entity) {
            let _ = self.deactivate(inner, id);
        }
    }

    pub(crate) fn deactivate_all(&self, inner: &ContextInner) {
        let ids: Vec<PolicyId> = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        for id in ids {
            let _ = self.deactivate(inner, id);
        }
    }

    pub fn ids_for(&self, entity: EntityId) -> Vec<PolicyId> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, p)| p.entity == entity)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn name_of(&self, id: PolicyId) -> Option<String> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|p| p.name.clone())
    }

    /// Persistable specs, in the order given by `ids`.
    pub(crate) fn specs(&self, ids: &[PolicyId]) -> Vec<PolicySpec> {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        ids.iter()
            .filter_map(|id| active.get(id).and_then(|p| p.spec.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn run_policy(
    mut policy: Box<dyn Policy>,
    ctx: PolicyContext,
    mut events: mpsc::UnboundedReceiver<SensorEvent>,
) {
    let name = policy.name().to_string();
    if let Err(e) = policy.on_start(&ctx).await {
        warn!(policy = %ctx.policy, name = %name, error = %e, "on_start failed");
        if e == StewardError::ContextTerminated {
            return;
        }
    }

    let mut ticker = policy.tick_interval().map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    let mut events_open = true;

    loop {
        let result = tokio::select! {
            event = events.recv(), if events_open => match event {
                Some(event) => policy.on_event(&ctx, event).await,
                None => {
                    events_open = false;
                    Ok(())
                }
            },
            _ = tick(&mut ticker) => policy.on_tick(&ctx).await,
        };
        match result {
            Ok(()) => {}
            Err(StewardError::ContextTerminated) => break,
            Err(e) => warn!(policy = %ctx.policy, name = %name, error = %e, "reaction failed"),
        }
        if !events_open && ticker.is_none() {
            break;
        }
    }
    debug!(policy = %ctx.policy, name = %name, "policy task finished");
}
