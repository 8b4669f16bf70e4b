//! Entity - 管理ツリーのノード
//!
//! # ロック順序
//! lifecycle → attributes → bus。`transition` は lifecycle ロックを握ったまま
//! `service.state` / `service.isUp` を書くので、状態とイベントの順序が一致します。
//! `effector_lock` はライフサイクル系 effector を FIFO で直列化する async ロックです。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::app::attributes::AttributeStore;
use crate::app::registry::TypeDescriptor;
use crate::domain::sensor::is_lifecycle_sensor;
use crate::domain::{
    AttributeValue, EntityConfig, EntityId, Lifecycle, LocationHandle, PolicyId, Result,
    SERVICE_STATE, SERVICE_UP, Sensor, StewardError,
};

pub struct Entity {
    id: EntityId,
    display_name: Option<String>,
    parent: Option<EntityId>,
    config: EntityConfig,
    descriptor: Arc<TypeDescriptor>,
    attributes: AttributeStore,
    lifecycle: Mutex<Lifecycle>,
    children: Mutex<Vec<EntityId>>,
    location: Mutex<Option<LocationHandle>>,
    policies: Mutex<Vec<PolicyId>>,
    effector_lock: tokio::sync::Mutex<()>,
    /// Set while a `destroy` covering this entity runs. Guarded by the table lock.
    closing: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Entity {
    pub(crate) fn new(
        id: EntityId,
        parent: Option<EntityId>,
        config: EntityConfig,
        descriptor: Arc<TypeDescriptor>,
        attributes: AttributeStore,
    ) -> Self {
        let display_name = config.get_str("name").map(str::to_string);
        Self {
            id,
            display_name,
            parent,
            config,
            descriptor,
            attributes,
            lifecycle: Mutex::new(Lifecycle::Created),
            children: Mutex::new(Vec::new()),
            location: Mutex::new(None),
            policies: Mutex::new(Vec::new()),
            effector_lock: tokio::sync::Mutex::new(()),
            closing: AtomicBool::new(false),
        }
    }

    pub(crate) fn with_display_name(mut self, name: Option<String>) -> Self {
        if name.is_some() {
            self.display_name = name;
        }
        self
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn type_name(&self) -> &str {
        self.descriptor.name()
    }

    /// The `name` config key, if one was given.
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn parent(&self) -> Option<EntityId> {
        self.parent
    }

    pub fn config(&self) -> &EntityConfig {
        &self.config
    }

    pub fn descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.descriptor
    }

    pub fn attributes(&self) -> &AttributeStore {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<AttributeValue> {
        self.attributes.get(name)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *lock(&self.lifecycle)
    }

    pub fn is_destroyed(&self) -> bool {
        self.lifecycle() == Lifecycle::Destroyed
    }

    pub fn is_up(&self) -> bool {
        self.lifecycle().is_up()
    }

    pub fn children(&self) -> Vec<EntityId> {
        lock(&self.children).clone()
    }

    pub fn location(&self) -> Option<LocationHandle> {
        lock(&self.location).clone()
    }

    pub fn policies(&self) -> Vec<PolicyId> {
        lock(&self.policies).clone()
    }

    /// External writes. Lifecycle sensors belong to the state machine.
    pub fn set_sensor(&self, sensor: &Sensor, value: AttributeValue) -> Result<Option<AttributeValue>> {
        if is_lifecycle_sensor(sensor.name()) {
            return Err(StewardError::InvalidParameter(format!(
                "{} is written only by lifecycle transitions",
                sensor.name()
            )));
        }
        if self.is_destroyed() {
            return Err(StewardError::EntityDestroyed(self.id));
        }
        self.attributes.set(sensor, value)
    }

    /// Moves to `next`, publishing `service.state` and `service.isUp`.
    ///
    /// Returns the previous state. Staying in the same state is a no-op.
    pub(crate) fn transition(&self, next: Lifecycle) -> Result<Lifecycle> {
        let mut state = lock(&self.lifecycle);
        let prev = *state;
        if prev == next {
            return Ok(prev);
        }
        if !prev.can_transition_to(next) {
            return Err(StewardError::IllegalTransition {
                entity: self.id,
                from: prev,
                to: next,
            });
        }
        *state = next;
        self.publish_lifecycle(next)?;
        match next {
            Lifecycle::Running | Lifecycle::OnFire | Lifecycle::Stopped | Lifecycle::Destroyed => {
                info!(entity = %self.id, from = %prev, to = %next, "lifecycle");
            }
            _ => debug!(entity = %self.id, from = %prev, to = %next, "lifecycle"),
        }
        Ok(prev)
    }

    /// Sets the state without checking the transition table.
    ///
    /// Used by rebind and by cancellation rolling back an uncommitted body.
    pub(crate) fn force_lifecycle(&self, next: Lifecycle) -> Result<()> {
        let mut state = lock(&self.lifecycle);
        *state = next;
        let stale = self.attributes.get(SERVICE_STATE.name()).as_ref().and_then(AttributeValue::as_str)
            != Some(next.as_str());
        if stale {
            self.publish_lifecycle(next)?;
        }
        Ok(())
    }

    fn publish_lifecycle(&self, state: Lifecycle) -> Result<()> {
        self.attributes.set(&SERVICE_STATE, state.as_str().into())?;
        self.attributes.set(&SERVICE_UP, state.is_up().into())?;
        Ok(())
    }

    /// Runs `f` with the lifecycle lock held (snapshot consistency).
    pub(crate) fn with_lifecycle_locked<R>(&self, f: impl FnOnce(Lifecycle) -> R) -> R {
        let state = lock(&self.lifecycle);
        f(*state)
    }

    pub(crate) fn effector_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.effector_lock
    }

    /// True once a `destroy` covering this entity has started.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.is_destroyed()
    }

    pub(crate) fn set_closing(&self, closing: bool) {
        self.closing.store(closing, Ordering::Release);
    }

    pub(crate) fn add_child(&self, child: EntityId) {
        lock(&self.children).push(child);
    }

    pub(crate) fn remove_child(&self, child: EntityId) {
        lock(&self.children).retain(|c| *c != child);
    }

    /// Replaces the binding, returning the previous handle.
    pub(crate) fn set_location(&self, handle: Option<LocationHandle>) -> Option<LocationHandle> {
        std::mem::replace(&mut *lock(&self.location), handle)
    }

    pub(crate) fn add_policy(&self, id: PolicyId) {
        lock(&self.policies).push(id);
    }

    pub(crate) fn remove_policy(&self, id: PolicyId) -> bool {
        let mut policies = lock(&self.policies);
        let before = policies.len();
        policies.retain(|p| *p != id);
        policies.len() != before
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("type", &self.type_name())
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}
