//! Effector の実行面: 型が宣言する `Effector`、実行中に渡される
//! `EffectorContext`、呼び出し側が持つ `EffectorHandle`。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use crate::app::context::ContextInner;
use crate::app::entity::Entity;
use crate::domain::effector::LOCATION_PARAM;
use crate::domain::{
    AttributeValue, EffectorSpec, EffectorStatus, EntityId, InvocationId, InvokeOptions,
    LocationAction, LocationHandle, LocationRequirements, Parameters, Result, Sensor,
    StewardError,
};

/// A named operation declared by an entity type.
///
/// Errors returned here reach the handle wrapped as `EffectorFailed`; if the
/// entity was `RUNNING` it is marked `ON_FIRE`.
#[async_trait]
pub trait Effector: Send + Sync {
    fn spec(&self) -> EffectorSpec;

    async fn invoke(&self, ctx: &EffectorContext, params: Parameters) -> Result<serde_json::Value>;
}

/// What an effector body can touch while it runs.
pub struct EffectorContext {
    pub(crate) inner: Arc<ContextInner>,
    entity: Arc<Entity>,
    effector: String,
    params: Parameters,
    /// Set once an irreversible step (location action, child invocation) ran.
    committed: AtomicBool,
    /// Set when this invocation provisioned the entity's location.
    provisioned: AtomicBool,
}

impl EffectorContext {
    pub(crate) fn new(
        inner: Arc<ContextInner>,
        entity: Arc<Entity>,
        effector: impl Into<String>,
        params: Parameters,
    ) -> Self {
        Self {
            inner,
            entity,
            effector: effector.into(),
            params,
            committed: AtomicBool::new(false),
            provisioned: AtomicBool::new(false),
        }
    }

    pub fn entity(&self) -> &Arc<Entity> {
        &self.entity
    }

    pub fn effector(&self) -> &str {
        &self.effector
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&AttributeValue> {
        self.params.get(name)
    }

    pub fn children(&self) -> Vec<EntityId> {
        self.entity.children()
    }

    pub fn attribute(&self, name: &str) -> Option<AttributeValue> {
        self.entity.attribute(name)
    }

    /// Publishes a (non-lifecycle) sensor on the entity being driven.
    pub fn set_sensor(&self, sensor: &Sensor, value: AttributeValue) -> Result<Option<AttributeValue>> {
        self.entity.set_sensor(sensor, value)
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    pub(crate) fn provisioned_here(&self) -> bool {
        self.provisioned.load(Ordering::Acquire)
    }

    fn commit(&self) {
        self.committed.store(true, Ordering::Release);
    }

    /// Returns the entity's bound location, provisioning one if needed.
    ///
    /// Location choice: `location` parameter, then the `location` config key,
    /// then the parent's location, then the only registered location.
    pub async fn acquire_location(&self) -> Result<LocationHandle> {
        if let Some(handle) = self.entity.location() {
            return Ok(handle);
        }
        let location = self.resolve_location()?;
        let requirements = LocationRequirements {
            entity: Some(self.entity.id()),
            entity_type: self.entity.type_name().to_string(),
            hints: Default::default(),
        };
        let handle = location.provision(&requirements).await?;
        if let Err(e) = self.inner.locations.bind(&handle, self.entity.id()) {
            // never leave an unbound machine behind
            let _ = location.release(&handle).await;
            return Err(e);
        }
        self.entity.set_location(Some(handle.clone()));
        self.provisioned.store(true, Ordering::Release);
        debug!(entity = %self.entity.id(), handle = %handle.id, location = %handle.location, "location bound");
        Ok(handle)
    }

    fn resolve_location(&self) -> Result<Arc<dyn crate::ports::Location>> {
        let locations = &self.inner.locations;
        if let Some(name) = self.param(LOCATION_PARAM).and_then(AttributeValue::as_str) {
            return locations.get(name);
        }
        if let Some(name) = self.entity.config().get_str(LOCATION_PARAM) {
            return locations.get(name);
        }
        if let Some(parent) = self.entity.parent()
            && let Ok(parent) = self.inner.entity(parent)
            && let Some(handle) = parent.location()
        {
            return locations.get(&handle.location);
        }
        locations.only().ok_or_else(|| {
            StewardError::LocationUnavailable(format!(
                "no location selected for {} and {} registered",
                self.entity.id(),
                locations.len()
            ))
        })
    }

    /// Runs an action on the bound location. Counts as committed.
    pub async fn execute(&self, action: LocationAction) -> Result<serde_json::Value> {
        let handle = self.entity.location().ok_or_else(|| {
            StewardError::LocationUnavailable(format!("{} has no location", self.entity.id()))
        })?;
        let location = self.inner.locations.get(&handle.location)?;
        self.commit();
        Ok(location.execute(&handle, &action).await?)
    }

    /// Releases and unbinds the entity's location, if any.
    pub async fn release_location(&self) -> Result<()> {
        let Some(handle) = self.entity.set_location(None) else {
            return Ok(());
        };
        self.inner.locations.release(&handle).await
    }

    /// Invokes an effector on another entity (e.g. a group driving children).
    pub fn invoke(
        &self,
        entity: EntityId,
        effector: &str,
        params: Parameters,
    ) -> Result<EffectorHandle> {
        self.commit();
        self.inner
            .invoke(entity, effector, params, InvokeOptions::default())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct HandleState {
    pub(crate) status: EffectorStatus,
    pub(crate) outcome: Option<Result<serde_json::Value>>,
}

impl HandleState {
    pub(crate) fn queued() -> Self {
        Self {
            status: EffectorStatus::Queued,
            outcome: None,
        }
    }
}

/// Tracks one invocation. Clones observe the same invocation.
#[derive(Clone)]
pub struct EffectorHandle {
    id: InvocationId,
    entity: EntityId,
    effector: String,
    state: watch::Receiver<HandleState>,
    cancel: Arc<watch::Sender<bool>>,
}

impl EffectorHandle {
    pub(crate) fn new(
        id: InvocationId,
        entity: EntityId,
        effector: String,
        state: watch::Receiver<HandleState>,
        cancel: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            id,
            entity,
            effector,
            state,
            cancel,
        }
    }

    pub fn id(&self) -> InvocationId {
        self.id
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn effector(&self) -> &str {
        &self.effector
    }

    pub fn status(&self) -> EffectorStatus {
        self.state.borrow().status
    }

    /// `None` until the body finished (or was cancelled).
    pub fn outcome(&self) -> Option<Result<serde_json::Value>> {
        self.state.borrow().outcome.clone()
    }

    /// Waits for the outcome. A `TIMED_OUT` status does not end the wait.
    pub async fn wait(&self) -> Result<serde_json::Value> {
        let mut rx = self.state.clone();
        let outcome = match rx.wait_for(|s| s.outcome.is_some()).await {
            Ok(state) => state.outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            Err(StewardError::effector_failed(
                self.effector.clone(),
                StewardError::execution("invocation ended without an outcome"),
            ))
        })
    }

    pub async fn wait_timeout(&self, timeout: Duration) -> Result<serde_json::Value> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| StewardError::TimedOut)?
    }

    /// Best-effort cancel. Returns `false` if the invocation already finished.
    pub fn cancel(&self) -> bool {
        if self.state.borrow().status.is_terminal() {
            return false;
        }
        self.cancel.send_replace(true);
        true
    }
}

impl std::fmt::Debug for EffectorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EffectorHandle")
            .field("id", &self.id)
            .field("entity", &self.entity)
            .field("effector", &self.effector)
            .field("status", &self.status())
            .finish()
    }
}
