//! ManagementContext - プロセス全体のコーディネータ
//!
//! `init → active → terminated`。エンティティの生成・破棄はここだけが行います。
//! 構築は `ContextBuilder` 経由（`build` / `rebind`）。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::runtime::Handle;
use tracing::{info, instrument, warn};

use crate::app::attributes::AttributeStore;
use crate::app::bus::{Callback, EventBus};
use crate::app::effector::EffectorHandle;
use crate::app::entity::Entity;
use crate::app::locations::LocationManager;
use crate::app::policy::{Policy, PolicyManager};
use crate::app::registry::TypeRegistry;
use crate::config::RuntimeConfig;
use crate::domain::effector::DESTROY;
use crate::domain::memento::FORMAT_VERSION;
use crate::domain::{
    AttributeValue, EntityConfig, EntityId, EntityMemento, InvokeOptions, Lifecycle, MementoSet,
    Parameters, PolicyId, PolicySpec, Result, Sensor, StewardError, SubscriptionFilter,
    SubscriptionId,
};
use crate::ports::{Clock, IdGenerator, MementoStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Init,
    Active,
    Terminated,
}

/// Live entities plus the ordered root list.
#[derive(Default)]
pub(crate) struct EntityTable {
    entities: HashMap<EntityId, Arc<Entity>>,
    roots: Vec<EntityId>,
}

impl EntityTable {
    /// `root` and its descendants, children before parents.
    fn post_order(&self, root: &Arc<Entity>) -> Vec<Arc<Entity>> {
        let mut out = Vec::new();
        let mut stack = vec![(root.clone(), false)];
        while let Some((entity, expanded)) = stack.pop() {
            if expanded {
                out.push(entity);
                continue;
            }
            let children = entity.children();
            stack.push((entity, true));
            for child in children.into_iter().rev() {
                if let Some(child) = self.entities.get(&child) {
                    stack.push((child.clone(), false));
                }
            }
        }
        out
    }
}

pub(crate) struct ContextInner {
    pub(crate) state: Mutex<ContextState>,
    pub(crate) config: RuntimeConfig,
    pub(crate) registry: TypeRegistry,
    pub(crate) table: RwLock<EntityTable>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) locations: LocationManager,
    pub(crate) policies: PolicyManager,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) runtime: Handle,
}

impl ContextInner {
    pub(crate) fn state(&self) -> ContextState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, next: ContextState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        match self.state() {
            ContextState::Active => Ok(()),
            _ => Err(StewardError::ContextTerminated),
        }
    }

    pub(crate) fn entity(&self, id: EntityId) -> Result<Arc<Entity>> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entities
            .get(&id)
            .cloned()
            .ok_or(StewardError::EntityNotFound(id))
    }

    pub(crate) fn roots(&self) -> Vec<EntityId> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .roots
            .clone()
    }

    pub(crate) fn all_entities(&self) -> Vec<Arc<Entity>> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entities
            .values()
            .cloned()
            .collect()
    }

    /// Builds an entity (no events yet) for `type_name` under `parent`.
    pub(crate) fn new_entity(
        &self,
        id: EntityId,
        type_name: &str,
        config: EntityConfig,
        parent: Option<&Arc<Entity>>,
    ) -> Result<Entity> {
        let descriptor = self.registry.lookup_type(type_name)?;
        let lineage = match parent {
            Some(p) => {
                let mut lineage = vec![p.id()];
                lineage.extend(self.lineage_of(p));
                lineage
            }
            None => Vec::new(),
        };
        let attributes = AttributeStore::new(
            id,
            lineage,
            descriptor.sensor_schema(),
            self.bus.clone(),
            self.clock.clone(),
        );
        Ok(Entity::new(
            id,
            parent.map(|p| p.id()),
            config,
            descriptor,
            attributes,
        ))
    }

    fn lineage_of(&self, entity: &Entity) -> Vec<EntityId> {
        let mut out = Vec::new();
        let mut cursor = entity.parent();
        while let Some(id) = cursor {
            out.push(id);
            cursor = self.entity(id).ok().and_then(|e| e.parent());
        }
        out
    }

    /// Adds the entity to the table and to `parent`'s child list.
    ///
    /// Fails with `EntityDestroyed` once a destroy covering `parent` started.
    pub(crate) fn insert(&self, entity: Arc<Entity>, parent: Option<&Arc<Entity>>) -> Result<()> {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        match parent {
            Some(p) if p.is_closing() => return Err(StewardError::EntityDestroyed(p.id())),
            Some(p) => p.add_child(entity.id()),
            None => table.roots.push(entity.id()),
        }
        table.entities.insert(entity.id(), entity);
        Ok(())
    }

    /// Drops the entity from the table and from its parent's child list.
    pub(crate) fn remove(&self, entity: &Entity) {
        if let Some(parent) = entity.parent()
            && let Ok(parent) = self.entity(parent)
        {
            parent.remove_child(entity.id());
        }
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        table.entities.remove(&entity.id());
        table.roots.retain(|r| *r != entity.id());
    }

    /// Marks the subtree as closing and returns it, children first.
    ///
    /// Done under the table write lock, so no child can be added to the
    /// subtree after this returns.
    pub(crate) fn close_subtree(&self, root: &Arc<Entity>) -> Vec<Arc<Entity>> {
        let table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let order = table.post_order(root);
        for entity in &order {
            entity.set_closing(true);
        }
        order
    }

    /// Undoes `close_subtree` for entities that survived.
    pub(crate) fn reopen_subtree(&self, root: &Arc<Entity>) {
        let table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        for entity in table.post_order(root) {
            entity.set_closing(false);
        }
    }

    /// Entity and its descendants, parents first.
    pub(crate) fn pre_order(&self, root: &Arc<Entity>) -> Vec<Arc<Entity>> {
        let mut out = Vec::new();
        let mut stack = vec![root.clone()];
        while let Some(entity) = stack.pop() {
            for child in entity.children().into_iter().rev() {
                if let Ok(child) = self.entity(child) {
                    stack.push(child);
                }
            }
            out.push(entity);
        }
        out
    }

    pub(crate) fn memento_of(&self, entity: &Entity) -> EntityMemento {
        entity.with_lifecycle_locked(|lifecycle| EntityMemento {
            id: entity.id(),
            type_name: entity.type_name().to_string(),
            display_name: entity.display_name().map(str::to_string),
            parent: entity.parent(),
            children: entity.children(),
            config: entity.config().clone(),
            lifecycle,
            attributes: entity.attributes().snapshot(),
            location: entity.location(),
            policies: self.policies.specs(&entity.policies()),
        })
    }

    pub(crate) fn attach_policy(
        self: &Arc<Self>,
        entity: &Arc<Entity>,
        policy: Box<dyn Policy>,
        spec: Option<PolicySpec>,
    ) -> PolicyId {
        let id = self.policies.activate(self, entity.id(), policy, spec);
        entity.add_policy(id);
        id
    }
}

/// Process-wide coordinator. Cheap to clone.
#[derive(Clone)]
pub struct ManagementContext {
    pub(crate) inner: Arc<ContextInner>,
}

impl ManagementContext {
    pub(crate) fn from_inner(inner: Arc<ContextInner>) -> Self {
        Self { inner }
    }

    pub fn state(&self) -> ContextState {
        self.inner.state()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> &TypeRegistry {
        &self.inner.registry
    }

    pub fn locations(&self) -> &LocationManager {
        &self.inner.locations
    }

    /// Creates an entity in `CREATED` under `parent` (or as a new root).
    #[instrument(skip(self, config))]
    pub fn create_entity(
        &self,
        type_name: &str,
        config: EntityConfig,
        parent: Option<EntityId>,
    ) -> Result<EntityId> {
        self.inner.ensure_active()?;
        let parent = match parent {
            Some(id) => {
                let p = self.inner.entity(id)?;
                if p.is_closing() {
                    return Err(StewardError::EntityDestroyed(id));
                }
                Some(p)
            }
            None => None,
        };
        let id = self.inner.ids.entity_id();
        let entity = Arc::new(self.inner.new_entity(id, type_name, config, parent.as_ref())?);
        // the parent may have started closing since the check above
        self.inner.insert(entity.clone(), parent.as_ref())?;
        entity.force_lifecycle(Lifecycle::Created)?;
        info!(entity = %id, type_name, "entity created");
        Ok(id)
    }

    /// Recursively stops and removes the entity and its descendants.
    #[instrument(skip(self))]
    pub async fn destroy_entity(&self, id: EntityId) -> Result<()> {
        self.invoke(id, DESTROY, Parameters::new())?.wait().await?;
        Ok(())
    }

    pub fn entity(&self, id: EntityId) -> Result<Arc<Entity>> {
        self.inner.entity(id)
    }

    pub fn children(&self, id: EntityId) -> Result<Vec<EntityId>> {
        Ok(self.inner.entity(id)?.children())
    }

    pub fn roots(&self) -> Vec<EntityId> {
        self.inner.roots()
    }

    pub fn lifecycle(&self, id: EntityId) -> Result<Lifecycle> {
        Ok(self.inner.entity(id)?.lifecycle())
    }

    pub fn attribute(&self, id: EntityId, sensor: &str) -> Result<Option<AttributeValue>> {
        Ok(self.inner.entity(id)?.attribute(sensor))
    }

    /// External sensor write. Lifecycle sensors are rejected.
    pub fn set_sensor(
        &self,
        id: EntityId,
        sensor: &Sensor,
        value: AttributeValue,
    ) -> Result<Option<AttributeValue>> {
        self.inner.ensure_active()?;
        self.inner.entity(id)?.set_sensor(sensor, value)
    }

    pub fn invoke(&self, id: EntityId, effector: &str, params: Parameters) -> Result<EffectorHandle> {
        self.invoke_with(id, effector, params, InvokeOptions::default())
    }

    #[instrument(skip(self, params, options))]
    pub fn invoke_with(
        &self,
        id: EntityId,
        effector: &str,
        params: Parameters,
        options: InvokeOptions,
    ) -> Result<EffectorHandle> {
        self.inner.invoke(id, effector, params, options)
    }

    pub fn subscribe(&self, filter: SubscriptionFilter, callback: Callback) -> Result<SubscriptionId> {
        self.inner.ensure_active()?;
        let id = self.inner.ids.subscription_id();
        self.inner.bus.subscribe(id, filter, callback);
        Ok(id)
    }

    /// Idempotent; returns whether the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.bus.unsubscribe(id)
    }

    /// Attaches a policy instance. It is not persisted in snapshots.
    #[instrument(skip(self, policy), fields(policy = policy.name()))]
    pub fn add_policy(&self, entity: EntityId, policy: Box<dyn Policy>) -> Result<PolicyId> {
        self.inner.ensure_active()?;
        let entity = self.live_entity(entity)?;
        Ok(self.inner.attach_policy(&entity, policy, None))
    }

    /// Attaches a policy built by a registered factory. Persisted in snapshots.
    #[instrument(skip(self, spec), fields(policy = %spec.type_name))]
    pub fn add_policy_spec(&self, entity: EntityId, spec: PolicySpec) -> Result<PolicyId> {
        self.inner.ensure_active()?;
        let entity = self.live_entity(entity)?;
        let policy = self
            .inner
            .registry
            .create_policy(&spec.type_name, &spec.config, &self.inner.config)?;
        Ok(self.inner.attach_policy(&entity, policy, Some(spec)))
    }

    #[instrument(skip(self))]
    pub fn remove_policy(&self, id: PolicyId) -> Result<()> {
        let entity = self.inner.policies.deactivate(&self.inner, id)?;
        if let Ok(entity) = self.inner.entity(entity) {
            entity.remove_policy(id);
        }
        Ok(())
    }

    pub fn policies(&self, entity: EntityId) -> Result<Vec<PolicyId>> {
        Ok(self.inner.entity(entity)?.policies())
    }

    fn live_entity(&self, id: EntityId) -> Result<Arc<Entity>> {
        let entity = self.inner.entity(id)?;
        if entity.is_destroyed() {
            return Err(StewardError::EntityDestroyed(id));
        }
        Ok(entity)
    }

    /// Per-entity consistent copy of the live tree (not globally atomic).
    #[instrument(skip(self))]
    pub fn snapshot(&self) -> Result<MementoSet> {
        if self.inner.state() == ContextState::Terminated {
            return Err(StewardError::ContextTerminated);
        }
        let roots = self.inner.roots();
        let mut entities = Vec::new();
        for root in &roots {
            let Ok(root) = self.inner.entity(*root) else {
                continue;
            };
            for entity in self.inner.pre_order(&root) {
                entities.push(self.inner.memento_of(&entity));
            }
        }
        // children destroyed between reads would leave dangling ids
        let live: std::collections::HashSet<EntityId> = entities.iter().map(|m| m.id).collect();
        for m in &mut entities {
            m.children.retain(|c| live.contains(c));
        }
        Ok(MementoSet {
            format_version: FORMAT_VERSION,
            created_at: self.inner.clock.now(),
            roots,
            entities,
        })
    }

    #[instrument(skip(self, store))]
    pub async fn persist(&self, store: &dyn MementoStore) -> Result<()> {
        let set = self.snapshot()?;
        store.save(&set).await?;
        info!(entities = set.entities.len(), "snapshot persisted");
        Ok(())
    }

    /// Refuses further operations, cancels every policy and releases every
    /// bound location. Entities are left running and external subscriptions
    /// stay connected.
    #[instrument(skip(self))]
    pub async fn terminate(&self) {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == ContextState::Terminated {
                return;
            }
            *state = ContextState::Terminated;
        }
        self.inner.policies.deactivate_all(&self.inner);

        let mut released = 0usize;
        for entity in self.inner.all_entities() {
            if let Some(handle) = entity.set_location(None) {
                if let Err(e) = self.inner.locations.release(&handle).await {
                    warn!(entity = %entity.id(), error = %e, "release on terminate failed");
                }
                released += 1;
            }
        }
        info!(released, "management context terminated");
    }

    /// Destroys each listed application that still exists.
    ///
    /// Every id is attempted; the first failure is returned.
    #[instrument(skip(self, apps), fields(count = apps.len()))]
    pub async fn destroy_all(&self, apps: &[EntityId]) -> Result<()> {
        let mut first_error = None;
        for id in apps {
            match self.destroy_entity(*id).await {
                Ok(()) | Err(StewardError::EntityNotFound(_)) => {}
                Err(e) => {
                    warn!(entity = %id, error = %e, "destroy failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Bound handles per location name.
    pub fn location_usage(&self) -> BTreeMap<String, usize> {
        self.inner
            .locations
            .names()
            .into_iter()
            .map(|name| {
                let count = self.inner.locations.bound_count(&name);
                (name, count)
            })
            .collect()
    }
}

impl std::fmt::Debug for ManagementContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagementContext")
            .field("state", &self.state())
            .field("roots", &self.roots())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::builder::ContextBuilder;
    use crate::app::bus::BoxError;
    use crate::app::registry::TypeDescriptor;
    use crate::domain::SensorEvent;

    fn context() -> ManagementContext {
        ContextBuilder::new()
            .register_type(TypeDescriptor::group("app"))
            .register_type(TypeDescriptor::new("node"))
            .build()
            .unwrap()
    }

    fn named(name: &str) -> EntityConfig {
        EntityConfig::new().with("name", name)
    }

    #[tokio::test]
    async fn test_tree_bookkeeping() {
        let ctx = context();
        let app = ctx.create_entity("app", named("app"), None).unwrap();
        let a = ctx.create_entity("app", named("a"), Some(app)).unwrap();
        let leaf = ctx.create_entity("node", named("leaf"), Some(a)).unwrap();
        let b = ctx.create_entity("node", named("b"), Some(app)).unwrap();

        assert_eq!(ctx.roots(), vec![app]);
        assert_eq!(ctx.children(app).unwrap(), vec![a, b]);
        assert_eq!(ctx.entity(leaf).unwrap().parent(), Some(a));
        assert_eq!(ctx.entity(leaf).unwrap().display_name(), Some("leaf"));
        assert_eq!(ctx.lifecycle(b).unwrap(), Lifecycle::Created);

        let set = ctx.snapshot().unwrap();
        let order: Vec<EntityId> = set.entities.iter().map(|m| m.id).collect();
        assert_eq!(order, vec![app, a, leaf, b]);
        assert_eq!(set.roots, vec![app]);
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_type_and_parent() {
        let ctx = context();
        assert!(matches!(
            ctx.create_entity("database", EntityConfig::new(), None),
            Err(StewardError::UnknownType(name)) if name == "database"
        ));
        let missing = EntityId::generate();
        assert!(matches!(
            ctx.create_entity("node", EntityConfig::new(), Some(missing)),
            Err(StewardError::EntityNotFound(id)) if id == missing
        ));
        assert!(ctx.roots().is_empty());
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let ctx = context();
        let node = ctx.create_entity("node", EntityConfig::new(), None).unwrap();
        ctx.terminate().await;
        ctx.terminate().await;

        assert_eq!(ctx.state(), ContextState::Terminated);
        assert!(matches!(
            ctx.create_entity("node", EntityConfig::new(), None),
            Err(StewardError::ContextTerminated)
        ));
        assert!(matches!(ctx.snapshot(), Err(StewardError::ContextTerminated)));
        // reads still work
        assert_eq!(ctx.lifecycle(node).unwrap(), Lifecycle::Created);
    }

    #[tokio::test]
    async fn test_terminate_keeps_external_subscriptions() {
        let ctx = context();
        let node = ctx.create_entity("node", EntityConfig::new(), None).unwrap();
        let observer = ctx
            .subscribe(
                SubscriptionFilter::any(),
                Arc::new(|_: &SensorEvent| -> std::result::Result<(), BoxError> { Ok(()) }),
            )
            .unwrap();
        ctx.add_policy_spec(
            node,
            PolicySpec::new("windowed-rate", serde_json::json!({ "source": "webapp.reqs.total" })),
        )
        .unwrap();
        assert_eq!(ctx.inner.bus.subscription_count(), 2);

        ctx.terminate().await;

        // only the policy's subscription is gone
        assert_eq!(ctx.inner.bus.subscription_count(), 1);
        assert!(ctx.inner.policies.is_empty());
        assert!(ctx.unsubscribe(observer));
    }
}
