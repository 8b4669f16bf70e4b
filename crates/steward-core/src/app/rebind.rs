//! Rebind - MementoSet からのツリー再構築
//!
//! # 手順
//! 1. 検証（構造・型・Location 名・ポリシー生成）。ここまでは何も起こさない
//! 2. 親 → 子の順でエンティティを作り、属性と sequence をイベントなしで復元
//! 3. `Location::reattach` で handle を付け直す（失敗したら付け直した分を release）
//! 4. ライフサイクルを復元（STARTING / STOPPING は ON_FIRE）
//! 5. active にしてから、永続化されていたポリシーを再開
//!
//! 失敗時は途中まで作ったツリーごと捨てるので、部分的なツリーは残りません。

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::app::builder::{BuildError, ContextBuilder};
use crate::app::context::{ContextInner, ContextState, ManagementContext};
use crate::app::entity::Entity;
use crate::app::policy::Policy;
use crate::domain::{
    EntityId, EntityMemento, LocationHandle, MementoSet, PolicySpec, Result, StewardError,
};

type PreparedPolicies = HashMap<EntityId, Vec<(Box<dyn Policy>, PolicySpec)>>;

impl ContextBuilder {
    /// Reconstructs a live tree from `set` in a fresh context.
    pub async fn rebind(self, set: &MementoSet) -> Result<ManagementContext, BuildError> {
        let inner = self.assemble()?;
        let policies = validate(&inner, set)?;
        let entities = build_tree(&inner, set)?;

        let reattached = reattach_locations(&inner, set, &entities).await?;

        for memento in set.ordered() {
            if let Some(entity) = entities.get(&memento.id) {
                entity.force_lifecycle(memento.lifecycle.rebound())?;
            }
        }

        inner.set_state(ContextState::Active);
        let mut activated = 0usize;
        for (id, prepared) in policies {
            if let Some(entity) = entities.get(&id) {
                for (policy, spec) in prepared {
                    inner.attach_policy(entity, policy, Some(spec));
                    activated += 1;
                }
            }
        }

        info!(
            entities = entities.len(),
            locations = reattached,
            policies = activated,
            "rebind complete"
        );
        Ok(ManagementContext::from_inner(inner))
    }
}

/// Everything that can fail without side effects.
fn validate(inner: &Arc<ContextInner>, set: &MementoSet) -> Result<PreparedPolicies> {
    set.validate()?;
    let mut prepared = PreparedPolicies::new();
    for memento in &set.entities {
        let descriptor = inner.registry.lookup_type(&memento.type_name)?;
        for (name, attr) in &memento.attributes {
            if let Some(declared) = descriptor.sensors().find(|s| s.name() == name)
                && declared.value_type() != attr.value.value_type()
            {
                return Err(StewardError::TypeMismatch {
                    name: name.clone(),
                    expected: declared.value_type(),
                    actual: attr.value.value_type(),
                });
            }
        }
        if let Some(handle) = &memento.location {
            inner.locations.get(&handle.location)?;
        }
        for spec in &memento.policies {
            let policy = inner
                .registry
                .create_policy(&spec.type_name, &spec.config, &inner.config)?;
            prepared
                .entry(memento.id)
                .or_default()
                .push((policy, spec.clone()));
        }
    }
    Ok(prepared)
}

fn build_tree(inner: &Arc<ContextInner>, set: &MementoSet) -> Result<HashMap<EntityId, Arc<Entity>>> {
    let mut built: HashMap<EntityId, Arc<Entity>> = HashMap::new();
    for memento in set.ordered() {
        let parent = memento.parent.and_then(|p| built.get(&p).cloned());
        let entity = restore_entity(inner, memento, parent.as_ref())?;
        inner.insert(entity.clone(), parent.as_ref())?;
        built.insert(entity.id(), entity);
    }
    Ok(built)
}

fn restore_entity(
    inner: &Arc<ContextInner>,
    memento: &EntityMemento,
    parent: Option<&Arc<Entity>>,
) -> Result<Arc<Entity>> {
    let entity = inner
        .new_entity(memento.id, &memento.type_name, memento.config.clone(), parent)?
        .with_display_name(memento.display_name.clone());
    entity.attributes().restore(&memento.attributes)?;
    Ok(Arc::new(entity))
}

async fn reattach_locations(
    inner: &Arc<ContextInner>,
    set: &MementoSet,
    entities: &HashMap<EntityId, Arc<Entity>>,
) -> Result<usize> {
    let mut done: Vec<LocationHandle> = Vec::new();
    for memento in set.ordered() {
        let (Some(handle), Some(entity)) = (&memento.location, entities.get(&memento.id)) else {
            continue;
        };
        let attached = async {
            let location = inner.locations.get(&handle.location)?;
            let handle = location.reattach(handle).await?;
            inner.locations.bind(&handle, entity.id())?;
            Ok::<_, StewardError>(handle)
        }
        .await;
        match attached {
            Ok(handle) => {
                entity.set_location(Some(handle.clone()));
                done.push(handle);
            }
            Err(e) => {
                warn!(entity = %memento.id, error = %e, "reattach failed, rolling back");
                for handle in &done {
                    let _ = inner.locations.release(handle).await;
                }
                return Err(e);
            }
        }
    }
    Ok(done.len())
}
