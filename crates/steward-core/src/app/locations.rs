//! LocationManager - 登録済み Location と handle の束縛表
//!
//! handle は同時に 1 エンティティにしか束縛できません。付け替えるには
//! 先に `release` / `unbind` が必要です。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::domain::{EntityId, LocationHandle, LocationHandleId, Result, StewardError};
use crate::ports::Location;

#[derive(Default)]
pub struct LocationManager {
    locations: BTreeMap<String, Arc<dyn Location>>,
    bindings: Mutex<HashMap<LocationHandleId, (String, EntityId)>>,
}

impl LocationManager {
    pub(crate) fn new(locations: BTreeMap<String, Arc<dyn Location>>) -> Self {
        Self {
            locations,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Location>> {
        self.locations
            .get(name)
            .cloned()
            .ok_or_else(|| StewardError::LocationUnavailable(format!("no location named {name}")))
    }

    /// The registered location when exactly one exists.
    pub fn only(&self) -> Option<Arc<dyn Location>> {
        if self.locations.len() == 1 {
            self.locations.values().next().cloned()
        } else {
            None
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.locations.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub(crate) fn bind(&self, handle: &LocationHandle, entity: EntityId) -> Result<()> {
        let mut bindings = self.bindings.lock().unwrap_or_else(PoisonError::into_inner);
        match bindings.get(&handle.id) {
            Some((_, owner)) if *owner != entity => Err(StewardError::LocationUnavailable(format!(
                "{} is already bound to {owner}",
                handle.id
            ))),
            _ => {
                bindings.insert(handle.id, (handle.location.clone(), entity));
                Ok(())
            }
        }
    }

    pub(crate) fn unbind(&self, handle: LocationHandleId) -> Option<EntityId> {
        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle)
            .map(|(_, entity)| entity)
    }

    pub fn bound_to(&self, handle: LocationHandleId) -> Option<EntityId> {
        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle)
            .map(|(_, entity)| *entity)
    }

    /// Number of handles of `location` currently bound to an entity.
    pub fn bound_count(&self, location: &str) -> usize {
        self.bindings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|(name, _)| name == location)
            .count()
    }

    /// Releases on the back-end, then unbinds even if the release failed.
    pub(crate) async fn release(&self, handle: &LocationHandle) -> Result<()> {
        let result = match self.get(&handle.location) {
            Ok(location) => location.release(handle).await.map_err(StewardError::from),
            Err(e) => Err(e),
        };
        self.unbind(handle.id);
        match &result {
            Ok(()) => debug!(handle = %handle.id, location = %handle.location, "location released"),
            Err(e) => warn!(handle = %handle.id, location = %handle.location, error = %e, "release failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryLocation;
    use crate::domain::LocationRequirements;

    fn manager() -> (Arc<InMemoryLocation>, LocationManager) {
        let loc = Arc::new(InMemoryLocation::new("localhost"));
        let mut map: BTreeMap<String, Arc<dyn Location>> = BTreeMap::new();
        map.insert("localhost".into(), loc.clone());
        (loc, LocationManager::new(map))
    }

    #[tokio::test]
    async fn handle_binds_to_one_entity_at_a_time() {
        let (loc, mgr) = manager();
        let handle = loc.provision(&LocationRequirements::default()).await.unwrap();
        let (a, b) = (EntityId::generate(), EntityId::generate());

        mgr.bind(&handle, a).unwrap();
        mgr.bind(&handle, a).unwrap();
        assert!(matches!(mgr.bind(&handle, b), Err(StewardError::LocationUnavailable(_))));
        assert_eq!(mgr.bound_count("localhost"), 1);

        mgr.release(&handle).await.unwrap();
        assert_eq!(mgr.bound_count("localhost"), 0);
        mgr.bind(&handle, b).unwrap();
        assert_eq!(mgr.bound_to(handle.id), Some(b));
    }

    #[test]
    fn only_requires_a_single_location() {
        let (_, mgr) = manager();
        assert!(mgr.only().is_some());
        assert!(LocationManager::default().only().is_none());
        assert!(matches!(mgr.get("cloud"), Err(StewardError::LocationUnavailable(_))));
    }
}
