//! Sensor events and subscription filters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::EntityId;
use super::value::AttributeValue;

/// One attribute change, immutable once published.
///
/// `sequence` increases strictly per `(source, sensor)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorEvent {
    pub source: EntityId,
    pub sensor: String,
    pub value: AttributeValue,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityFilter {
    Any,
    Entity(EntityId),
    /// The entity itself and everything below it.
    DescendantsOf(EntityId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorFilter {
    Any,
    Named(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub entity: EntityFilter,
    pub sensor: SensorFilter,
}

impl SubscriptionFilter {
    pub fn any() -> Self {
        Self {
            entity: EntityFilter::Any,
            sensor: SensorFilter::Any,
        }
    }

    pub fn entity(id: EntityId) -> Self {
        Self {
            entity: EntityFilter::Entity(id),
            sensor: SensorFilter::Any,
        }
    }

    pub fn descendants_of(id: EntityId) -> Self {
        Self {
            entity: EntityFilter::DescendantsOf(id),
            sensor: SensorFilter::Any,
        }
    }

    pub fn sensor(mut self, name: impl Into<String>) -> Self {
        self.sensor = SensorFilter::Named(name.into());
        self
    }

    /// `lineage` is the source's ancestors, nearest first.
    pub fn matches(&self, event: &SensorEvent, lineage: &[EntityId]) -> bool {
        let entity_ok = match &self.entity {
            EntityFilter::Any => true,
            EntityFilter::Entity(id) => *id == event.source,
            EntityFilter::DescendantsOf(id) => *id == event.source || lineage.contains(id),
        };
        let sensor_ok = match &self.sensor {
            SensorFilter::Any => true,
            SensorFilter::Named(name) => *name == event.sensor,
        };
        entity_ok && sensor_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(source: EntityId, sensor: &str) -> SensorEvent {
        SensorEvent {
            source,
            sensor: sensor.to_string(),
            value: AttributeValue::Integer(1),
            timestamp: Utc::now(),
            sequence: 1,
        }
    }

    #[test]
    fn descendants_filter_uses_lineage() {
        let root = EntityId::generate();
        let child = EntityId::generate();
        let other = EntityId::generate();
        let filter = SubscriptionFilter::descendants_of(root);

        assert!(filter.matches(&event(root, "a"), &[]));
        assert!(filter.matches(&event(child, "a"), &[root]));
        assert!(!filter.matches(&event(other, "a"), &[]));
    }

    #[test]
    fn sensor_filter_narrows() {
        let id = EntityId::generate();
        let filter = SubscriptionFilter::entity(id).sensor("b");
        assert!(!filter.matches(&event(id, "a"), &[]));
        assert!(filter.matches(&event(id, "b"), &[]));
    }
}
