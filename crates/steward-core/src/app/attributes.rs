//! AttributeStore - エンティティごとのセンサー値
//!
//! # 不変条件
//! - `set` ごとに (entity, sensor) の sequence を 1 つ進める
//! - 値が変わった（または always_publish の）`set` は返る前にちょうど 1 回 publish する
//! - publish はロックを保持したまま行うので、チャネル上の順序 = sequence 順
//! - 型が合わない `set` はストアを変更しない

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::trace;

use crate::app::bus::EventBus;
use crate::domain::{
    AttributeMemento, AttributeValue, EntityId, Result, Sensor, SensorEvent, StewardError,
};
use crate::ports::Clock;

#[derive(Debug, Default)]
struct Slot {
    value: Option<AttributeValue>,
    sequence: u64,
}

pub struct AttributeStore {
    entity: EntityId,
    /// Ancestors, nearest first.
    lineage: Vec<EntityId>,
    /// Sensors declared by the entity type.
    schema: Arc<BTreeMap<String, Sensor>>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl AttributeStore {
    pub(crate) fn new(
        entity: EntityId,
        lineage: Vec<EntityId>,
        schema: Arc<BTreeMap<String, Sensor>>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            entity,
            lineage,
            schema,
            bus,
            clock,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Overwrites the value and returns the previous one.
    pub fn set(&self, sensor: &Sensor, value: AttributeValue) -> Result<Option<AttributeValue>> {
        let declared = self.schema.get(sensor.name());
        let expected = declared.map_or(sensor.value_type(), Sensor::value_type);
        if value.value_type() != expected || sensor.value_type() != expected {
            return Err(StewardError::TypeMismatch {
                name: sensor.name().to_string(),
                expected,
                actual: value.value_type(),
            });
        }
        let always_publish =
            sensor.is_always_publish() || declared.is_some_and(Sensor::is_always_publish);

        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = slots.get(sensor.name()).and_then(|s| s.value.as_ref())
            && current.value_type() != expected
        {
            return Err(StewardError::TypeMismatch {
                name: sensor.name().to_string(),
                expected: current.value_type(),
                actual: value.value_type(),
            });
        }

        let slot = slots.entry(sensor.name().to_string()).or_default();
        slot.sequence += 1;
        let changed = slot.value.as_ref() != Some(&value);
        let prior = slot.value.replace(value.clone());

        if changed || always_publish {
            let event = SensorEvent {
                source: self.entity,
                sensor: sensor.name().to_string(),
                value,
                timestamp: self.clock.now(),
                sequence: slot.sequence,
            };
            trace!(entity = %self.entity, sensor = %event.sensor, sequence = event.sequence, "publish");
            self.bus.publish(&event, &self.lineage);
        }
        Ok(prior)
    }

    pub fn get(&self, name: &str) -> Option<AttributeValue> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .and_then(|s| s.value.clone())
    }

    /// Last sequence number assigned for `name` (0 if never set).
    pub fn sequence(&self, name: &str) -> u64 {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map_or(0, |s| s.sequence)
    }

    pub fn names(&self) -> Vec<String> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<_> = slots
            .iter()
            .filter(|(_, s)| s.value.is_some())
            .map(|(k, _)| k.clone())
            .collect();
        names.sort();
        names
    }

    pub fn snapshot(&self) -> BTreeMap<String, AttributeMemento> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|(name, slot)| {
                slot.value.clone().map(|value| {
                    (
                        name.clone(),
                        AttributeMemento {
                            value,
                            sequence: slot.sequence,
                        },
                    )
                })
            })
            .collect()
    }

    /// Loads values and sequence numbers without publishing.
    pub(crate) fn restore(&self, values: &BTreeMap<String, AttributeMemento>) -> Result<()> {
        for (name, m) in values {
            if let Some(declared) = self.schema.get(name)
                && declared.value_type() != m.value.value_type()
            {
                return Err(StewardError::TypeMismatch {
                    name: name.clone(),
                    expected: declared.value_type(),
                    actual: m.value.value_type(),
                });
            }
        }
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        for (name, m) in values {
            slots.insert(
                name.clone(),
                Slot {
                    value: Some(m.value.clone()),
                    sequence: m.sequence,
                },
            );
        }
        Ok(())
    }
}
