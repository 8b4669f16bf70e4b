//! Sensor declarations.
//!
//! A sensor is just `(name, type)`; its current value lives in the owning
//! entity's attribute store.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::value::ValueType;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sensor {
    name: Cow<'static, str>,
    value_type: ValueType,
    /// Publish on every `set`, even when the value did not change.
    #[serde(default)]
    always_publish: bool,
}

impl Sensor {
    pub const fn new(name: &'static str, value_type: ValueType) -> Self {
        Self {
            name: Cow::Borrowed(name),
            value_type,
            always_publish: false,
        }
    }

    /// Sensor whose name is only known at runtime (e.g. from policy config).
    pub fn named(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            value_type,
            always_publish: false,
        }
    }

    pub const fn always_publish(mut self) -> Self {
        self.always_publish = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn is_always_publish(&self) -> bool {
        self.always_publish
    }
}

impl fmt::Display for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.value_type)
    }
}

/// Lifecycle state as text (`RUNNING`, `ON_FIRE`, ...).
pub const SERVICE_STATE: Sensor = Sensor::new("service.state", ValueType::Text);

/// True iff the lifecycle state is `RUNNING`.
pub const SERVICE_UP: Sensor = Sensor::new("service.isUp", ValueType::Bool);

/// Sensors written only by lifecycle transitions.
pub fn is_lifecycle_sensor(name: &str) -> bool {
    name == SERVICE_STATE.name() || name == SERVICE_UP.name()
}

/// Sensors conventionally published by web-serving entities.
pub mod web {
    use super::Sensor;
    use crate::domain::value::ValueType;

    pub const ROOT_URL: Sensor = Sensor::new("webapp.url", ValueType::Text);
    pub const REQUEST_COUNT: Sensor = Sensor::new("webapp.reqs.total", ValueType::Integer);
    pub const ERROR_COUNT: Sensor = Sensor::new("webapp.reqs.errors", ValueType::Integer);
    pub const REQUESTS_PER_SECOND: Sensor =
        Sensor::new("webapp.reqs.perSec.windowed", ValueType::Double).always_publish();
    pub const DEPLOYED_ARTIFACTS: Sensor = Sensor::new("webapp.deployedArtifacts", ValueType::TextSet);
}
