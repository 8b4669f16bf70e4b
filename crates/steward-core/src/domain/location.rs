//! Location values shared by the `Location` port, entities and mementos.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ids::{EntityId, LocationHandleId};

/// Opaque reference to a provisioned machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationHandle {
    pub id: LocationHandleId,
    /// Name of the `Location` that issued the handle.
    pub location: String,
    pub address: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRequirements {
    pub entity: Option<EntityId>,
    pub entity_type: String,
    #[serde(default)]
    pub hints: BTreeMap<String, String>,
}

/// A single step run on a provisioned machine.
///
/// Once `execute` has been called the step counts as committed: cancelling
/// afterwards leaves the entity `ON_FIRE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationAction {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl LocationAction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: serde_json::Value::Null,
        }
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }
}
