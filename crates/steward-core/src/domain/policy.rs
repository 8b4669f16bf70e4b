//! Persistable description of an attached policy.

use serde::{Deserialize, Serialize};

/// Factory name plus JSON config, enough to re-create a policy on rebind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySpec {
    pub type_name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl PolicySpec {
    pub fn new(type_name: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            type_name: type_name.into(),
            config,
        }
    }
}
