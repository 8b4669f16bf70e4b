//! Effector declarations: names, parameter schemas and invocation status.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::{Result, StewardError};
use super::value::{AttributeValue, ValueType};

pub const START: &str = "start";
pub const STOP: &str = "stop";
pub const RESTART: &str = "restart";
pub const DESTROY: &str = "destroy";
pub const CHECK_HEALTH: &str = "checkHealth";

/// Parameter name `start` accepts to pick a registered location.
pub const LOCATION_PARAM: &str = "location";

pub type Parameters = BTreeMap<String, AttributeValue>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub value_type: ValueType,
    pub required: bool,
}

impl ParameterSpec {
    pub fn required(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            required: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectorSpec {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
    /// Serialized per entity with the other lifecycle effectors.
    pub mutates_lifecycle: bool,
}

impl EffectorSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
            mutates_lifecycle: false,
        }
    }

    pub fn param(mut self, param: ParameterSpec) -> Self {
        self.parameters.push(param);
        self
    }

    pub fn lifecycle(mut self) -> Self {
        self.mutates_lifecycle = true;
        self
    }

    /// Rejects unknown names, missing required parameters and wrong types.
    pub fn validate(&self, params: &Parameters) -> Result<()> {
        for name in params.keys() {
            if !self.parameters.iter().any(|p| &p.name == name) {
                return Err(StewardError::InvalidParameter(format!(
                    "{}: unknown parameter {name}",
                    self.name
                )));
            }
        }
        for spec in &self.parameters {
            match params.get(&spec.name) {
                None if spec.required => {
                    return Err(StewardError::InvalidParameter(format!(
                        "{}: missing required parameter {}",
                        self.name, spec.name
                    )));
                }
                Some(value) if value.value_type() != spec.value_type => {
                    return Err(StewardError::InvalidParameter(format!(
                        "{}: parameter {} expects {}, got {}",
                        self.name,
                        spec.name,
                        spec.value_type,
                        value.value_type()
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Built-in effectors every entity carries.
pub fn builtin_specs() -> Vec<EffectorSpec> {
    vec![
        EffectorSpec::new(START, "Provision a location and start the entity")
            .param(ParameterSpec::optional(LOCATION_PARAM, ValueType::Text))
            .lifecycle(),
        EffectorSpec::new(STOP, "Stop the entity and release its location").lifecycle(),
        EffectorSpec::new(RESTART, "Restart the entity in place").lifecycle(),
        EffectorSpec::new(DESTROY, "Stop and remove the entity and its descendants").lifecycle(),
        EffectorSpec::new(CHECK_HEALTH, "Probe the entity and mark it ON_FIRE if unhealthy").lifecycle(),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EffectorStatus {
    Queued,
    Running,
    /// Deadline passed; the body keeps running.
    TimedOut,
    Succeeded,
    Failed,
    Cancelled,
}

impl EffectorStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EffectorStatus::Succeeded | EffectorStatus::Failed | EffectorStatus::Cancelled
        )
    }
}

impl fmt::Display for EffectorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EffectorStatus::Queued => "QUEUED",
            EffectorStatus::Running => "RUNNING",
            EffectorStatus::TimedOut => "TIMED_OUT",
            EffectorStatus::Succeeded => "SUCCEEDED",
            EffectorStatus::Failed => "FAILED",
            EffectorStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Overrides `effectors.default_timeout_ms`.
    pub timeout: Option<Duration>,
}

impl InvokeOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}
