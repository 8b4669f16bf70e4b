//! Built-in policies.
//!
//! `ContextBuilder::new()` registers these factories under their type names,
//! so a `PolicySpec { type_name: "windowed-rate", .. }` works out of the box.

pub mod health_check;
pub mod restarter;
pub mod retry;
pub mod threshold;
pub mod windowed_rate;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::app::policy::Policy;
use crate::app::registry::PolicyFactory;
use crate::config::RuntimeConfig;
use crate::domain::{Result, StewardError};

pub use health_check::{HealthCheckConfig, HealthCheckPolicy};
pub use restarter::{RESTARTS_EXHAUSTED, RestarterConfig, ServiceRestarterPolicy};
pub use retry::RetryPolicy;
pub use threshold::{ThresholdConfig, ThresholdPolicy};
pub use windowed_rate::{WindowedRateConfig, WindowedRatePolicy};

fn factory<F>(f: F) -> PolicyFactory
where
    F: Fn(&Value, &RuntimeConfig) -> Result<Box<dyn Policy>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// `null` counts as an empty object.
fn parse<T: DeserializeOwned>(type_name: &str, config: &Value) -> Result<T> {
    let config = if config.is_null() {
        Value::Object(Default::default())
    } else {
        config.clone()
    };
    serde_json::from_value(config)
        .map_err(|e| StewardError::InvalidParameter(format!("{type_name} config: {e}")))
}

pub fn builtin_factories() -> Vec<(String, PolicyFactory)> {
    vec![
        (
            windowed_rate::TYPE_NAME.to_string(),
            factory(|config, runtime| {
                let config = parse(windowed_rate::TYPE_NAME, config)?;
                let policy: Box<dyn Policy> = Box::new(WindowedRatePolicy::from_config(config, runtime));
                Ok(policy)
            }),
        ),
        (
            health_check::TYPE_NAME.to_string(),
            factory(|config, runtime| {
                let config = parse(health_check::TYPE_NAME, config)?;
                let policy: Box<dyn Policy> = Box::new(HealthCheckPolicy::from_config(config, runtime));
                Ok(policy)
            }),
        ),
        (
            restarter::TYPE_NAME.to_string(),
            factory(|config, runtime| {
                let config = parse(restarter::TYPE_NAME, config)?;
                let policy: Box<dyn Policy> = Box::new(ServiceRestarterPolicy::from_config(config, runtime));
                Ok(policy)
            }),
        ),
        (
            threshold::TYPE_NAME.to_string(),
            factory(|config, _| {
                let config = parse(threshold::TYPE_NAME, config)?;
                let policy: Box<dyn Policy> = Box::new(ThresholdPolicy::new(config)?);
                Ok(policy)
            }),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create(name: &str, config: Value) -> Result<Box<dyn Policy>> {
        let factories = builtin_factories();
        let (_, factory) = factories.iter().find(|(n, _)| n == name).unwrap();
        factory(&config, &RuntimeConfig::default())
    }

    #[test]
    fn every_builtin_is_named_after_its_factory() {
        for (name, config) in [
            ("windowed-rate", json!({"source": "webapp.reqs.total"})),
            ("health-check", Value::Null),
            ("service-restarter", json!({})),
            ("threshold", json!({"sensor": "x", "upper": 1.0, "effector": "scale"})),
        ] {
            assert_eq!(create(name, config).unwrap().name(), name);
        }
    }

    #[test]
    fn missing_required_field_is_invalid_parameter() {
        let err = create("windowed-rate", json!({})).err().unwrap();
        assert!(matches!(err, StewardError::InvalidParameter(msg) if msg.contains("windowed-rate")));
    }
}
