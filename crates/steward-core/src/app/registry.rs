//! TypeRegistry - エンティティ型とポリシーファクトリのカタログ
//!
//! クラスロードや classpath スキャンの代わりに、起動時に明示的に登録します。
//! ビルド後は不変なのでロックは持ちません。

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::app::builder::BuildError;
use crate::app::driver::{EntityDriver, GroupDriver, ProcessDriver};
use crate::app::effector::Effector;
use crate::app::policy::Policy;
use crate::config::RuntimeConfig;
use crate::domain::effector::builtin_specs;
use crate::domain::{EffectorSpec, Result, Sensor, StewardError};

/// Builds a policy from its persisted JSON config.
pub type PolicyFactory =
    Arc<dyn Fn(&serde_json::Value, &RuntimeConfig) -> Result<Box<dyn Policy>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigKey {
    pub name: String,
    pub description: String,
    pub default: Option<serde_json::Value>,
}

impl ConfigKey {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            default: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<serde_json::Value>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// Everything the runtime knows about an entity type.
///
/// # 使用例
/// ```ignore
/// let web = TypeDescriptor::new("webserver")
///     .sensor(web::REQUEST_COUNT)
///     .config_key(ConfigKey::new("port", "listen port").with_default(8080))
///     .effector(Deploy);
/// ```
pub struct TypeDescriptor {
    name: String,
    description: String,
    sensors: Arc<BTreeMap<String, Sensor>>,
    config_keys: Vec<ConfigKey>,
    effectors: BTreeMap<String, (EffectorSpec, Arc<dyn Effector>)>,
    driver: Arc<dyn EntityDriver>,
}

impl TypeDescriptor {
    /// A type whose lifecycle runs a process on a location.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_driver(name, ProcessDriver)
    }

    /// A type whose lifecycle fans out to its children.
    pub fn group(name: impl Into<String>) -> Self {
        Self::with_driver(name, GroupDriver)
    }

    pub fn with_driver(name: impl Into<String>, driver: impl EntityDriver + 'static) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            sensors: Arc::new(BTreeMap::new()),
            config_keys: Vec::new(),
            effectors: BTreeMap::new(),
            driver: Arc::new(driver),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn sensor(mut self, sensor: Sensor) -> Self {
        Arc::make_mut(&mut self.sensors).insert(sensor.name().to_string(), sensor);
        self
    }

    pub fn config_key(mut self, key: ConfigKey) -> Self {
        self.config_keys.push(key);
        self
    }

    pub fn effector(mut self, effector: impl Effector + 'static) -> Self {
        let spec = effector.spec();
        self.effectors
            .insert(spec.name.clone(), (spec, Arc::new(effector)));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn summary(&self) -> &str {
        &self.description
    }

    pub fn sensors(&self) -> impl Iterator<Item = &Sensor> {
        self.sensors.values()
    }

    pub(crate) fn sensor_schema(&self) -> Arc<BTreeMap<String, Sensor>> {
        self.sensors.clone()
    }

    pub fn config_keys(&self) -> &[ConfigKey] {
        &self.config_keys
    }

    pub(crate) fn driver(&self) -> &Arc<dyn EntityDriver> {
        &self.driver
    }

    /// Built-ins first, then the type's own effectors.
    pub fn effector_specs(&self) -> Vec<EffectorSpec> {
        builtin_specs()
            .into_iter()
            .chain(self.effectors.values().map(|(spec, _)| spec.clone()))
            .collect()
    }

    pub fn effector_spec(&self, name: &str) -> Option<EffectorSpec> {
        builtin_specs()
            .into_iter()
            .find(|s| s.name == name)
            .or_else(|| self.effectors.get(name).map(|(spec, _)| spec.clone()))
    }

    pub(crate) fn custom_effector(&self, name: &str) -> Option<Arc<dyn Effector>> {
        self.effectors.get(name).map(|(_, e)| e.clone())
    }

    /// Custom effectors may not shadow a built-in name.
    pub(crate) fn check_reserved(&self) -> std::result::Result<(), BuildError> {
        let builtins = builtin_specs();
        match self
            .effectors
            .keys()
            .find(|name| builtins.iter().any(|b| &b.name == *name))
        {
            Some(name) => Err(BuildError::ReservedEffector {
                type_name: self.name.clone(),
                effector: name.clone(),
            }),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("sensors", &self.sensors.keys().collect::<Vec<_>>())
            .field("effectors", &self.effectors.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Default, Clone)]
pub struct TypeRegistry {
    types: BTreeMap<String, Arc<TypeDescriptor>>,
    policies: BTreeMap<String, PolicyFactory>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_type(&mut self, descriptor: Arc<TypeDescriptor>) -> std::result::Result<(), BuildError> {
        descriptor.check_reserved()?;
        if self.types.contains_key(descriptor.name()) {
            return Err(BuildError::DuplicateType(descriptor.name().to_string()));
        }
        self.types.insert(descriptor.name().to_string(), descriptor);
        Ok(())
    }

    pub fn lookup_type(&self, name: &str) -> Result<Arc<TypeDescriptor>> {
        self.types
            .get(name)
            .cloned()
            .ok_or_else(|| StewardError::UnknownType(name.to_string()))
    }

    /// Case-insensitive substring match on the type name; `None` lists all.
    pub fn list_types(&self, filter: Option<&str>) -> Vec<Arc<TypeDescriptor>> {
        let needle = filter.map(str::to_lowercase);
        self.types
            .values()
            .filter(|t| match &needle {
                Some(n) => t.name().to_lowercase().contains(n.as_str()),
                None => true,
            })
            .cloned()
            .collect()
    }

    pub fn config_keys(&self, type_name: &str) -> Result<Vec<ConfigKey>> {
        Ok(self.lookup_type(type_name)?.config_keys().to_vec())
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }

    pub fn register_policy(
        &mut self,
        name: impl Into<String>,
        factory: PolicyFactory,
    ) -> std::result::Result<(), BuildError> {
        let name = name.into();
        if self.policies.contains_key(&name) {
            return Err(BuildError::DuplicatePolicy(name));
        }
        self.policies.insert(name, factory);
        Ok(())
    }

    pub fn list_policies(&self) -> Vec<String> {
        self.policies.keys().cloned().collect()
    }

    pub fn create_policy(
        &self,
        name: &str,
        config: &serde_json::Value,
        runtime: &RuntimeConfig,
    ) -> Result<Box<dyn Policy>> {
        let factory = self
            .policies
            .get(name)
            .ok_or_else(|| StewardError::PolicyNotFound(name.to_string()))?;
        factory(config, runtime)
    }
}
