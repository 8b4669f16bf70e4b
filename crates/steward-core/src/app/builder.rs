//! ContextBuilder - ManagementContext の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 開発体験の改善（明確なエラーメッセージ）

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::runtime::Handle;
use tracing::info;

use crate::app::bus::EventBus;
use crate::app::context::{ContextInner, ContextState, EntityTable, ManagementContext};
use crate::app::locations::LocationManager;
use crate::app::policy::PolicyManager;
use crate::app::registry::{PolicyFactory, TypeDescriptor, TypeRegistry};
use crate::config::RuntimeConfig;
use crate::domain::StewardError;
use crate::policies;
use crate::ports::{Clock, IdGenerator, Location, SystemClock, UlidGenerator};

/// ContextBuilder はランタイムを構築
///
/// # 使用例
/// ```ignore
/// let ctx = ContextBuilder::new()
///     .register_type(TypeDescriptor::new("webserver"))
///     .with_location(Arc::new(InMemoryLocation::new("localhost")))
///     .expect_types(&["webserver"])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - expect_types() で期待される型名を登録
/// - build() / rebind() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 重複登録や不足があれば BuildError を返す
///
/// `Clone` なので、同じ設定から独立したコンテキストを何度でも作れます。
#[derive(Clone)]
pub struct ContextBuilder {
    config: RuntimeConfig,
    types: Vec<Arc<TypeDescriptor>>,
    policies: Vec<(String, PolicyFactory)>,
    locations: Vec<Arc<dyn Location>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    expected_types: Option<Vec<String>>,
    runtime: Option<Handle>,
}

/// BuildError はコンテキスト構築時のエラー
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildError {
    #[error("Missing entity types: {0:?}. These types were expected but not registered.")]
    MissingTypes(Vec<String>),

    #[error("entity type registered twice: {0}")]
    DuplicateType(String),

    #[error("policy factory registered twice: {0}")]
    DuplicatePolicy(String),

    #[error("location registered twice: {0}")]
    DuplicateLocation(String),

    #[error("type {type_name} declares built-in effector {effector}")]
    ReservedEffector { type_name: String, effector: String },

    #[error("no tokio runtime: build the context from within a runtime or pass one")]
    NoRuntime,

    #[error("rebind failed: {0}")]
    Rebind(#[from] StewardError),
}

impl ContextBuilder {
    /// Built-in policy factories are pre-registered.
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            types: Vec::new(),
            policies: policies::builtin_factories(),
            locations: Vec::new(),
            clock: None,
            ids: None,
            expected_types: None,
            runtime: None,
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn register_type(mut self, descriptor: TypeDescriptor) -> Self {
        self.types.push(Arc::new(descriptor));
        self
    }

    pub fn register_policy(mut self, name: impl Into<String>, factory: PolicyFactory) -> Self {
        self.policies.push((name.into(), factory));
        self
    }

    pub fn with_location(mut self, location: Arc<dyn Location>) -> Self {
        self.locations.push(location);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// 期待される型名のリストを設定
    pub fn expect_types(mut self, type_names: &[&str]) -> Self {
        self.expected_types = Some(type_names.iter().map(|t| t.to_string()).collect());
        self
    }

    /// Validates and wires everything; the context stays in `Init`.
    pub(crate) fn assemble(self) -> Result<Arc<ContextInner>, BuildError> {
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| BuildError::NoRuntime)?,
        };

        let mut registry = TypeRegistry::new();
        for descriptor in self.types {
            registry.register_type(descriptor)?;
        }
        for (name, factory) in self.policies {
            registry.register_policy(name, factory)?;
        }
        if let Some(expected) = &self.expected_types {
            let registered = registry.registered_types();
            let missing: Vec<String> = expected
                .iter()
                .filter(|t| !registered.contains(t))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingTypes(missing));
            }
        }

        let mut locations: BTreeMap<String, Arc<dyn Location>> = BTreeMap::new();
        for location in self.locations {
            let name = location.name().to_string();
            if locations.insert(name.clone(), location).is_some() {
                return Err(BuildError::DuplicateLocation(name));
            }
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));

        Ok(Arc::new(ContextInner {
            state: Mutex::new(ContextState::Init),
            config: self.config,
            registry,
            table: RwLock::new(EntityTable::default()),
            bus: Arc::new(EventBus::new(runtime.clone())),
            locations: LocationManager::new(locations),
            policies: PolicyManager::default(),
            ids,
            clock,
            runtime,
        }))
    }

    /// ContextBuilder を構築して空の ManagementContext を生成
    pub fn build(self) -> Result<ManagementContext, BuildError> {
        let inner = self.assemble()?;
        inner.set_state(ContextState::Active);
        info!(
            types = inner.registry.registered_types().len(),
            locations = inner.locations.len(),
            "management context active"
        );
        Ok(ManagementContext::from_inner(inner))
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
