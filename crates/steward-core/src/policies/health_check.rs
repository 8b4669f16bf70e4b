//! HealthCheckPolicy - 周期的に checkHealth を呼ぶ
//!
//! RUNNING / ON_FIRE のときだけ呼びます。遷移そのものは effector 側が行うので、
//! ここでは結果をログに残すだけです。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::app::policy::{Policy, PolicyContext};
use crate::domain::effector::CHECK_HEALTH;
use crate::domain::{EntityId, Lifecycle, Parameters, Result, SensorEvent, SubscriptionFilter};

pub const TYPE_NAME: &str = "health-check";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub interval_ms: Option<u64>,
}

pub struct HealthCheckPolicy {
    interval: Duration,
}

impl HealthCheckPolicy {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn from_config(config: HealthCheckConfig, defaults: &crate::config::RuntimeConfig) -> Self {
        Self::new(
            config
                .interval_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| defaults.health_check_interval()),
        )
    }
}

#[async_trait]
impl Policy for HealthCheckPolicy {
    fn name(&self) -> &str {
        TYPE_NAME
    }

    fn subscriptions(&self, _entity: EntityId) -> Vec<SubscriptionFilter> {
        Vec::new()
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.interval)
    }

    async fn on_event(&mut self, _ctx: &PolicyContext, _event: SensorEvent) -> Result<()> {
        Ok(())
    }

    async fn on_tick(&mut self, ctx: &PolicyContext) -> Result<()> {
        let entity = ctx.entity();
        if !matches!(ctx.lifecycle(entity)?, Lifecycle::Running | Lifecycle::OnFire) {
            return Ok(());
        }
        let report = ctx.invoke(entity, CHECK_HEALTH, Parameters::new())?.wait().await?;
        debug!(entity = %entity, report = %report, "health checked");
        Ok(())
    }
}
