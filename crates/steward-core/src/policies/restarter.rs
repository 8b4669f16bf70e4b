//! ServiceRestarterPolicy - ON_FIRE になったら restart を試みる
//!
//! # リトライ戦略
//! - ON_FIRE を観測するたびに attempts を 1 増やし、`RetryPolicy::next_delay` だけ待つ
//! - 待った後もまだ ON_FIRE なら restart を呼んで完了を待つ
//! - RUNNING を観測したら attempts を 0 に戻す
//! - `max_attempts` を使い切ったら諦めて `service.restarter.exhausted = true`
//!
//! restart が失敗すると effector が ON_FIRE に戻すので、次の試行はその
//! イベントから始まります。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::app::policy::{Policy, PolicyContext};
use crate::domain::effector::RESTART;
use crate::domain::{
    AttributeValue, EntityId, Lifecycle, Parameters, Result, Sensor, SensorEvent, SubscriptionFilter,
    ValueType, SERVICE_STATE,
};
use crate::policies::RetryPolicy;

pub const TYPE_NAME: &str = "service-restarter";

/// Set once the attempt budget is spent; cleared on recovery.
pub const RESTARTS_EXHAUSTED: Sensor = Sensor::new("service.restarter.exhausted", ValueType::Bool);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestarterConfig {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
    #[serde(default)]
    pub multiplier: Option<f64>,
}

pub struct ServiceRestarterPolicy {
    retry: RetryPolicy,
    max_attempts: u32,
    attempts: u32,
    exhausted: bool,
}

impl ServiceRestarterPolicy {
    pub fn new(retry: RetryPolicy, max_attempts: u32) -> Self {
        Self {
            retry,
            max_attempts,
            attempts: 0,
            exhausted: false,
        }
    }

    pub fn from_config(config: RestarterConfig, defaults: &crate::config::RuntimeConfig) -> Self {
        let mut retry = defaults.restart.retry_policy();
        if let Some(ms) = config.base_delay_ms {
            retry.base_delay = std::time::Duration::from_millis(ms);
        }
        if let Some(multiplier) = config.multiplier {
            retry.multiplier = multiplier;
        }
        Self::new(retry, config.max_attempts.unwrap_or(defaults.restart.max_attempts))
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    async fn on_fire(&mut self, ctx: &PolicyContext) -> Result<()> {
        let entity = ctx.entity();
        if self.attempts >= self.max_attempts {
            if !self.exhausted {
                self.exhausted = true;
                warn!(entity = %entity, attempts = self.attempts, "restart budget exhausted");
                ctx.set_sensor(entity, &RESTARTS_EXHAUSTED, AttributeValue::Bool(true))?;
            }
            return Ok(());
        }

        self.attempts += 1;
        let delay = self.retry.next_delay(self.attempts);
        info!(entity = %entity, attempt = self.attempts, delay_ms = delay.as_millis() as u64, "scheduling restart");
        tokio::time::sleep(delay).await;

        // someone else may have fixed it meanwhile
        if ctx.lifecycle(entity)? != Lifecycle::OnFire {
            return Ok(());
        }
        if let Err(e) = ctx.invoke(entity, RESTART, Parameters::new())?.wait().await {
            warn!(entity = %entity, attempt = self.attempts, error = %e, "restart failed");
        }
        Ok(())
    }

    fn on_recovered(&mut self, ctx: &PolicyContext) -> Result<()> {
        self.attempts = 0;
        if self.exhausted {
            self.exhausted = false;
            ctx.set_sensor(ctx.entity(), &RESTARTS_EXHAUSTED, AttributeValue::Bool(false))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Policy for ServiceRestarterPolicy {
    fn name(&self) -> &str {
        TYPE_NAME
    }

    fn subscriptions(&self, entity: EntityId) -> Vec<SubscriptionFilter> {
        vec![SubscriptionFilter::entity(entity).sensor(SERVICE_STATE.name())]
    }

    /// A rebound entity may already be on fire.
    async fn on_start(&mut self, ctx: &PolicyContext) -> Result<()> {
        if ctx.lifecycle(ctx.entity())? == Lifecycle::OnFire {
            self.on_fire(ctx).await?;
        }
        Ok(())
    }

    async fn on_event(&mut self, ctx: &PolicyContext, event: SensorEvent) -> Result<()> {
        let Some(state) = event.value.as_str().and_then(|s| s.parse::<Lifecycle>().ok()) else {
            return Ok(());
        };
        match state {
            Lifecycle::OnFire => self.on_fire(ctx).await,
            Lifecycle::Running => self.on_recovered(ctx),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use std::time::Duration;

    #[test]
    fn defaults_come_from_restart_section() {
        let p = ServiceRestarterPolicy::from_config(RestarterConfig::default(), &RuntimeConfig::default());
        assert_eq!(p.max_attempts, 5);
        assert_eq!(p.retry, RetryPolicy::default());
        assert_eq!(p.attempts(), 0);
    }

    #[test]
    fn overrides_apply_field_by_field() {
        let cfg: RestarterConfig =
            serde_json::from_value(serde_json::json!({"max_attempts": 2, "base_delay_ms": 10})).unwrap();
        let p = ServiceRestarterPolicy::from_config(cfg, &RuntimeConfig::default());
        assert_eq!(p.max_attempts, 2);
        assert_eq!(p.retry.base_delay, Duration::from_millis(10));
        assert_eq!(p.retry.multiplier, 2.0);
    }
}
