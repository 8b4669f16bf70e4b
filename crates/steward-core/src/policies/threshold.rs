//! ThresholdPolicy - 数値センサーが上限を超えたら effector を呼ぶ
//!
//! 一度発火したら、値が下限を下回るまで再発火しません（ヒステリシス）。
//! 派生センサー（windowed rate など）の消費者として使います。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::app::policy::{Policy, PolicyContext};
use crate::domain::{EntityId, Parameters, Result, SensorEvent, StewardError, SubscriptionFilter};

pub const TYPE_NAME: &str = "threshold";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub sensor: String,
    pub upper: f64,
    /// Re-arm level; defaults to `upper`.
    #[serde(default)]
    pub lower: Option<f64>,
    pub effector: String,
    #[serde(default)]
    pub params: Parameters,
}

pub struct ThresholdPolicy {
    config: ThresholdConfig,
    armed: bool,
}

impl ThresholdPolicy {
    pub fn new(config: ThresholdConfig) -> Result<Self> {
        if config.lower.is_some_and(|lower| lower > config.upper) {
            return Err(StewardError::InvalidParameter(format!(
                "threshold on {}: lower bound above upper bound",
                config.sensor
            )));
        }
        Ok(Self { config, armed: true })
    }

    fn lower(&self) -> f64 {
        self.config.lower.unwrap_or(self.config.upper)
    }

    /// Returns true when the effector should fire for `value`.
    fn observe(&mut self, value: f64) -> bool {
        if self.armed && value > self.config.upper {
            self.armed = false;
            return true;
        }
        if !self.armed && value < self.lower() {
            self.armed = true;
        }
        false
    }
}

#[async_trait]
impl Policy for ThresholdPolicy {
    fn name(&self) -> &str {
        TYPE_NAME
    }

    fn subscriptions(&self, entity: EntityId) -> Vec<SubscriptionFilter> {
        vec![SubscriptionFilter::entity(entity).sensor(self.config.sensor.clone())]
    }

    async fn on_event(&mut self, ctx: &PolicyContext, event: SensorEvent) -> Result<()> {
        let Some(value) = event.value.as_f64() else {
            return Ok(());
        };
        if !self.observe(value) {
            return Ok(());
        }
        info!(
            entity = %ctx.entity(),
            sensor = %self.config.sensor,
            value,
            effector = %self.config.effector,
            "threshold crossed"
        );
        let handle = ctx.invoke(ctx.entity(), &self.config.effector, self.config.params.clone())?;
        if let Err(e) = handle.wait().await {
            warn!(entity = %ctx.entity(), effector = %self.config.effector, error = %e, "threshold action failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn policy(upper: f64, lower: Option<f64>) -> ThresholdPolicy {
        ThresholdPolicy::new(ThresholdConfig {
            sensor: "load".into(),
            upper,
            lower,
            effector: "scaleUp".into(),
            params: Parameters::new(),
        })
        .unwrap()
    }

    #[rstest]
    #[case::fires_once_above(vec![5.0, 12.0, 15.0, 11.0], 1)]
    #[case::rearms_below_lower(vec![12.0, 4.0, 12.0], 2)]
    #[case::between_bounds_stays_disarmed(vec![12.0, 8.0, 12.0], 1)]
    #[case::never_crosses(vec![1.0, 9.9, 10.0], 0)]
    fn hysteresis(#[case] values: Vec<f64>, #[case] fired: usize) {
        let mut p = policy(10.0, Some(5.0));
        let count = values.into_iter().filter(|v| p.observe(*v)).count();
        assert_eq!(count, fired);
    }

    #[test]
    fn lower_above_upper_is_rejected() {
        let err = ThresholdPolicy::new(ThresholdConfig {
            sensor: "load".into(),
            upper: 1.0,
            lower: Some(2.0),
            effector: "scaleUp".into(),
            params: Parameters::new(),
        })
        .err()
        .unwrap();
        assert!(matches!(err, StewardError::InvalidParameter(_)));
    }
}
