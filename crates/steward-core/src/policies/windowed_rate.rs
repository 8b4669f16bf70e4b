//! WindowedRatePolicy - カウンタ → 時間窓あたりの秒間レート
//!
//! rate = (現在値 − 窓の開始時点の値) / 窓の秒数
//!
//! 窓の開始時点の値は「開始時刻以前で最後に観測した値」。窓より古い観測は
//! その 1 件だけを残して捨てます。アイドルが窓 1 つ分続くとレートは 0 に戻ります。
//! 出力センサーは always_publish なので、0 が続いても毎周期イベントになります。

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::app::policy::{Policy, PolicyContext};
use crate::domain::sensor::web;
use crate::domain::{
    AttributeValue, EntityId, Result, Sensor, SensorEvent, StewardError, SubscriptionFilter,
    ValueType,
};

pub const TYPE_NAME: &str = "windowed-rate";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowedRateConfig {
    /// Counter sensor to watch.
    pub source: String,
    /// Derived sensor; defaults to `webapp.reqs.perSec.windowed`.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub window_ms: Option<u64>,
    #[serde(default)]
    pub period_ms: Option<u64>,
}

pub struct WindowedRatePolicy {
    source: String,
    target: Sensor,
    window: Duration,
    period: Duration,
    /// (observed at, counter value), oldest first.
    samples: VecDeque<(DateTime<Utc>, f64)>,
}

impl WindowedRatePolicy {
    pub fn new(source: impl Into<String>, window: Duration, period: Duration) -> Self {
        Self {
            source: source.into(),
            target: web::REQUESTS_PER_SECOND,
            window,
            period,
            samples: VecDeque::new(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Sensor::named(target, ValueType::Double).always_publish();
        self
    }

    pub fn from_config(config: WindowedRateConfig, defaults: &crate::config::RuntimeConfig) -> Self {
        let window = config
            .window_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| defaults.rate_window());
        let period = config
            .period_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| defaults.rate_period());
        let policy = Self::new(config.source, window, period);
        match config.target {
            Some(target) => policy.with_target(target),
            None => policy,
        }
    }

    fn record(&mut self, at: DateTime<Utc>, value: f64) {
        if let Some(&(last_at, last)) = self.samples.back() {
            // published before the baseline was read
            if at < last_at {
                return;
            }
            // a counter reset starts a new series
            if value < last {
                self.samples.clear();
            }
        }
        self.samples.push_back((at, value));
    }

    /// Rate over the window ending at `now`; drops samples no longer needed.
    fn rate_at(&mut self, now: DateTime<Utc>) -> f64 {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::MAX);
        let start = now - window;
        while self.samples.len() > 1 && self.samples[1].0 <= start {
            self.samples.pop_front();
        }
        let (Some((_, first)), Some((_, last))) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let secs = self.window.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        ((last - first) / secs).max(0.0)
    }
}

#[async_trait]
impl Policy for WindowedRatePolicy {
    fn name(&self) -> &str {
        TYPE_NAME
    }

    fn subscriptions(&self, entity: EntityId) -> Vec<SubscriptionFilter> {
        vec![SubscriptionFilter::entity(entity).sensor(self.source.clone())]
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.period)
    }

    async fn on_start(&mut self, ctx: &PolicyContext) -> Result<()> {
        let baseline = ctx
            .attribute(ctx.entity(), &self.source)?
            .as_ref()
            .and_then(AttributeValue::as_f64)
            .unwrap_or(0.0);
        self.record(ctx.now()?, baseline);
        Ok(())
    }

    async fn on_event(&mut self, _ctx: &PolicyContext, event: SensorEvent) -> Result<()> {
        let value = event.value.as_f64().ok_or_else(|| {
            StewardError::InvalidParameter(format!("{} is not numeric", event.sensor))
        })?;
        self.record(event.timestamp, value);
        Ok(())
    }

    async fn on_tick(&mut self, ctx: &PolicyContext) -> Result<()> {
        let rate = self.rate_at(ctx.now()?);
        ctx.set_sensor(ctx.entity(), &self.target, AttributeValue::Double(rate))?;
        Ok(())
    }
}
