//! EntityDriver - 型ごとのライフサイクル本体
//!
//! エンジンが状態遷移（STARTING → RUNNING / ON_FIRE など）を受け持ち、
//! ドライバは「実際に何をするか」だけを実装します。

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use crate::app::effector::{EffectorContext, EffectorHandle};
use crate::domain::effector::{LOCATION_PARAM, RESTART, START, STOP};
use crate::domain::{Lifecycle, LocationAction, Parameters, Result, StewardError};

#[async_trait]
pub trait EntityDriver: Send + Sync {
    async fn start(&self, ctx: &EffectorContext) -> Result<()>;

    async fn stop(&self, ctx: &EffectorContext) -> Result<()>;

    async fn restart(&self, ctx: &EffectorContext) -> Result<()> {
        self.stop(ctx).await?;
        self.start(ctx).await
    }

    async fn is_healthy(&self, _ctx: &EffectorContext) -> Result<bool> {
        Ok(true)
    }
}

/// Runs one process on a provisioned machine.
///
/// Location actions: `launch` on start, `stop` on stop, `check` for health.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessDriver;

#[async_trait]
impl EntityDriver for ProcessDriver {
    async fn start(&self, ctx: &EffectorContext) -> Result<()> {
        ctx.acquire_location().await?;
        let entity = ctx.entity();
        let action = LocationAction::new("launch").with_args(json!({
            "entity": entity.id().to_string(),
            "type": entity.type_name(),
            "config": entity.config(),
        }));
        ctx.execute(action).await?;
        Ok(())
    }

    async fn stop(&self, ctx: &EffectorContext) -> Result<()> {
        if ctx.entity().location().is_none() {
            return Ok(());
        }
        ctx.execute(LocationAction::new("stop")).await?;
        ctx.release_location().await
    }

    async fn is_healthy(&self, ctx: &EffectorContext) -> Result<bool> {
        if ctx.entity().location().is_none() {
            return Ok(false);
        }
        let probe = ctx.execute(LocationAction::new("check")).await?;
        Ok(probe.get("running").and_then(|v| v.as_bool()).unwrap_or(false))
    }
}

/// Fans lifecycle effectors out to every child and waits for all of them.
#[derive(Debug, Default, Clone, Copy)]
pub struct GroupDriver;

impl GroupDriver {
    async fn fan_out(&self, ctx: &EffectorContext, effector: &str, params: Parameters) -> Result<()> {
        let mut handles: Vec<EffectorHandle> = Vec::new();
        for child in ctx.children() {
            handles.push(ctx.invoke(child, effector, params.clone())?);
        }
        let mut failures = Vec::new();
        for handle in handles {
            if let Err(e) = handle.wait().await {
                warn!(child = %handle.entity(), effector, error = %e, "child failed");
                failures.push(format!("{}: {e}", handle.entity()));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(StewardError::execution(format!(
                "{} of the children failed {effector}: {}",
                failures.len(),
                failures.join("; ")
            )))
        }
    }
}

#[async_trait]
impl EntityDriver for GroupDriver {
    async fn start(&self, ctx: &EffectorContext) -> Result<()> {
        // children inherit an explicit location choice
        let params: Parameters = ctx
            .param(LOCATION_PARAM)
            .map(|v| (LOCATION_PARAM.to_string(), v.clone()))
            .into_iter()
            .collect();
        self.fan_out(ctx, START, params).await
    }

    async fn stop(&self, ctx: &EffectorContext) -> Result<()> {
        self.fan_out(ctx, STOP, Parameters::new()).await
    }

    async fn restart(&self, ctx: &EffectorContext) -> Result<()> {
        self.fan_out(ctx, RESTART, Parameters::new()).await
    }

    async fn is_healthy(&self, ctx: &EffectorContext) -> Result<bool> {
        let inner = &ctx.inner;
        Ok(ctx.children().into_iter().all(|child| {
            inner
                .entity(child)
                .map(|e| e.lifecycle() == Lifecycle::Running)
                .unwrap_or(false)
        }))
    }
}
