//! Effector invocation engine
//!
//! # 流れ
//! 1. `invoke` が同期的に検証（存在・破棄済み・effector 名・パラメータ）
//! 2. 本体を独立した tokio タスクとして spawn し、すぐに handle を返す
//! 3. ライフサイクル系はエンティティごとの FIFO ロックを取ってから実行
//! 4. 終了状態（SUCCEEDED / FAILED / CANCELLED）を handle に publish
//!
//! タイムアウトは handle を TIMED_OUT にするだけで、本体は走り続けます。
//! cancel は本体を drop します。コミット前なら状態を巻き戻し、
//! コミット後ならエンティティを ON_FIRE にします。

use std::sync::Arc;

use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::app::context::ContextInner;
use crate::app::effector::{EffectorContext, EffectorHandle, HandleState};
use crate::app::entity::Entity;
use crate::domain::effector::{CHECK_HEALTH, DESTROY, RESTART, START, STOP};
use crate::domain::{
    EffectorSpec, EffectorStatus, EntityId, InvokeOptions, Lifecycle, Parameters, Result,
    StewardError,
};

impl ContextInner {
    pub(crate) fn invoke(
        self: &Arc<Self>,
        id: EntityId,
        effector: &str,
        params: Parameters,
        options: InvokeOptions,
    ) -> Result<EffectorHandle> {
        self.ensure_active()?;
        let entity = self.entity(id)?;
        if entity.is_destroyed() {
            return Err(StewardError::EntityDestroyed(id));
        }
        let spec = entity
            .descriptor()
            .effector_spec(effector)
            .ok_or_else(|| StewardError::EffectorNotFound {
                entity: id,
                effector: effector.to_string(),
            })?;
        spec.validate(&params)?;

        let invocation = self.ids.invocation_id();
        let (state_tx, state_rx) = watch::channel(HandleState::queued());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let state_tx = Arc::new(state_tx);

        let ctx = EffectorContext::new(self.clone(), entity.clone(), effector, params);
        self.runtime
            .spawn(run_effector(entity, spec, ctx, state_tx.clone(), cancel_rx));

        if let Some(timeout) = options.timeout.or_else(|| self.config.default_timeout()) {
            let mut done = state_rx.clone();
            self.runtime.spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        state_tx.send_if_modified(|s| {
                            if s.status.is_terminal() {
                                return false;
                            }
                            s.status = EffectorStatus::TimedOut;
                            true
                        });
                    }
                    _ = done.wait_for(|s| s.status.is_terminal()) => {}
                }
            });
        }

        debug!(invocation = %invocation, entity = %id, effector, "effector queued");
        Ok(EffectorHandle::new(
            invocation,
            id,
            effector.to_string(),
            state_rx,
            Arc::new(cancel_tx),
        ))
    }
}

/// Resolves once `cancel()` was called. Never resolves if the handle is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn finish(state: &watch::Sender<HandleState>, status: EffectorStatus, outcome: Result<serde_json::Value>) {
    state.send_if_modified(|s| {
        if s.outcome.is_some() {
            return false;
        }
        s.status = status;
        s.outcome = Some(outcome);
        true
    });
}

async fn run_effector(
    entity: Arc<Entity>,
    spec: EffectorSpec,
    ctx: EffectorContext,
    state: Arc<watch::Sender<HandleState>>,
    mut cancel: watch::Receiver<bool>,
) {
    let name = spec.name.clone();

    let _guard = if spec.mutates_lifecycle {
        tokio::select! {
            guard = entity.effector_lock().lock() => Some(guard),
            _ = cancelled(&mut cancel) => {
                debug!(entity = %entity.id(), effector = %name, "cancelled while queued");
                finish(&state, EffectorStatus::Cancelled, Err(StewardError::Cancelled));
                return;
            }
        }
    } else {
        None
    };

    // destroyed while we were queued behind `destroy`
    if entity.is_destroyed() {
        finish(
            &state,
            EffectorStatus::Failed,
            Err(StewardError::EntityDestroyed(entity.id())),
        );
        return;
    }

    state.send_if_modified(|s| {
        if s.status != EffectorStatus::Queued {
            return false;
        }
        s.status = EffectorStatus::Running;
        true
    });
    let prev = entity.lifecycle();

    let mut body = Box::pin(execute_body(&ctx, &name));
    let outcome = tokio::select! {
        result = &mut body => Some(result),
        _ = cancelled(&mut cancel) => None,
    };

    match outcome {
        Some(Ok(value)) => {
            debug!(entity = %entity.id(), effector = %name, "effector succeeded");
            finish(&state, EffectorStatus::Succeeded, Ok(value));
        }
        Some(Err(e)) => {
            warn!(entity = %entity.id(), effector = %name, error = %e, "effector failed");
            finish(
                &state,
                EffectorStatus::Failed,
                Err(StewardError::effector_failed(&name, e)),
            );
        }
        None => {
            drop(body);
            roll_back(&ctx, prev).await;
            finish(&state, EffectorStatus::Cancelled, Err(StewardError::Cancelled));
        }
    }
}

/// After a cancel: uncommitted bodies restore the previous state, committed
/// ones leave the entity `ON_FIRE`.
async fn roll_back(ctx: &EffectorContext, prev: Lifecycle) {
    let entity = ctx.entity();
    if entity.is_destroyed() {
        return;
    }
    if ctx.effector() == DESTROY {
        ctx.inner.reopen_subtree(entity);
    }
    if ctx.is_committed() {
        warn!(entity = %entity.id(), effector = ctx.effector(), "cancelled after a committed step");
        if let Err(e) = entity.transition(Lifecycle::OnFire) {
            warn!(entity = %entity.id(), error = %e, "cannot mark ON_FIRE");
        }
        return;
    }
    if ctx.provisioned_here()
        && let Err(e) = ctx.release_location().await
    {
        warn!(entity = %entity.id(), error = %e, "release after cancel failed");
    }
    if let Err(e) = entity.force_lifecycle(prev) {
        warn!(entity = %entity.id(), error = %e, "cannot restore lifecycle");
    }
    debug!(entity = %entity.id(), effector = ctx.effector(), "cancelled before commit");
}

async fn execute_body(ctx: &EffectorContext, name: &str) -> Result<serde_json::Value> {
    match name {
        START => start(ctx).await,
        STOP => stop(ctx).await,
        RESTART => restart(ctx).await,
        DESTROY => destroy(ctx).await,
        CHECK_HEALTH => check_health(ctx).await,
        custom => {
            let entity = ctx.entity();
            let effector = entity.descriptor().custom_effector(custom).ok_or_else(|| {
                StewardError::EffectorNotFound {
                    entity: entity.id(),
                    effector: custom.to_string(),
                }
            })?;
            let result = effector.invoke(ctx, ctx.params().clone()).await;
            if result.is_err() && entity.lifecycle() == Lifecycle::Running {
                entity.transition(Lifecycle::OnFire)?;
            }
            result
        }
    }
}

fn state_json(entity: &Entity) -> serde_json::Value {
    json!({ "entity": entity.id().to_string(), "state": entity.lifecycle().as_str() })
}

async fn start(ctx: &EffectorContext) -> Result<serde_json::Value> {
    let entity = ctx.entity();
    if entity.lifecycle() == Lifecycle::Running {
        return Ok(state_json(entity));
    }
    entity.transition(Lifecycle::Starting)?;
    match entity.descriptor().driver().start(ctx).await {
        Ok(()) => {
            entity.transition(Lifecycle::Running)?;
            Ok(state_json(entity))
        }
        Err(e) => {
            entity.transition(Lifecycle::OnFire)?;
            Err(e)
        }
    }
}

async fn stop(ctx: &EffectorContext) -> Result<serde_json::Value> {
    let entity = ctx.entity();
    let prev = entity.lifecycle();
    if matches!(prev, Lifecycle::Created | Lifecycle::Stopped) {
        return Ok(state_json(entity));
    }
    entity.transition(Lifecycle::Stopping)?;
    match entity.descriptor().driver().stop(ctx).await {
        Ok(()) => {
            entity.transition(Lifecycle::Stopped)?;
            Ok(state_json(entity))
        }
        Err(e) => {
            // retryable: back to where we were
            entity.transition(prev)?;
            Err(e)
        }
    }
}

async fn restart(ctx: &EffectorContext) -> Result<serde_json::Value> {
    let entity = ctx.entity();
    if matches!(entity.lifecycle(), Lifecycle::Created | Lifecycle::Stopped) {
        return start(ctx).await;
    }
    entity.transition(Lifecycle::Starting)?;
    match entity.descriptor().driver().restart(ctx).await {
        Ok(()) => {
            entity.transition(Lifecycle::Running)?;
            Ok(state_json(entity))
        }
        Err(e) => {
            entity.transition(Lifecycle::OnFire)?;
            Err(e)
        }
    }
}

async fn check_health(ctx: &EffectorContext) -> Result<serde_json::Value> {
    let entity = ctx.entity();
    let state = entity.lifecycle();
    if !matches!(state, Lifecycle::Running | Lifecycle::OnFire) {
        return Ok(json!({ "healthy": null, "state": state.as_str() }));
    }
    let healthy = match entity.descriptor().driver().is_healthy(ctx).await {
        Ok(healthy) => healthy,
        Err(e) => {
            warn!(entity = %entity.id(), error = %e, "health probe failed");
            false
        }
    };
    match (state, healthy) {
        (Lifecycle::Running, false) => {
            entity.transition(Lifecycle::OnFire)?;
        }
        (Lifecycle::OnFire, true) => {
            entity.transition(Lifecycle::Running)?;
        }
        _ => {}
    }
    Ok(json!({ "healthy": healthy, "state": entity.lifecycle().as_str() }))
}

/// Children first. The root's lock is already held by this invocation.
async fn destroy(ctx: &EffectorContext) -> Result<serde_json::Value> {
    let root = ctx.entity().clone();
    let inner = ctx.inner.clone();
    let order = inner.close_subtree(&root);
    let count = order.len();

    for entity in order {
        if entity.id() == root.id() {
            tear_down(ctx).await;
            continue;
        }
        let _guard = entity.effector_lock().lock().await;
        if entity.is_destroyed() {
            continue;
        }
        let child_ctx = EffectorContext::new(inner.clone(), entity.clone(), DESTROY, Parameters::new());
        tear_down(&child_ctx).await;
    }
    info!(entity = %root.id(), destroyed = count, "entity tree destroyed");
    Ok(json!({ "destroyed": count }))
}

/// Best-effort stop, release, drop policies, then remove from the tree.
async fn tear_down(ctx: &EffectorContext) {
    let entity = ctx.entity();
    let inner = &ctx.inner;

    let state = entity.lifecycle();
    if !matches!(state, Lifecycle::Created | Lifecycle::Stopped | Lifecycle::Destroyed) {
        if let Err(e) = entity.transition(Lifecycle::Stopping) {
            debug!(entity = %entity.id(), error = %e, "skipping STOPPING");
        }
        if let Err(e) = entity.descriptor().driver().stop(ctx).await {
            warn!(entity = %entity.id(), error = %e, "stop during destroy failed");
        }
    }
    if let Err(e) = ctx.release_location().await {
        warn!(entity = %entity.id(), error = %e, "release during destroy failed");
    }
    inner.policies.deactivate_for(inner, entity.id());
    if let Err(e) = entity.transition(Lifecycle::Destroyed) {
        warn!(entity = %entity.id(), error = %e, "cannot mark DESTROYED");
    }
    inner.remove(entity);
}
