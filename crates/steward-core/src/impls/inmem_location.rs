//! InMemoryLocation - 開発・テスト用の擬似 localhost
//!
//! # 学習ポイント
//! - ports の trait を最小の状態で満たす
//! - 障害注入（アクション単位の失敗・遅延）でエラー経路をテスト可能にする
//!
//! マシンは HashMap 上のレコードにすぎません。`launch` で running、`stop` で
//! 停止、`check` で `{"running": bool}` を返します。`provision` / `release` も
//! アクション名として失敗・遅延を注入できます。

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::domain::{LocationAction, LocationHandle, LocationHandleId, LocationRequirements};
use crate::ports::{Location, LocationError};

pub const PROVISION: &str = "provision";
pub const RELEASE: &str = "release";

struct Machine {
    handle: LocationHandle,
    running: bool,
}

#[derive(Default)]
struct State {
    machines: HashMap<LocationHandleId, Machine>,
    next_port: u16,
    failures: HashMap<String, String>,
    delays: HashMap<String, Duration>,
    fail_reattach: bool,
    /// Attempted actions, oldest first.
    log: Vec<String>,
}

pub struct InMemoryLocation {
    name: String,
    capacity: Option<usize>,
    state: Mutex<State>,
}

impl InMemoryLocation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: None,
            state: Mutex::new(State::default()),
        }
    }

    /// Provisioning fails once `capacity` machines exist.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every later `action` fail with `reason`.
    pub fn fail_action(&self, action: impl Into<String>, reason: impl Into<String>) {
        self.state().failures.insert(action.into(), reason.into());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.failures.clear();
        state.fail_reattach = false;
    }

    /// Makes every later `action` take at least `delay`.
    pub fn delay_action(&self, action: impl Into<String>, delay: Duration) {
        self.state().delays.insert(action.into(), delay);
    }

    pub fn fail_reattach(&self, fail: bool) {
        self.state().fail_reattach = fail;
    }

    /// Simulates a crash: the machine stays provisioned but stops running.
    pub fn kill(&self, id: LocationHandleId) -> bool {
        match self.state().machines.get_mut(&id) {
            Some(machine) => {
                machine.running = false;
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, id: LocationHandleId) -> bool {
        self.state().machines.get(&id).is_some_and(|m| m.running)
    }

    pub fn machine_count(&self) -> usize {
        self.state().machines.len()
    }

    pub fn actions(&self) -> Vec<String> {
        self.state().log.clone()
    }

    /// Records `action`, then applies its injected delay and failure.
    async fn inject(&self, action: &str) -> Result<(), LocationError> {
        let delay = {
            let mut state = self.state();
            state.log.push(action.to_string());
            state.delays.get(action).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.state().failures.get(action) {
            Some(reason) => Err(LocationError::ActionFailed {
                action: action.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Location for InMemoryLocation {
    fn name(&self) -> &str {
        &self.name
    }

    async fn provision(
        &self,
        requirements: &LocationRequirements,
    ) -> Result<LocationHandle, LocationError> {
        self.inject(PROVISION).await.map_err(|e| LocationError::Unavailable {
            location: self.name.clone(),
            reason: e.to_string(),
        })?;

        let mut state = self.state();
        if self.capacity.is_some_and(|cap| state.machines.len() >= cap) {
            return Err(LocationError::Unavailable {
                location: self.name.clone(),
                reason: format!("capacity of {} machines reached", state.machines.len()),
            });
        }
        state.next_port += 1;
        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert("entityType".to_string(), requirements.entity_type.clone());
        if let Some(entity) = requirements.entity {
            metadata.insert("entity".to_string(), entity.to_string());
        }
        let handle = LocationHandle {
            id: LocationHandleId::generate(),
            location: self.name.clone(),
            address: format!("127.0.0.1:{}", 20_000 + state.next_port),
            metadata,
        };
        state.machines.insert(
            handle.id,
            Machine {
                handle: handle.clone(),
                running: false,
            },
        );
        debug!(location = %self.name, handle = %handle.id, address = %handle.address, "machine provisioned");
        Ok(handle)
    }

    async fn release(&self, handle: &LocationHandle) -> Result<(), LocationError> {
        self.inject(RELEASE).await?;
        let mut state = self.state();
        if state.machines.remove(&handle.id).is_none() {
            return Err(LocationError::UnknownHandle(handle.id.to_string()));
        }
        debug!(location = %self.name, handle = %handle.id, "machine released");
        Ok(())
    }

    async fn execute(
        &self,
        handle: &LocationHandle,
        action: &LocationAction,
    ) -> Result<serde_json::Value, LocationError> {
        self.inject(&action.name).await?;
        let mut state = self.state();
        let machine = state
            .machines
            .get_mut(&handle.id)
            .ok_or_else(|| LocationError::UnknownHandle(handle.id.to_string()))?;
        let result = match action.name.as_str() {
            "launch" => {
                machine.running = true;
                json!({ "address": machine.handle.address })
            }
            "stop" => {
                machine.running = false;
                json!({ "stopped": true })
            }
            "check" => json!({ "running": machine.running }),
            other => json!({ "action": other, "args": action.args }),
        };
        Ok(result)
    }

    /// Unknown handles are adopted as running machines.
    async fn reattach(&self, handle: &LocationHandle) -> Result<LocationHandle, LocationError> {
        let mut state = self.state();
        if state.fail_reattach {
            return Err(LocationError::Unavailable {
                location: self.name.clone(),
                reason: format!("cannot reattach {}", handle.id),
            });
        }
        state.machines.entry(handle.id).or_insert_with(|| Machine {
            handle: handle.clone(),
            running: true,
        });
        state.log.push("reattach".to_string());
        Ok(handle.clone())
    }
}
