//! EventBus - センサーイベントの publish/subscribe
//!
//! # 実装詳細
//! - 購読ごとに unbounded mpsc チャネル + 配送タスク 1 本
//! - publish はチャネルに送るだけなので購読者を待たない
//! - 同じ購読への配送順 = publish 順（= AttributeStore が振る sequence 順）
//! - コールバックの失敗・panic はその購読の中で握りつぶしてログに残す

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::domain::{EntityId, SensorEvent, SubscriptionFilter, SubscriptionId};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Subscriber callback. Runs on the subscription's delivery task, never on the
/// publishing thread.
pub type Callback = Arc<dyn Fn(&SensorEvent) -> Result<(), BoxError> + Send + Sync>;

struct Slot {
    filter: SubscriptionFilter,
    tx: mpsc::UnboundedSender<SensorEvent>,
    active: Arc<AtomicBool>,
}

pub struct EventBus {
    subscriptions: RwLock<HashMap<SubscriptionId, Slot>>,
    runtime: Handle,
}

impl EventBus {
    pub fn new(runtime: Handle) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            runtime,
        }
    }

    /// Registers the subscription before returning, so every later publish
    /// reaches it.
    pub fn subscribe(&self, id: SubscriptionId, filter: SubscriptionFilter, callback: Callback) {
        let (tx, rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));
        self.runtime.spawn(deliver(id, rx, active.clone(), callback));

        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        subs.insert(id, Slot { filter, tx, active });
        debug!(subscription = %id, "subscribed");
    }

    /// Idempotent. Returns whether the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match removed {
            Some(slot) => {
                // queued events are dropped by the delivery task
                slot.active.store(false, Ordering::Release);
                debug!(subscription = %id, "unsubscribed");
                true
            }
            None => false,
        }
    }

    /// `lineage` is the source entity's ancestors, used by `DescendantsOf`.
    pub fn publish(&self, event: &SensorEvent, lineage: &[EntityId]) {
        let subs = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for (id, slot) in subs.iter() {
            if slot.filter.matches(event, lineage) && slot.tx.send(event.clone()).is_err() {
                warn!(subscription = %id, "delivery task is gone");
            }
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

async fn deliver(
    id: SubscriptionId,
    mut rx: mpsc::UnboundedReceiver<SensorEvent>,
    active: Arc<AtomicBool>,
    callback: Callback,
) {
    while let Some(event) = rx.recv().await {
        if !active.load(Ordering::Acquire) {
            break;
        }
        match std::panic::catch_unwind(AssertUnwindSafe(|| callback(&event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(subscription = %id, sensor = %event.sensor, error = %e, "subscriber failed");
            }
            Err(_) => {
                error!(subscription = %id, sensor = %event.sensor, "subscriber panicked");
            }
        }
    }
}
