//! IdGenerator port - ID 生成の抽象化
//!
//! テスト容易性のために trait として抽象化しています。
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use crate::domain::ids::{EntityId, Id, InvocationId, PolicyId, SubscriptionId};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator はランタイム内の全 ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数スレッドから使える）
pub trait IdGenerator: Send + Sync {
    fn next_ulid(&self) -> Ulid;

    fn entity_id(&self) -> EntityId {
        Id::from_ulid(self.next_ulid())
    }

    fn subscription_id(&self) -> SubscriptionId {
        Id::from_ulid(self.next_ulid())
    }

    fn invocation_id(&self) -> InvocationId {
        Id::from_ulid(self.next_ulid())
    }

    fn policy_id(&self) -> PolicyId {
        Id::from_ulid(self.next_ulid())
    }
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// Clock を使って現在時刻ベースの ULID を生成します。
/// テスト時に FixedClock を使うと timestamp 部分が固定されます。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}
