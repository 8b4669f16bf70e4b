//! Location port - プロビジョニング先の抽象化
//!
//! クラウド API や SSH などの具体的な実装はこのクレートの外に置きます。
//! 開発・テスト用には `impls::InMemoryLocation` があります。

use async_trait::async_trait;

use crate::domain::{LocationAction, LocationHandle, LocationRequirements, StewardError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocationError {
    #[error("location {location} cannot provision: {reason}")]
    Unavailable { location: String, reason: String },

    #[error("unknown handle {0}")]
    UnknownHandle(String),

    #[error("action {action} failed: {reason}")]
    ActionFailed { action: String, reason: String },
}

impl From<LocationError> for StewardError {
    fn from(e: LocationError) -> Self {
        match e {
            LocationError::Unavailable { .. } | LocationError::UnknownHandle(_) => {
                StewardError::LocationUnavailable(e.to_string())
            }
            LocationError::ActionFailed { .. } => StewardError::Execution(e.to_string()),
        }
    }
}

/// Location は実行先を提供
///
/// # 契約
/// - handle は同時に 1 エンティティにだけ束縛される（束縛の管理は `LocationManager`）
/// - `execute` は呼ばれた時点でコミット済み扱い
#[async_trait]
pub trait Location: Send + Sync {
    /// Registry key; also stored in every handle this location issues.
    fn name(&self) -> &str;

    async fn provision(
        &self,
        requirements: &LocationRequirements,
    ) -> Result<LocationHandle, LocationError>;

    async fn release(&self, handle: &LocationHandle) -> Result<(), LocationError>;

    async fn execute(
        &self,
        handle: &LocationHandle,
        action: &LocationAction,
    ) -> Result<serde_json::Value, LocationError>;

    /// Re-acquire a handle from a memento. Defaults to trusting it.
    async fn reattach(&self, handle: &LocationHandle) -> Result<LocationHandle, LocationError> {
        Ok(handle.clone())
    }
}
