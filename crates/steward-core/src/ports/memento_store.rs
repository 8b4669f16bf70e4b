//! MementoStore port - スナップショットの保存先

use async_trait::async_trait;

use crate::domain::{MementoSet, Result};

#[async_trait]
pub trait MementoStore: Send + Sync {
    /// Replaces whatever was stored before.
    async fn save(&self, set: &MementoSet) -> Result<()>;

    /// `None` when nothing has been saved yet.
    async fn load(&self) -> Result<Option<MementoSet>>;
}
