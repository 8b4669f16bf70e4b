//! InMemoryMementoStore - テスト用の保存先

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::domain::{MementoSet, Result};
use crate::ports::MementoStore;

#[derive(Default)]
pub struct InMemoryMementoStore {
    saved: Mutex<Option<MementoSet>>,
}

impl InMemoryMementoStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MementoStore for InMemoryMementoStore {
    async fn save(&self, set: &MementoSet) -> Result<()> {
        *self.saved.lock().unwrap_or_else(PoisonError::into_inner) = Some(set.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Option<MementoSet>> {
        Ok(self
            .saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}
