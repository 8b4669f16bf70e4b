//! FileMementoStore - ディレクトリに JSON で保存
//!
//! # レイアウト
//! ```text
//! <dir>/manifest.json          root id とエンティティ id の一覧
//! <dir>/entities/<id>.json     エンティティ 1 つにつき 1 ファイル
//! ```
//!
//! # 書き込み順
//! 1. エンティティファイルを書く（tmp に書いて rename）
//! 2. manifest を最後に書く
//! 3. manifest に載っていない古いエンティティファイルを消す
//!
//! 途中で落ちても、manifest は常に完全に書けたエンティティだけを指します。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::domain::{EntityId, EntityMemento, MementoSet, Result, StewardError};
use crate::ports::MementoStore;

const MANIFEST: &str = "manifest.json";
const ENTITIES_DIR: &str = "entities";

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    format_version: u32,
    created_at: DateTime<Utc>,
    roots: Vec<EntityId>,
    entities: Vec<EntityId>,
}

pub struct FileMementoStore {
    dir: PathBuf,
}

impl FileMementoStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entity_path(&self, id: EntityId) -> PathBuf {
        self.dir.join(ENTITIES_DIR).join(format!("{id}.json"))
    }
}

async fn write_atomic(path: &Path, value: &impl Serialize) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = tokio::fs::read(path).await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| StewardError::MalformedMemento(format!("{}: {e}", path.display())))
}

#[async_trait]
impl MementoStore for FileMementoStore {
    async fn save(&self, set: &MementoSet) -> Result<()> {
        let entities_dir = self.dir.join(ENTITIES_DIR);
        tokio::fs::create_dir_all(&entities_dir).await?;

        for memento in &set.entities {
            write_atomic(&self.entity_path(memento.id), memento).await?;
        }

        let manifest = Manifest {
            format_version: set.format_version,
            created_at: set.created_at,
            roots: set.roots.clone(),
            entities: set.entities.iter().map(|m| m.id).collect(),
        };
        write_atomic(&self.dir.join(MANIFEST), &manifest).await?;

        let keep: std::collections::HashSet<String> = manifest
            .entities
            .iter()
            .map(|id| format!("{id}.json"))
            .collect();
        let mut stale = 0usize;
        let mut entries = tokio::fs::read_dir(&entities_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !keep.contains(&name) {
                tokio::fs::remove_file(entry.path()).await?;
                stale += 1;
            }
        }
        if stale > 0 {
            debug!(dir = %self.dir.display(), stale, "removed stale mementos");
        }
        info!(dir = %self.dir.display(), entities = set.entities.len(), "snapshot saved");
        Ok(())
    }

    async fn load(&self) -> Result<Option<MementoSet>> {
        let manifest_path = self.dir.join(MANIFEST);
        if !tokio::fs::try_exists(&manifest_path).await? {
            return Ok(None);
        }
        let manifest: Manifest = read_json(&manifest_path).await?;

        let mut entities = Vec::with_capacity(manifest.entities.len());
        for id in &manifest.entities {
            let path = self.entity_path(*id);
            if !tokio::fs::try_exists(&path).await? {
                return Err(StewardError::DanglingReference(format!(
                    "manifest lists {id} but {} is missing",
                    path.display()
                )));
            }
            let memento: EntityMemento = read_json(&path).await?;
            if memento.id != *id {
                return Err(StewardError::MalformedMemento(format!(
                    "{} holds {}",
                    path.display(),
                    memento.id
                )));
            }
            entities.push(memento);
        }

        Ok(Some(MementoSet {
            format_version: manifest.format_version,
            created_at: manifest.created_at,
            roots: manifest.roots,
            entities,
        }))
    }
}
