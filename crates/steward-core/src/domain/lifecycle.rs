//! Lifecycle - エンティティのライフサイクル状態
//!
//! ```text
//! CREATED → STARTING → RUNNING ⇄ ON_FIRE
//!                        │         │
//!                        └→ STOPPING ←┘ → STOPPED → DESTROYED
//! ```
//!
//! 遷移は effector（start / stop / restart / destroy / checkHealth）だけが起こします。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Lifecycle {
    Created,
    Starting,
    Running,
    OnFire,
    Stopping,
    Stopped,
    Destroyed,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Created => "CREATED",
            Lifecycle::Starting => "STARTING",
            Lifecycle::Running => "RUNNING",
            Lifecycle::OnFire => "ON_FIRE",
            Lifecycle::Stopping => "STOPPING",
            Lifecycle::Stopped => "STOPPED",
            Lifecycle::Destroyed => "DESTROYED",
        }
    }

    /// `service.isUp` の導出値
    pub fn is_up(&self) -> bool {
        matches!(self, Lifecycle::Running)
    }

    pub fn is_transitional(&self) -> bool {
        matches!(self, Lifecycle::Starting | Lifecycle::Stopping)
    }

    /// 遷移が許可されているか
    ///
    /// - `STOPPING → RUNNING/ON_FIRE` は stop 失敗時の巻き戻し
    /// - `RUNNING → STARTING` は restart
    /// - DESTROYED へは DESTROYED 以外のどこからでも
    pub fn can_transition_to(&self, next: Lifecycle) -> bool {
        use Lifecycle::*;
        if next == Destroyed {
            return *self != Destroyed;
        }
        matches!(
            (self, next),
            (Created, Starting)
                | (Starting, Running)
                | (Starting, OnFire)
                | (Running, OnFire)
                | (Running, Stopping)
                | (Running, Starting)
                | (OnFire, Starting)
                | (OnFire, Stopping)
                | (OnFire, Running)
                | (Stopping, Stopped)
                | (Stopping, Running)
                | (Stopping, OnFire)
                | (Stopped, Starting)
        )
    }

    /// rebind 時に復元する状態（遷移中の状態は ON_FIRE 扱い）
    pub fn rebound(self) -> Lifecycle {
        if self.is_transitional() {
            Lifecycle::OnFire
        } else {
            self
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown lifecycle state: {0}")]
pub struct ParseLifecycleError(String);

impl FromStr for Lifecycle {
    type Err = ParseLifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CREATED" => Lifecycle::Created,
            "STARTING" => Lifecycle::Starting,
            "RUNNING" => Lifecycle::Running,
            "ON_FIRE" => Lifecycle::OnFire,
            "STOPPING" => Lifecycle::Stopping,
            "STOPPED" => Lifecycle::Stopped,
            "DESTROYED" => Lifecycle::Destroyed,
            other => return Err(ParseLifecycleError(other.to_string())),
        })
    }
}
