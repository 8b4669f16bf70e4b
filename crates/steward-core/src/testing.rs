//! Test helpers - 非同期な結果を待つための道具
//!
//! イベント配送やポリシーの反応は別タスクで起きるので、テストは
//! 「条件が成り立つまで一定間隔で確かめる」形で書きます。
//!
//! ```ignore
//! Repeater::new("web-1 is up")
//!     .every(Duration::from_millis(20))
//!     .limit_time(Duration::from_secs(2))
//!     .until(|| match ctx.lifecycle(web)? {
//!         Lifecycle::Running => Ok(()),
//!         other => Err(StewardError::execution(format!("still {other}"))),
//!     })
//!     .await?;
//! ```

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::app::context::ManagementContext;
use crate::domain::{EntityId, Result};

const DEFAULT_PERIOD: Duration = Duration::from_millis(10);
const DEFAULT_LIMIT: Duration = Duration::from_secs(5);

/// Repeats a probe at a fixed period until it succeeds or a budget runs out.
#[derive(Debug, Clone)]
pub struct Repeater {
    description: String,
    period: Duration,
    max_iterations: Option<u32>,
    time_limit: Option<Duration>,
}

/// The probe never succeeded; `last` is its final failure.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub description: String,
    pub iterations: u32,
    pub elapsed: Duration,
    pub last: E,
}

impl<E: fmt::Debug> fmt::Display for Exhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: gave up after {} attempts in {:?} (last failure: {:?})",
            self.description, self.iterations, self.elapsed, self.last
        )
    }
}

impl<E: fmt::Debug> std::error::Error for Exhausted<E> {}

impl Repeater {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            period: DEFAULT_PERIOD,
            max_iterations: None,
            time_limit: Some(DEFAULT_LIMIT),
        }
    }

    pub fn every(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn limit_iterations(mut self, max: u32) -> Self {
        self.max_iterations = Some(max);
        self
    }

    pub fn limit_time(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    /// Runs `probe` until it returns `Ok`. The probe runs at least once.
    pub async fn until<T, E, F>(self, mut probe: F) -> std::result::Result<T, Exhausted<E>>
    where
        F: FnMut() -> std::result::Result<T, E>,
    {
        let started = Instant::now();
        let mut iterations = 0u32;
        loop {
            iterations += 1;
            let last = match probe() {
                Ok(value) => {
                    debug!(description = %self.description, iterations, "condition met");
                    return Ok(value);
                }
                Err(e) => e,
            };

            let out_of_iterations = self.max_iterations.is_some_and(|max| iterations >= max);
            let out_of_time = self
                .time_limit
                .is_some_and(|limit| started.elapsed() + self.period > limit);
            if out_of_iterations || out_of_time {
                return Err(Exhausted {
                    description: self.description,
                    iterations,
                    elapsed: started.elapsed(),
                    last,
                });
            }
            tokio::time::sleep(self.period).await;
        }
    }
}

/// `Repeater` with the default period and time limit.
pub async fn succeeds_eventually<T, E, F>(
    description: &str,
    probe: F,
) -> std::result::Result<T, Exhausted<E>>
where
    F: FnMut() -> std::result::Result<T, E>,
{
    Repeater::new(description).until(probe).await
}

/// Test-scoped list of applications to clean up with `destroy_all`.
#[derive(Debug, Default)]
pub struct AppTracker {
    apps: Mutex<Vec<EntityId>>,
}

impl AppTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `id` so creation and tracking read as one expression.
    pub fn track(&self, id: EntityId) -> EntityId {
        self.apps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);
        id
    }

    pub fn tracked(&self) -> Vec<EntityId> {
        self.apps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Destroys every tracked application and forgets them.
    pub async fn destroy_all(&self, ctx: &ManagementContext) -> Result<()> {
        let apps = std::mem::take(&mut *self.apps.lock().unwrap_or_else(PoisonError::into_inner));
        ctx.destroy_all(&apps).await
    }
}
