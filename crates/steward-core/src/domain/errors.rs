//! Errors - ドメインエラー型
//!
//! 分類:
//! - 検証エラー（`invoke` などが同期的に返す。ライフサイクルには触れない）
//! - 実行エラー（`EffectorFailed` などとして handle 上に現れる）
//! - rebind / 永続化エラー
//!
//! Handles share their outcome between waiters, so the error is `Clone` and
//! foreign causes are kept as messages.

use super::ids::EntityId;
use super::lifecycle::Lifecycle;
use super::value::ValueType;

pub type Result<T, E = StewardError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StewardError {
    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("entity destroyed: {0}")]
    EntityDestroyed(EntityId),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("type mismatch for {name}: expected {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: ValueType,
        actual: ValueType,
    },

    #[error("dangling reference: {0}")]
    DanglingReference(String),

    #[error("location unavailable: {0}")]
    LocationUnavailable(String),

    #[error("effector {effector} failed: {cause}")]
    EffectorFailed {
        effector: String,
        cause: Box<StewardError>,
    },

    #[error("timed out")]
    TimedOut,

    #[error("cancelled")]
    Cancelled,

    #[error("unknown entity type: {0}")]
    UnknownType(String),

    #[error("effector {effector} not found on {entity}")]
    EffectorNotFound { entity: EntityId, effector: String },

    #[error("illegal transition {from} -> {to} on {entity}")]
    IllegalTransition {
        entity: EntityId,
        from: Lifecycle,
        to: Lifecycle,
    },

    #[error("policy not found: {0}")]
    PolicyNotFound(String),

    #[error("management context terminated")]
    ContextTerminated,

    #[error("malformed memento: {0}")]
    MalformedMemento(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    /// Failure raised by a driver or custom effector body.
    #[error("{0}")]
    Execution(String),
}

impl StewardError {
    pub fn execution(msg: impl Into<String>) -> Self {
        StewardError::Execution(msg.into())
    }

    pub fn effector_failed(effector: impl Into<String>, cause: StewardError) -> Self {
        match cause {
            // already wrapped by a nested invocation
            StewardError::EffectorFailed { .. } | StewardError::Cancelled | StewardError::TimedOut => cause,
            other => StewardError::EffectorFailed {
                effector: effector.into(),
                cause: Box::new(other),
            },
        }
    }

    /// Validation errors are returned synchronously and never change lifecycle.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            StewardError::EntityNotFound(_)
                | StewardError::EntityDestroyed(_)
                | StewardError::InvalidParameter(_)
                | StewardError::TypeMismatch { .. }
                | StewardError::EffectorNotFound { .. }
                | StewardError::ContextTerminated
        )
    }
}

impl From<std::io::Error> for StewardError {
    fn from(e: std::io::Error) -> Self {
        StewardError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for StewardError {
    fn from(e: serde_json::Error) -> Self {
        StewardError::Persistence(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effector_failed_does_not_double_wrap() {
        let inner = StewardError::effector_failed("start", StewardError::execution("boom"));
        let outer = StewardError::effector_failed("restart", inner.clone());
        assert_eq!(outer, inner);
        assert_eq!(inner.to_string(), "effector start failed: boom");
    }

    #[test]
    fn io_errors_become_persistence() {
        let err: StewardError = std::io::Error::other("disk full").into();
        assert!(matches!(err, StewardError::Persistence(msg) if msg.contains("disk full")));
    }
}
