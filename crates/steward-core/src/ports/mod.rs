//! Ports - 抽象化レイヤー
//!
//! ランタイムが外部（時刻、ID、プロビジョニング先、永続化先）に触れる境界です。
//! 各 trait の開発用実装は `impls` にあります。

pub mod clock;
pub mod id_generator;
pub mod location;
pub mod memento_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::location::{Location, LocationError};
pub use self::memento_store::MementoStore;
