//! steward-core
//!
//! Core building blocks for the Steward application-management runtime.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, values, sensors, lifecycle, events, effectors, mementos, errors）
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator, Location, MementoStore）
//! - **app**: ランタイム（builder, context, bus, attributes, effector engine, policies, rebind）
//! - **policies**: 組み込みポリシー（windowed rate, health check, restarter, threshold）
//! - **impls**: 実装（InMemoryLocation, FileMementoStore など開発用）
//! - **config**: RuntimeConfig
//! - **testing**: 非同期テスト用のヘルパー（Repeater, AppTracker）

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod policies;
pub mod ports;
pub mod testing;

pub use crate::app::{BuildError, ContextBuilder, ManagementContext, TypeDescriptor};
pub use crate::config::RuntimeConfig;
pub use crate::domain::{Result, StewardError};
