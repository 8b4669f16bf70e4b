//! App - アプリケーション層
//!
//! このモジュールは、domain と ports を組み合わせてランタイムを実装します。
//!
//! # 主要コンポーネント
//! - **ContextBuilder**: コンテキストの構築とワイヤリング（rebind もここから）
//! - **ManagementContext**: エンティティツリーとサブシステムの所有者
//! - **EventBus / AttributeStore**: センサー値の保持と配送
//! - **Effector engine**: ライフサイクル付きの非同期呼び出し
//! - **PolicyManager**: ポリシーごとのタスク管理
//! - **LocationManager**: Location の登録と handle の束縛

pub mod attributes;
pub mod builder;
pub mod bus;
pub mod context;
pub mod driver;
pub mod effector;
mod engine;
pub mod entity;
pub mod locations;
pub mod policy;
mod rebind;
pub mod registry;

// 主要な型を再エクスポート
pub use self::attributes::AttributeStore;
pub use self::builder::{BuildError, ContextBuilder};
pub use self::bus::{BoxError, Callback, EventBus};
pub use self::context::{ContextState, ManagementContext};
pub use self::driver::{EntityDriver, GroupDriver, ProcessDriver};
pub use self::effector::{Effector, EffectorContext, EffectorHandle};
pub use self::entity::Entity;
pub use self::locations::LocationManager;
pub use self::policy::{Policy, PolicyContext, PolicyManager};
pub use self::registry::{ConfigKey, PolicyFactory, TypeDescriptor, TypeRegistry};
