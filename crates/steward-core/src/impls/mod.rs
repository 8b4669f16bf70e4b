//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryLocation**: 障害注入つきの擬似 localhost
//! - **InMemoryMementoStore**: テスト用のスナップショット保存先
//! - **FileMementoStore**: ディレクトリに JSON で保存
//!
//! クラウドや SSH の Location は別クレートに置きます。

pub mod file_memento_store;
pub mod inmem_location;
pub mod inmem_memento_store;

pub use self::file_memento_store::FileMementoStore;
pub use self::inmem_location::InMemoryLocation;
pub use self::inmem_memento_store::InMemoryMementoStore;
