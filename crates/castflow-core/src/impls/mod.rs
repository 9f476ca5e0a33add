//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryRecordStore**: revision 付きのレコードストア
//! - **InMemoryObjectStore**: multipart upload を模したストレージ
//! - **RecordingWorkflowEngine**: 起動要求を記録する workflow engine
//! - **ContentTypeRouting**: content type ベースの completion hook
//!
//! # 本番用実装
//! 本番用の実装（S3 互換ストレージ、RDB、外部 workflow engine）は別クレートに配置します。

pub mod memory_object_store;
pub mod memory_store;
pub mod recording_engine;
pub mod routing_hook;

// 主要な型を再エクスポート
pub use self::memory_object_store::{InMemoryObjectStore, StoreOp};
pub use self::memory_store::InMemoryRecordStore;
pub use self::recording_engine::{RecordingWorkflowEngine, StartedInstance};
pub use self::routing_hook::ContentTypeRouting;
