//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（オブジェクトストレージ、workflow エンジン、
//! 永続化ストア）へのインターフェースを提供し、実装の詳細を隠蔽します。

pub mod clock;
pub mod completion_hook;
pub mod id_generator;
pub mod object_store;
pub mod record_store;
pub mod workflow_engine;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::completion_hook::{FinalizedUpload, FollowUpJob, UploadCompletionHook};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::object_store::{ObjectRef, ObjectStore, StorageError, StorageResult};
pub use self::record_store::{Record, RecordStore, StoreError, Versioned};
pub use self::workflow_engine::{EngineError, WorkflowEngine};
