//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: アプリケーションの構築とワイヤリング
//! - **SessionHost**: upload session ごとの single-writer actor（24h で失効）
//! - **UploadCoordinator**: multipart upload の initiate/chunk/complete/abort
//! - **JobRecordStore**: Task / WorkflowInstance の CAS 更新
//! - **ProgressAggregator**: step 進捗の重み付き集計
//! - **RetryScheduler**: 再試行予定の min-heap
//! - **JobOrchestrator**: admission・失敗判定・再試行ループ

pub mod builder;
pub mod coordinator;
pub mod job_store;
pub mod orchestrator;
pub mod progress;
pub mod retry_scheduler;
pub mod session_actor;

// 主要な型を再エクスポート
pub use self::builder::{App, AppBuilder, Background};
pub use self::coordinator::{CompletedUpload, UploadCoordinator};
pub use self::job_store::JobRecordStore;
pub use self::orchestrator::{AdmissionLimits, JobOrchestrator};
pub use self::progress::ProgressAggregator;
pub use self::retry_scheduler::RetryScheduler;
pub use self::session_actor::{ExpiryOutcome, SessionHost};
