//! UploadCompletionHook port - upload 完了後の後処理
//!
//! 完了した object に依存するレコード（episode の音声など）を利用可能にし、
//! 必要なら後続ジョブ（エンコード・文字起こしなど）を指定します。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::object_store::ObjectRef;
use crate::domain::{JobResult, TaskType, UploadId};

/// An upload whose object has been assembled by the storage service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizedUpload {
    pub upload_id: UploadId,
    pub target_key: String,
    pub content_type: String,
    pub object: ObjectRef,
    pub total_chunks: u32,
}

/// Downstream processing requested for a finalized upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpJob {
    pub task_type: TaskType,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait UploadCompletionHook: Send + Sync {
    /// Finalize dependent records and name the follow-up job, if any.
    async fn on_upload_completed(&self, upload: &FinalizedUpload)
    -> JobResult<Option<FollowUpJob>>;
}
