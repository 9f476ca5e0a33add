//! UploadCoordinator - remote multipart protocol と session actor の橋渡し
//!
//! # フロー
//! 1. initiate: remote initiate → session 初期化（失敗時は remote abort）
//! 2. chunk: part 番号を検証 → remote upload_part → session に etag を記録
//! 3. complete: 完全性チェック（completing へ）→ remote complete → session 削除
//!    → completion hook → 後続 Task の投入
//! 4. abort: remote abort → session 削除

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::domain::{
    JobError, JobResult, PartProgress, SessionPhase, TaskId, UploadId, UploadStatus,
};
use crate::ports::{
    FinalizedUpload, IdGenerator, ObjectRef, ObjectStore, StorageError, UploadCompletionHook,
};

use super::orchestrator::JobOrchestrator;
use super::session_actor::SessionHost;

/// Result of a successful `complete_upload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedUpload {
    pub upload_id: UploadId,
    pub target_key: String,
    pub content_type: String,
    pub object: ObjectRef,
    pub parts: u32,
    /// Follow-up task created for the object, if the hook asked for one.
    pub task_id: Option<TaskId>,
    /// Set when the object was finalized but the hook or the follow-up task
    /// failed; the caller may create the task itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_up_error: Option<String>,
}

pub struct UploadCoordinator {
    sessions: Arc<SessionHost>,
    object_store: Arc<dyn ObjectStore>,
    hook: Arc<dyn UploadCompletionHook>,
    orchestrator: Arc<JobOrchestrator>,
    ids: Arc<dyn IdGenerator>,
}

impl UploadCoordinator {
    pub fn new(
        sessions: Arc<SessionHost>,
        object_store: Arc<dyn ObjectStore>,
        hook: Arc<dyn UploadCompletionHook>,
        orchestrator: Arc<JobOrchestrator>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            sessions,
            object_store,
            hook,
            orchestrator,
            ids,
        }
    }

    pub fn sessions(&self) -> &SessionHost {
        &self.sessions
    }

    #[tracing::instrument(skip(self), fields(target_key = %target_key))]
    pub async fn initiate_upload(
        &self,
        target_key: &str,
        total_chunks: u32,
        content_type: &str,
    ) -> JobResult<UploadId> {
        if target_key.trim().is_empty() {
            return Err(JobError::InvalidInput("target key is empty".to_string()));
        }
        if total_chunks == 0 {
            return Err(JobError::InvalidInput(
                "total_chunks must be at least 1".to_string(),
            ));
        }

        let remote_upload_id = self
            .object_store
            .initiate_multipart_upload(target_key, content_type)
            .await?;
        let upload_id = self.ids.upload_id();

        if let Err(err) = self
            .sessions
            .initialize(upload_id, target_key, &remote_upload_id, total_chunks, content_type)
            .await
        {
            if let Err(abort_err) = self
                .object_store
                .abort_multipart_upload(target_key, &remote_upload_id)
                .await
            {
                tracing::warn!(
                    remote_upload_id = %remote_upload_id,
                    error = %abort_err,
                    "could not abort remote upload after failed initialization"
                );
            }
            return Err(err);
        }
        Ok(upload_id)
    }

    #[tracing::instrument(skip(self, data), fields(upload_id = %upload_id, bytes = data.len()))]
    pub async fn upload_chunk(
        &self,
        upload_id: UploadId,
        part_number: u32,
        data: Bytes,
    ) -> JobResult<PartProgress> {
        let session = self.sessions.get_state(upload_id).await?;
        session.validate_part_number(part_number)?;
        if session.phase == SessionPhase::Completing {
            return Err(JobError::CompletionInProgress(upload_id));
        }

        let etag = self
            .object_store
            .upload_part(
                &session.target_key,
                &session.remote_upload_id,
                part_number,
                data,
            )
            .await?;
        self.sessions.add_part(upload_id, part_number, &etag).await
    }

    /// Finalize the object exactly once and hand it to the completion hook.
    #[tracing::instrument(skip(self), fields(upload_id = %upload_id))]
    pub async fn complete_upload(&self, upload_id: UploadId) -> JobResult<CompletedUpload> {
        let session = self.sessions.begin_completion(upload_id).await?;
        let parts = session.parts.completed_parts();

        let object = match self
            .object_store
            .complete_multipart_upload(&session.target_key, &session.remote_upload_id, &parts)
            .await
        {
            Ok(object) => object,
            Err(err) => {
                tracing::warn!(error = %err, "remote complete failed; session reopened");
                if let Err(cancel_err) = self.sessions.cancel_completion(upload_id).await {
                    // stays `completing` until the session ttl expires it
                    tracing::warn!(error = %cancel_err, "could not reopen session; left to expiry");
                }
                return Err(err.into());
            }
        };
        // the object exists from here on; later failures are reported, not returned
        if let Err(err) = self.sessions.complete(upload_id).await {
            tracing::warn!(error = %err, "session not removed after finalize; expiry will clear it");
        }

        let finalized = FinalizedUpload {
            upload_id,
            target_key: session.target_key.clone(),
            content_type: session.content_type.clone(),
            object: object.clone(),
            total_chunks: session.total_chunks,
        };
        let (task_id, follow_up_error) = match self.follow_up(&finalized).await {
            Ok(task_id) => (task_id, None),
            Err(err) => {
                tracing::warn!(key = %object.key, error = %err, "follow-up after finalize failed");
                (None, Some(err.to_string()))
            }
        };

        tracing::info!(
            key = %object.key,
            parts = parts.len(),
            task_id = task_id.map(|id| id.to_string()),
            "upload finalized"
        );
        Ok(CompletedUpload {
            upload_id,
            target_key: session.target_key,
            content_type: session.content_type,
            object,
            parts: session.total_chunks,
            task_id,
            follow_up_error,
        })
    }

    /// Completion hook, then the follow-up task it names (if any).
    async fn follow_up(&self, finalized: &FinalizedUpload) -> JobResult<Option<TaskId>> {
        match self.hook.on_upload_completed(finalized).await? {
            Some(job) => Ok(Some(self.orchestrator.submit(job.task_type, job.payload).await?.id)),
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip(self), fields(upload_id = %upload_id))]
    pub async fn abort_upload(&self, upload_id: UploadId) -> JobResult<()> {
        let session = self.sessions.get_state(upload_id).await?;
        match self
            .object_store
            .abort_multipart_upload(&session.target_key, &session.remote_upload_id)
            .await
        {
            Ok(()) => {}
            Err(StorageError::NotFound(remote)) => {
                tracing::warn!(remote_upload_id = %remote, "remote upload already gone");
            }
            Err(err) => return Err(err.into()),
        }
        self.sessions.abort(upload_id).await?;
        Ok(())
    }

    pub async fn upload_status(&self, upload_id: UploadId) -> JobResult<UploadStatus> {
        let session = self.sessions.get_state(upload_id).await?;
        Ok(session.progress().into())
    }
}
