//! ContentTypeRouting - content type から後続ジョブを決める completion hook

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::domain::{JobResult, TaskType};
use crate::ports::{FinalizedUpload, FollowUpJob, UploadCompletionHook};

/// Maps a content-type prefix (`audio/`, `application/rss+xml`, ...) to the
/// task type started for a finalized upload. Longest matching prefix wins.
#[derive(Debug, Clone)]
pub struct ContentTypeRouting {
    routes: BTreeMap<String, TaskType>,
}

impl ContentTypeRouting {
    pub fn new() -> Self {
        Self {
            routes: BTreeMap::new(),
        }
    }

    pub fn route(mut self, content_type_prefix: impl Into<String>, task_type: TaskType) -> Self {
        self.routes.insert(content_type_prefix.into(), task_type);
        self
    }

    fn lookup(&self, content_type: &str) -> Option<&TaskType> {
        self.routes
            .iter()
            .filter(|(prefix, _)| content_type.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, task_type)| task_type)
    }
}

impl Default for ContentTypeRouting {
    /// Audio uploads go to `audio-processing`.
    fn default() -> Self {
        Self::new().route("audio/", TaskType::new(TaskType::AUDIO_PROCESSING))
    }
}

#[async_trait]
impl UploadCompletionHook for ContentTypeRouting {
    async fn on_upload_completed(
        &self,
        upload: &FinalizedUpload,
    ) -> JobResult<Option<FollowUpJob>> {
        let Some(task_type) = self.lookup(&upload.content_type) else {
            tracing::debug!(
                upload_id = %upload.upload_id,
                content_type = %upload.content_type,
                "no follow-up job for content type"
            );
            return Ok(None);
        };
        Ok(Some(FollowUpJob {
            task_type: task_type.clone(),
            payload: serde_json::json!({
                "uploadId": upload.upload_id,
                "objectKey": upload.object.key,
                "contentType": upload.content_type,
            }),
        }))
    }
}
