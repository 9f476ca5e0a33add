//! WorkflowEngine port - durable workflow engine
//!
//! エンジンは instance を起動し、step 進捗と終端状態を非同期に
//! JobOrchestrator のコールバック（on_step_progress / on_workflow_status）へ通知します。

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{InstanceHandle, JobError, RateLimitSignal, TaskType};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow engine unavailable: {0}")]
    Unavailable(String),

    #[error("workflow engine throttled: {0}")]
    Throttled(RateLimitSignal),

    #[error("workflow engine rejected instance: {0}")]
    Rejected(String),
}

impl From<EngineError> for JobError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Unavailable(msg) => JobError::Engine(msg),
            EngineError::Throttled(signal) => JobError::RateLimited(signal),
            EngineError::Rejected(msg) => JobError::Fatal(format!("workflow rejected: {msg}")),
        }
    }
}

#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Start a durable execution of `workflow_type` with `params`.
    async fn start_instance(
        &self,
        workflow_type: &TaskType,
        params: serde_json::Value,
    ) -> Result<InstanceHandle, EngineError>;
}
