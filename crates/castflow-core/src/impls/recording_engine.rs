//! RecordingWorkflowEngine - 起動要求を記録するだけの workflow engine
//!
//! step の実行や callback は行いません。テストでは記録された起動を確認し、
//! callback は JobOrchestrator を直接呼んで再現します。

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::domain::{InstanceHandle, TaskType};
use crate::ports::{EngineError, WorkflowEngine};

/// One `start_instance` call that the engine accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct StartedInstance {
    pub handle: InstanceHandle,
    pub workflow_type: TaskType,
    pub params: serde_json::Value,
}

#[derive(Debug, Default)]
struct State {
    started: Vec<StartedInstance>,
    failures: VecDeque<EngineError>,
}

#[derive(Default)]
pub struct RecordingWorkflowEngine {
    state: Arc<Mutex<State>>,
}

impl RecordingWorkflowEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `start_instance` call with `err`.
    pub async fn fail_next(&self, err: EngineError) {
        self.state.lock().await.failures.push_back(err);
    }

    pub async fn started(&self) -> Vec<StartedInstance> {
        self.state.lock().await.started.clone()
    }
}

#[async_trait]
impl WorkflowEngine for RecordingWorkflowEngine {
    async fn start_instance(
        &self,
        workflow_type: &TaskType,
        params: serde_json::Value,
    ) -> Result<InstanceHandle, EngineError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        let handle = InstanceHandle(format!("{workflow_type}-{}", Ulid::new()));
        state.started.push(StartedInstance {
            handle: handle.clone(),
            workflow_type: workflow_type.clone(),
            params,
        });
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RateLimitSignal;

    #[tokio::test]
    async fn starts_are_recorded_with_their_params() {
        let engine = RecordingWorkflowEngine::new();
        let ty = TaskType::new(TaskType::TRANSCRIPTION);
        let handle = engine
            .start_instance(&ty, serde_json::json!({"episode": "ep-9"}))
            .await
            .unwrap();

        let started = engine.started().await;
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].handle, handle);
        assert_eq!(started[0].params["episode"], "ep-9");
    }

    #[tokio::test]
    async fn injected_failure_is_not_recorded() {
        let engine = RecordingWorkflowEngine::new();
        engine
            .fail_next(EngineError::Throttled(RateLimitSignal {
                retry_after_seconds: 5,
                active_jobs: 1,
            }))
            .await;
        let ty = TaskType::new(TaskType::IMPORT_SHOW);
        assert!(matches!(
            engine.start_instance(&ty, serde_json::Value::Null).await,
            Err(EngineError::Throttled(_))
        ));
        assert!(engine.started().await.is_empty());
    }
}
