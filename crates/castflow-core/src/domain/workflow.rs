//! WorkflowInstance record: one durable execution bound to a Task.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{JobError, JobResult};
use super::ids::{TaskId, WorkflowId};
use super::state::WorkflowStatus;
use super::task::TaskType;

/// Handle returned by the external workflow engine for a started instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceHandle(pub String);

/// Latest reported progress of one workflow step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepProgress {
    pub percent_complete: u8,
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Optional details carried by a status write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusDetails {
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StatusDetails {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: WorkflowId,
    pub task_id: TaskId,
    pub workflow_type: TaskType,
    pub instance_handle: InstanceHandle,
    pub status: WorkflowStatus,
    pub step_progress: BTreeMap<String, StepProgress>,

    /// Weighted aggregate of `step_progress`, 0-100.
    pub estimated_progress: u8,

    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    pub fn new(
        id: WorkflowId,
        task_id: TaskId,
        workflow_type: TaskType,
        instance_handle: InstanceHandle,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_id,
            workflow_type,
            instance_handle,
            status: WorkflowStatus::Queued,
            step_progress: BTreeMap::new(),
            estimated_progress: 0,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Apply a status write. Terminal instances refuse every further write.
    ///
    /// `estimated_progress` is left as the step aggregate; only the mirrored
    /// task jumps to 100 on completion.
    pub fn set_status(
        &mut self,
        status: WorkflowStatus,
        details: StatusDetails,
        now: DateTime<Utc>,
    ) -> JobResult<()> {
        if self.status.is_terminal() {
            return Err(JobError::WorkflowAlreadyTerminal {
                id: self.id,
                status: self.status,
            });
        }
        self.status = status;
        if details.error.is_some() {
            self.error = details.error;
        }
        if status.is_terminal() {
            self.completed_at = Some(details.completed_at.unwrap_or(now));
        }
        self.updated_at = now;
        Ok(())
    }

    /// Upsert one step's progress. Returns `false` when the stored entry already
    /// carried the same percentage and message (duplicate delivery).
    pub fn upsert_step(
        &mut self,
        step_name: &str,
        percent_complete: u8,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if let Some(existing) = self.step_progress.get(step_name)
            && existing.percent_complete == percent_complete
            && existing.message == message
        {
            return false;
        }
        self.step_progress.insert(
            step_name.to_string(),
            StepProgress {
                percent_complete,
                message,
                updated_at: now,
            },
        );
        self.updated_at = now;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn instance() -> WorkflowInstance {
        WorkflowInstance::new(
            WorkflowId::from_ulid(Ulid::new()),
            TaskId::from_ulid(Ulid::new()),
            TaskType::new(TaskType::TRANSCRIPTION),
            InstanceHandle("exec-1".into()),
            Utc::now(),
        )
    }

    #[test]
    fn starts_queued() {
        let wf = instance();
        assert_eq!(wf.status, WorkflowStatus::Queued);
        assert!(wf.step_progress.is_empty());
    }

    #[test]
    fn terminal_status_refuses_further_writes() {
        let mut wf = instance();
        let now = Utc::now();
        wf.set_status(WorkflowStatus::Running, StatusDetails::default(), now)
            .unwrap();
        wf.set_status(WorkflowStatus::Failed, StatusDetails::error("oom"), now)
            .unwrap();
        assert_eq!(wf.completed_at, Some(now));
        assert_eq!(wf.error.as_deref(), Some("oom"));

        let err = wf
            .set_status(WorkflowStatus::Completed, StatusDetails::default(), now)
            .unwrap_err();
        assert!(matches!(
            err,
            JobError::WorkflowAlreadyTerminal { status: WorkflowStatus::Failed, .. }
        ));
    }

    #[test]
    fn completion_keeps_the_step_aggregate() {
        let mut wf = instance();
        let now = Utc::now();
        wf.upsert_step("transcribe", 100, None, now);
        wf.estimated_progress = 70;
        wf.set_status(WorkflowStatus::Completed, StatusDetails::default(), now)
            .unwrap();
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(wf.estimated_progress, 70);
    }

    #[test]
    fn duplicate_step_update_is_detected() {
        let mut wf = instance();
        let now = Utc::now();
        assert!(wf.upsert_step("encode", 50, None, now));
        assert!(!wf.upsert_step("encode", 50, None, now));
        assert!(wf.upsert_step("encode", 60, None, now));
        assert_eq!(wf.step_progress["encode"].percent_complete, 60);
    }
}
