//! Task record: a unit of requested background work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::{JobError, JobResult};
use super::ids::{TaskId, WorkflowId};
use super::state::TaskStatus;

/// Kind of background work, e.g. `audio-processing` or `import-show`.
///
/// The task type doubles as the workflow type started for the task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub const AUDIO_PROCESSING: &'static str = "audio-processing";
    pub const TRANSCRIPTION: &'static str = "transcription";
    pub const IMPORT_SHOW: &'static str = "import-show";

    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Task record.
///
/// State transitions happen only through the methods below, which enforce the
/// state machine in `TaskStatus`. Persistence (and revision checks) is the
/// job store's concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,

    /// Incremented on every transition into `processing`.
    pub attempts: u32,

    /// 0-100, mirrored from the workflow's estimated progress.
    pub progress: u8,

    pub workflow_id: Option<WorkflowId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Start of the current attempt.
    pub started_at: Option<DateTime<Utc>>,

    /// Start of the first attempt since creation or the last reset; the retry
    /// budget is measured from here.
    pub first_started_at: Option<DateTime<Utc>>,

    /// When the pending re-attempt is due (status = retry).
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        id: TaskId,
        task_type: TaskType,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_type,
            status: TaskStatus::Pending,
            payload,
            result: None,
            error: None,
            attempts: 0,
            progress: 0,
            workflow_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            first_started_at: None,
            next_attempt_at: None,
        }
    }

    fn transition(&self, to: TaskStatus) -> JobError {
        JobError::InvalidTransition {
            id: self.id,
            from: self.status,
            to,
        }
    }

    /// pending | retry -> processing.
    pub fn start_attempt(&mut self, now: DateTime<Utc>) -> JobResult<()> {
        if !self.status.is_startable() {
            return Err(self.transition(TaskStatus::Processing));
        }
        self.status = TaskStatus::Processing;
        self.attempts += 1;
        self.started_at = Some(now);
        self.first_started_at.get_or_insert(now);
        self.next_attempt_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// processing -> done.
    pub fn mark_done(&mut self, result: Option<serde_json::Value>, now: DateTime<Utc>) -> JobResult<()> {
        if self.status != TaskStatus::Processing {
            return Err(self.transition(TaskStatus::Done));
        }
        self.status = TaskStatus::Done;
        self.result = result;
        self.error = None;
        self.progress = 100;
        self.updated_at = now;
        Ok(())
    }

    /// processing -> failed.
    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> JobResult<()> {
        if self.status != TaskStatus::Processing {
            return Err(self.transition(TaskStatus::Failed));
        }
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.updated_at = now;
        Ok(())
    }

    /// processing -> retry; the error is kept so status=retry always explains itself.
    pub fn mark_retry(
        &mut self,
        error: impl Into<String>,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> JobResult<()> {
        if self.status != TaskStatus::Processing {
            return Err(self.transition(TaskStatus::Retry));
        }
        self.status = TaskStatus::Retry;
        self.error = Some(error.into());
        self.next_attempt_at = Some(next_attempt_at);
        self.updated_at = now;
        Ok(())
    }

    /// Settle the task from its workflow's terminal status.
    ///
    /// Accepts any non-terminal status: the engine may report the outcome of
    /// an instance before `processing` was recorded, or after a retry was
    /// scheduled.
    pub fn settle(
        &mut self,
        outcome: Result<Option<serde_json::Value>, String>,
        now: DateTime<Utc>,
    ) -> JobResult<()> {
        let to = match outcome {
            Ok(_) => TaskStatus::Done,
            Err(_) => TaskStatus::Failed,
        };
        if self.status.is_terminal() {
            return Err(self.transition(to));
        }
        match outcome {
            Ok(result) => {
                self.result = result;
                self.error = None;
                self.progress = 100;
            }
            Err(error) => self.error = Some(error),
        }
        self.status = to;
        self.next_attempt_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// done | failed | retry -> pending, clearing the previous run's output.
    pub fn reset(&mut self, now: DateTime<Utc>) -> JobResult<()> {
        if !self.status.is_resettable() {
            return Err(self.transition(TaskStatus::Pending));
        }
        self.status = TaskStatus::Pending;
        self.error = None;
        self.result = None;
        self.progress = 0;
        self.started_at = None;
        self.first_started_at = None;
        self.next_attempt_at = None;
        self.updated_at = now;
        Ok(())
    }
}
