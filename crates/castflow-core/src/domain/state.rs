//! State - Task と WorkflowInstance の状態
//!
//! # Task の状態遷移
//! - pending -> processing（workflow 起動, attempts += 1）
//! - processing -> done | failed | retry
//! - retry -> processing（バックオフ後の再実行）
//! - done | failed | retry -> pending（reset_for_retry）
//!
//! # Workflow の状態遷移
//! - queued -> running <-> paused
//! - 任意の非終端状態 -> completed | failed | cancelled | terminated（終端）

use serde::{Deserialize, Serialize};
use std::fmt;

/// TaskStatus はタスクの状態を表現
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Done,
    Failed,
    Retry,
}

impl TaskStatus {
    /// Is this a terminal state (no further transitions without a reset)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }

    /// Can a new attempt start from this state?
    pub fn is_startable(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Retry)
    }

    /// Can `reset_for_retry` move this task back to pending?
    pub fn is_resettable(self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Retry
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Retry => "retry",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// WorkflowStatus は durable execution の状態を表現
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Terminated,
}

impl WorkflowStatus {
    /// Terminal statuses accept no further status writes.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed
                | WorkflowStatus::Failed
                | WorkflowStatus::Cancelled
                | WorkflowStatus::Terminated
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Queued => "queued",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
            WorkflowStatus::Terminated => "terminated",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
