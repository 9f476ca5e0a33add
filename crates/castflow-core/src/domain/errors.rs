//! Errors - エラー型と分類
//!
//! `JobError` は upload / job 双方の失敗を表し、`ErrorKind` で運用分類します。
//! 呼び出し側（Coordinator / Orchestrator）は `kind()` を見てリトライ判断を行います。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::{TaskId, UploadId, WorkflowId};
use super::state::{TaskStatus, WorkflowStatus};

/// ErrorKind は失敗の分類
///
/// - NotFound / InvalidInput / Conflict: リトライしない
/// - Transient / RateLimited: Retry policy に従ってリトライ
/// - Fatal: リトライしない、job の error に記録
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    Conflict,
    Transient,
    RateLimited,
    Fatal,
}

impl ErrorKind {
    /// HTTP-equivalent status for the routing layer.
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::InvalidInput => 400,
            ErrorKind::Conflict => 409,
            ErrorKind::Transient => 503,
            ErrorKind::RateLimited => 429,
            ErrorKind::Fatal => 500,
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::RateLimited)
    }
}

/// Backpressure payload handed to callers of a rate-limited attempt.
///
/// Serialized as `{"retryAfterSeconds": .., "activeJobs": ..}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSignal {
    pub retry_after_seconds: u64,
    pub active_jobs: usize,
}

impl std::fmt::Display for RateLimitSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "retry after {}s ({} active jobs)",
            self.retry_after_seconds, self.active_jobs
        )
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("upload session not found: {0}")]
    SessionNotFound(UploadId),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("invalid part number {part_number}: expected 1..={total}")]
    InvalidPartNumber { part_number: u32, total: u32 },

    #[error("etag for part {0} is empty")]
    EmptyETag(u32),

    #[error("upload incomplete: received {received} of {total} parts")]
    IncompleteUpload { received: u32, total: u32 },

    #[error("upload is missing part {0}")]
    MissingPart(u32),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("upload session already initialized: {0}")]
    AlreadyInitialized(UploadId),

    #[error("upload {0} is already being completed")]
    CompletionInProgress(UploadId),

    #[error("workflow {id} is already terminal ({status})")]
    WorkflowAlreadyTerminal { id: WorkflowId, status: WorkflowStatus },

    #[error("task {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("object storage error: {0}")]
    Storage(String),

    #[error("workflow engine error: {0}")]
    Engine(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("rate limited: {0}")]
    RateLimited(RateLimitSignal),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Fatal(String),
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::SessionNotFound(_)
            | JobError::TaskNotFound(_)
            | JobError::WorkflowNotFound(_) => ErrorKind::NotFound,
            JobError::InvalidPartNumber { .. }
            | JobError::EmptyETag(_)
            | JobError::IncompleteUpload { .. }
            | JobError::MissingPart(_)
            | JobError::InvalidInput(_) => ErrorKind::InvalidInput,
            JobError::AlreadyInitialized(_)
            | JobError::CompletionInProgress(_)
            | JobError::WorkflowAlreadyTerminal { .. }
            | JobError::InvalidTransition { .. }
            | JobError::Conflict(_) => ErrorKind::Conflict,
            JobError::Storage(_) | JobError::Engine(_) | JobError::Transient(_) => {
                ErrorKind::Transient
            }
            JobError::RateLimited(_) => ErrorKind::RateLimited,
            JobError::Config(_) | JobError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.kind().status_code()
    }

    /// The structured backpressure payload, if this is a rate-limit signal.
    pub fn rate_limit(&self) -> Option<RateLimitSignal> {
        match self {
            JobError::RateLimited(signal) => Some(*signal),
            _ => None,
        }
    }
}

/// Result type for castflow operations.
pub type JobResult<T> = std::result::Result<T, JobError>;
