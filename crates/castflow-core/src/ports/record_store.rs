//! RecordStore port - 永続化の正本（source of truth）
//!
//! UploadSession / Task / WorkflowInstance をキー単位で保存します。
//!
//! # 設計原則
//! - すべてのレコードは revision 付き（`Versioned`）
//! - 更新は `compare_and_swap` のみ（古い revision からの書き込みは拒否）
//! - 終端状態ガードなどの排他はこの CAS の上に構築する

use std::fmt;
use std::hash::Hash;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{
    JobError, Task, TaskId, UploadId, UploadSession, WorkflowId, WorkflowInstance,
};

/// A record kind that can be kept in a `RecordStore`.
pub trait Record: Clone + Send + Sync + 'static {
    type Key: Copy + Eq + Hash + fmt::Display + Send + Sync + 'static;

    /// Human-readable kind for error messages.
    const KIND: &'static str;

    fn key(&self) -> Self::Key;
}

impl Record for UploadSession {
    type Key = UploadId;
    const KIND: &'static str = "upload session";

    fn key(&self) -> UploadId {
        self.upload_id
    }
}

impl Record for Task {
    type Key = TaskId;
    const KIND: &'static str = "task";

    fn key(&self) -> TaskId {
        self.id
    }
}

impl Record for WorkflowInstance {
    type Key = WorkflowId;
    const KIND: &'static str = "workflow";

    fn key(&self) -> WorkflowId {
        self.id
    }
}

/// A stored record and the revision it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<R> {
    pub revision: u64,
    pub value: R,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },

    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    #[error("{kind} {key}: expected revision {expected}, found {actual}")]
    RevisionMismatch {
        kind: &'static str,
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("record store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn already_exists<R: Record>(key: R::Key) -> Self {
        StoreError::AlreadyExists {
            kind: R::KIND,
            key: key.to_string(),
        }
    }

    pub fn not_found<R: Record>(key: R::Key) -> Self {
        StoreError::NotFound {
            kind: R::KIND,
            key: key.to_string(),
        }
    }
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyExists { .. } | StoreError::RevisionMismatch { .. } => {
                JobError::Conflict(err.to_string())
            }
            StoreError::NotFound { .. } => JobError::InvalidInput(err.to_string()),
            StoreError::Backend(msg) => JobError::Transient(msg),
        }
    }
}

/// Keyed persistence with compare-and-swap updates.
#[async_trait]
pub trait RecordStore<R: Record>: Send + Sync {
    async fn get(&self, key: R::Key) -> Result<Option<Versioned<R>>, StoreError>;

    /// Store a new record at revision 1; fails if the key already exists.
    async fn insert(&self, record: R) -> Result<Versioned<R>, StoreError>;

    /// Replace the record if it is still at `expected_revision`.
    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        record: R,
    ) -> Result<Versioned<R>, StoreError>;

    /// Remove a record, returning it if it existed.
    async fn delete(&self, key: R::Key) -> Result<Option<R>, StoreError>;

    /// All stored keys (used for startup recovery and sweeps).
    async fn keys(&self) -> Result<Vec<R::Key>, StoreError>;
}
