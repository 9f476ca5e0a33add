//! ObjectStore port - リモートの multipart upload プロトコル
//!
//! バイト転送そのものは実装側（S3 互換ストレージなど）の責務です。
//! ここでは initiate / part / complete / abort の 4 操作だけを定義します。

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{CompletedPart, JobError};

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("multipart upload not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

impl From<StorageError> for JobError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(_) => JobError::Fatal(err.to_string()),
            StorageError::InvalidRequest(msg) => JobError::InvalidInput(msg),
            StorageError::Unavailable(msg) => JobError::Storage(msg),
        }
    }
}

/// Reference to a finalized object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub key: String,
    pub etag: Option<String>,
}

/// Multipart upload operations of the object storage service.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Open a multipart upload and return the remote upload handle.
    async fn initiate_multipart_upload(&self, key: &str, content_type: &str)
    -> StorageResult<String>;

    /// Upload one part and return its etag.
    async fn upload_part(
        &self,
        key: &str,
        remote_upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> StorageResult<String>;

    /// Assemble the parts (sorted by part number) into the final object.
    async fn complete_multipart_upload(
        &self,
        key: &str,
        remote_upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<ObjectRef>;

    /// Discard a multipart upload and its parts.
    async fn abort_multipart_upload(&self, key: &str, remote_upload_id: &str)
    -> StorageResult<()>;
}
