//! InMemoryObjectStore - 開発・テスト用の multipart ストレージ
//!
//! # 実装詳細
//! - 進行中の upload は remote upload id ごとに part を保持
//! - complete で part を番号順に連結して object を作る
//! - `fail_next` で操作ごとに失敗を注入できる（テスト用）

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::domain::CompletedPart;
use crate::ports::{ObjectRef, ObjectStore, StorageError, StorageResult};

/// Operation selector for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Initiate,
    UploadPart,
    Complete,
    Abort,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct State {
    pending: HashMap<String, PendingUpload>,
    objects: HashMap<String, Bytes>,
    failures: HashMap<StoreOp, VecDeque<StorageError>>,
    complete_calls: usize,
    abort_calls: usize,
}

impl State {
    fn injected(&mut self, op: StoreOp) -> StorageResult<()> {
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct InMemoryObjectStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` fail with `err`.
    pub async fn fail_next(&self, op: StoreOp, err: StorageError) {
        self.state
            .lock()
            .await
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Finalized object bytes.
    pub async fn object(&self, key: &str) -> Option<Bytes> {
        self.state.lock().await.objects.get(key).cloned()
    }

    pub async fn pending_uploads(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Number of successful complete calls.
    pub async fn complete_calls(&self) -> usize {
        self.state.lock().await.complete_calls
    }

    /// Number of abort calls, successful or not.
    pub async fn abort_calls(&self) -> usize {
        self.state.lock().await.abort_calls
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn initiate_multipart_upload(
        &self,
        key: &str,
        _content_type: &str,
    ) -> StorageResult<String> {
        let mut state = self.state.lock().await;
        state.injected(StoreOp::Initiate)?;
        let remote_upload_id = Ulid::new().to_string();
        state.pending.insert(
            remote_upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(remote_upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        remote_upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> StorageResult<String> {
        let mut state = self.state.lock().await;
        state.injected(StoreOp::UploadPart)?;
        let upload = state
            .pending
            .get_mut(remote_upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| StorageError::NotFound(remote_upload_id.to_string()))?;
        let etag = format!("\"{}\"", Ulid::new());
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        remote_upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<ObjectRef> {
        let mut state = self.state.lock().await;
        state.injected(StoreOp::Complete)?;
        let upload = state
            .pending
            .get(remote_upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| StorageError::NotFound(remote_upload_id.to_string()))?;

        if !parts.windows(2).all(|w| w[0].part_number < w[1].part_number) {
            return Err(StorageError::InvalidRequest(
                "parts must be sorted by part number".to_string(),
            ));
        }
        let mut body = BytesMut::new();
        for part in parts {
            match upload.parts.get(&part.part_number) {
                Some((etag, data)) if *etag == part.etag => body.extend_from_slice(data),
                _ => {
                    return Err(StorageError::InvalidRequest(format!(
                        "part {} does not match an uploaded part",
                        part.part_number
                    )));
                }
            }
        }

        state.pending.remove(remote_upload_id);
        state.objects.insert(key.to_string(), body.freeze());
        state.complete_calls += 1;
        Ok(ObjectRef {
            key: key.to_string(),
            etag: Some(format!("\"{}-{}\"", remote_upload_id, parts.len())),
        })
    }

    async fn abort_multipart_upload(&self, key: &str, remote_upload_id: &str) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        state.abort_calls += 1;
        state.injected(StoreOp::Abort)?;
        match state.pending.get(remote_upload_id) {
            Some(upload) if upload.key == key => {
                state.pending.remove(remote_upload_id);
                Ok(())
            }
            _ => Err(StorageError::NotFound(remote_upload_id.to_string())),
        }
    }
}
