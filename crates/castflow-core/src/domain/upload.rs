//! Upload session model: the part ledger and the per-upload session record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{JobError, JobResult};
use super::ids::UploadId;

/// One received part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRecord {
    pub etag: String,
    pub recorded_at: DateTime<Utc>,
}

/// Which parts of a multipart upload have arrived.
///
/// Keyed by part number, so a part is counted once no matter how often the
/// client retries it. Iteration order is ascending part number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartLedger {
    parts: BTreeMap<u32, PartRecord>,
}

impl PartLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a part. Returns `true` if the part number was new.
    pub fn record(&mut self, part_number: u32, etag: impl Into<String>, at: DateTime<Utc>) -> bool {
        self.parts
            .insert(
                part_number,
                PartRecord {
                    etag: etag.into(),
                    recorded_at: at,
                },
            )
            .is_none()
    }

    pub fn received(&self) -> u32 {
        self.parts.len() as u32
    }

    pub fn get(&self, part_number: u32) -> Option<&PartRecord> {
        self.parts.get(&part_number)
    }

    pub fn contains(&self, part_number: u32) -> bool {
        self.parts.contains_key(&part_number)
    }

    /// Highest part number received so far.
    pub fn highest(&self) -> Option<u32> {
        self.parts.keys().next_back().copied()
    }

    /// Lowest part number in `1..=total` that has not arrived.
    pub fn first_gap(&self, total: u32) -> Option<u32> {
        (1..=total).find(|n| !self.parts.contains_key(n))
    }

    /// Are the parts exactly `1..=k` for some `k` (including the empty ledger)?
    pub fn is_contiguous_prefix(&self) -> bool {
        self.parts
            .keys()
            .zip(1u32..)
            .all(|(&part_number, expected)| part_number == expected)
    }

    /// `(part_number, etag)` pairs sorted by part number, as the remote
    /// "complete multipart upload" call expects them.
    pub fn completed_parts(&self) -> Vec<CompletedPart> {
        self.parts
            .iter()
            .map(|(&part_number, record)| CompletedPart {
                part_number,
                etag: record.etag.clone(),
            })
            .collect()
    }

    /// Check that the ledger holds exactly `1..=total`.
    ///
    /// A hole below the highest received part is reported as
    /// `MissingPart(n)`; a contiguous prefix that simply stops short is
    /// `IncompleteUpload`.
    pub fn ensure_complete(&self, total: u32) -> JobResult<()> {
        let received = self.received();
        match self.first_gap(total) {
            None if received == total => Ok(()),
            None => Err(JobError::InvalidInput(format!(
                "ledger holds {received} parts but the upload declares {total}"
            ))),
            Some(gap) if self.highest().is_some_and(|highest| highest > gap) => {
                Err(JobError::MissingPart(gap))
            }
            Some(_) => Err(JobError::IncompleteUpload { received, total }),
        }
    }
}

/// A part reference handed to the object store on completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Where an upload session is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Accepting parts.
    #[default]
    Receiving,
    /// The remote "complete" call is in flight.
    Completing,
}

/// One in-progress chunked upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub upload_id: UploadId,
    pub target_key: String,
    pub remote_upload_id: String,
    pub content_type: String,
    pub total_chunks: u32,
    pub parts: PartLedger,
    #[serde(default)]
    pub phase: SessionPhase,
    pub created_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn new(
        upload_id: UploadId,
        target_key: impl Into<String>,
        remote_upload_id: impl Into<String>,
        content_type: impl Into<String>,
        total_chunks: u32,
        created_at: DateTime<Utc>,
    ) -> JobResult<Self> {
        if total_chunks == 0 {
            return Err(JobError::InvalidInput(
                "total_chunks must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            upload_id,
            target_key: target_key.into(),
            remote_upload_id: remote_upload_id.into(),
            content_type: content_type.into(),
            total_chunks,
            parts: PartLedger::new(),
            phase: SessionPhase::Receiving,
            created_at,
        })
    }

    /// Reject part numbers outside `1..=total_chunks`.
    pub fn validate_part_number(&self, part_number: u32) -> JobResult<()> {
        if part_number < 1 || part_number > self.total_chunks {
            return Err(JobError::InvalidPartNumber {
                part_number,
                total: self.total_chunks,
            });
        }
        Ok(())
    }

    /// Record a part (idempotent per part number).
    pub fn add_part(
        &mut self,
        part_number: u32,
        etag: &str,
        at: DateTime<Utc>,
    ) -> JobResult<PartProgress> {
        self.validate_part_number(part_number)?;
        if etag.trim().is_empty() {
            return Err(JobError::EmptyETag(part_number));
        }
        if self.phase == SessionPhase::Completing {
            return Err(JobError::CompletionInProgress(self.upload_id));
        }
        self.parts.record(part_number, etag, at);
        Ok(self.progress())
    }

    pub fn progress(&self) -> PartProgress {
        PartProgress {
            received: self.parts.received(),
            total: self.total_chunks,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

/// `{received, total}` as reported after each part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartProgress {
    pub received: u32,
    pub total: u32,
}

impl PartProgress {
    pub fn is_complete(&self) -> bool {
        self.received == self.total
    }
}

/// Status view for `GET status(upload_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStatus {
    pub received: u32,
    pub total: u32,
    pub complete: bool,
}

impl From<PartProgress> for UploadStatus {
    fn from(progress: PartProgress) -> Self {
        Self {
            received: progress.received,
            total: progress.total,
            complete: progress.is_complete(),
        }
    }
}
