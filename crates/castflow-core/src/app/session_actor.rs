//! SessionHost - upload session ごとの single-writer actor
//!
//! # 設計
//! - live な session 1 つにつき tokio task 1 つ（mpsc の mailbox を消費する）
//! - 同じ upload_id への操作は mailbox 上で直列化される
//! - actor が expiry timer も所有する（actor 終了 = timer 解除）
//! - 状態は RecordStore に write-through で保存し、再起動後は lazy に復元する

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::Instant;

use crate::domain::{
    JobError, JobResult, PartProgress, SessionPhase, UploadId, UploadSession,
};
use crate::ports::{Clock, ObjectStore, RecordStore, StoreError, Versioned};

const MAILBOX_CAPACITY: usize = 32;

/// Wait before re-running an expiry whose state delete failed.
const EXPIRY_RETRY: Duration = Duration::from_secs(60);

type Reply<T> = oneshot::Sender<JobResult<T>>;

enum Command {
    GetState(Reply<UploadSession>),
    AddPart {
        part_number: u32,
        etag: String,
        reply: Reply<PartProgress>,
    },
    BeginCompletion(Reply<UploadSession>),
    CancelCompletion(Reply<()>),
    Complete(Reply<UploadSession>),
    Abort(Reply<UploadSession>),
    FireExpiry(Reply<ExpiryOutcome>),
}

/// Result of running the expiry handler for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryOutcome {
    /// The session was past its TTL and has been removed.
    Expired,
    /// The session is still within its TTL.
    NotDue,
    /// No such session (already completed, aborted or expired).
    Gone,
}

struct Mailbox {
    generation: u64,
    tx: mpsc::Sender<Command>,
}

type Mailboxes = Mutex<HashMap<UploadId, Mailbox>>;

/// Collaborators shared by the host and every actor.
#[derive(Clone)]
struct Shared {
    store: Arc<dyn RecordStore<UploadSession>>,
    object_store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

/// Owner of all live upload session actors.
pub struct SessionHost {
    shared: Shared,
    mailboxes: Arc<Mailboxes>,
    next_generation: AtomicU64,
}

impl SessionHost {
    pub fn new(
        store: Arc<dyn RecordStore<UploadSession>>,
        object_store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            shared: Shared {
                store,
                object_store,
                clock,
                ttl,
            },
            mailboxes: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.shared.ttl
    }

    /// Persist a new session and start its actor (and expiry timer).
    pub async fn initialize(
        &self,
        upload_id: UploadId,
        target_key: &str,
        remote_upload_id: &str,
        total_chunks: u32,
        content_type: &str,
    ) -> JobResult<UploadSession> {
        let session = UploadSession::new(
            upload_id,
            target_key,
            remote_upload_id,
            content_type,
            total_chunks,
            self.shared.clock.now(),
        )?;

        let mut mailboxes = self.mailboxes.lock().await;
        if mailboxes.contains_key(&upload_id) {
            return Err(JobError::AlreadyInitialized(upload_id));
        }
        let record = self
            .shared
            .store
            .insert(session)
            .await
            .map_err(|err| match err {
                StoreError::AlreadyExists { .. } => JobError::AlreadyInitialized(upload_id),
                other => other.into(),
            })?;
        let snapshot = record.value.clone();
        let mailbox = self.spawn_actor(record);
        mailboxes.insert(upload_id, mailbox);

        tracing::info!(
            upload_id = %upload_id,
            total_chunks,
            ttl_secs = self.shared.ttl.as_secs(),
            "upload session initialized"
        );
        Ok(snapshot)
    }

    pub async fn get_state(&self, upload_id: UploadId) -> JobResult<UploadSession> {
        self.call(upload_id, Command::GetState).await
    }

    pub async fn add_part(
        &self,
        upload_id: UploadId,
        part_number: u32,
        etag: &str,
    ) -> JobResult<PartProgress> {
        let etag = etag.to_string();
        self.call(upload_id, |reply| Command::AddPart {
            part_number,
            etag,
            reply,
        })
        .await
    }

    /// Check completeness and move the session into `completing`.
    pub async fn begin_completion(&self, upload_id: UploadId) -> JobResult<UploadSession> {
        self.call(upload_id, Command::BeginCompletion).await
    }

    /// Return a `completing` session to `receiving` after a failed remote complete.
    pub async fn cancel_completion(&self, upload_id: UploadId) -> JobResult<()> {
        self.call(upload_id, Command::CancelCompletion).await
    }

    /// Delete the session state; the actor and its timer stop.
    pub async fn complete(&self, upload_id: UploadId) -> JobResult<UploadSession> {
        self.call(upload_id, Command::Complete).await
    }

    /// Same as `complete`, for a cancelled upload.
    pub async fn abort(&self, upload_id: UploadId) -> JobResult<UploadSession> {
        self.call(upload_id, Command::Abort).await
    }

    /// Run the expiry handler now. Calling it repeatedly is safe.
    pub async fn fire_expiry(&self, upload_id: UploadId) -> JobResult<ExpiryOutcome> {
        match self.call(upload_id, Command::FireExpiry).await {
            Err(JobError::SessionNotFound(_)) => Ok(ExpiryOutcome::Gone),
            other => other,
        }
    }

    /// Start actors for every persisted session (startup recovery).
    pub async fn resume_persisted(&self) -> JobResult<usize> {
        let keys = self.shared.store.keys().await?;
        let mut resumed = 0;
        for upload_id in keys {
            match self.mailbox(upload_id).await {
                Ok(_) => resumed += 1,
                Err(JobError::SessionNotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        tracing::info!(resumed, "resumed persisted upload sessions");
        Ok(resumed)
    }

    /// Run the expiry handler for every persisted session; returns how many are gone.
    pub async fn sweep_expired(&self) -> JobResult<usize> {
        let mut removed = 0;
        for upload_id in self.shared.store.keys().await? {
            if self.fire_expiry(upload_id).await? != ExpiryOutcome::NotDue {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "expired upload sessions swept");
        }
        Ok(removed)
    }

    /// Number of running actors.
    pub async fn live_sessions(&self) -> usize {
        self.mailboxes.lock().await.len()
    }

    async fn call<T>(
        &self,
        upload_id: UploadId,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> JobResult<T> {
        let tx = self.mailbox(upload_id).await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(command(reply_tx))
            .await
            .map_err(|_| JobError::SessionNotFound(upload_id))?;
        // the actor stopped before answering
        reply_rx
            .await
            .map_err(|_| JobError::SessionNotFound(upload_id))?
    }

    /// Mailbox of a live actor, hydrating it from the store if needed.
    ///
    /// The map lock is held across the store read, so a session deleted by a
    /// stopping actor is never resurrected.
    async fn mailbox(&self, upload_id: UploadId) -> JobResult<mpsc::Sender<Command>> {
        let mut mailboxes = self.mailboxes.lock().await;
        if let Some(mailbox) = mailboxes.get(&upload_id) {
            return Ok(mailbox.tx.clone());
        }
        let Some(record) = self.shared.store.get(upload_id).await? else {
            return Err(JobError::SessionNotFound(upload_id));
        };
        tracing::debug!(upload_id = %upload_id, revision = record.revision, "hydrating session actor");
        let mailbox = self.spawn_actor(record);
        let tx = mailbox.tx.clone();
        mailboxes.insert(upload_id, mailbox);
        Ok(tx)
    }

    fn spawn_actor(&self, record: Versioned<UploadSession>) -> Mailbox {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let actor = SessionActor {
            record,
            shared: self.shared.clone(),
            mailboxes: Arc::downgrade(&self.mailboxes),
            generation,
            retry_not_before: None,
        };
        tokio::spawn(actor.run(rx));
        Mailbox { generation, tx }
    }
}

enum Flow {
    Continue,
    Stop,
}

struct SessionActor {
    record: Versioned<UploadSession>,
    shared: Shared,
    mailboxes: Weak<Mailboxes>,
    generation: u64,
    retry_not_before: Option<Instant>,
}

impl SessionActor {
    fn upload_id(&self) -> UploadId {
        self.record.value.upload_id
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        loop {
            let wake_at = self.next_wake();
            tokio::select! {
                command = rx.recv() => {
                    // host dropped
                    let Some(command) = command else { break };
                    if let Flow::Stop = self.handle(command).await {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(wake_at) => {
                    match self.expire().await {
                        Ok(ExpiryOutcome::NotDue) => {
                            tracing::debug!(upload_id = %self.upload_id(), "expiry woke early, re-arming");
                        }
                        Ok(_) => break,
                        Err(err) => {
                            tracing::error!(upload_id = %self.upload_id(), error = %err, "session expiry failed");
                            self.retry_not_before = Some(Instant::now() + EXPIRY_RETRY);
                        }
                    }
                }
            }
        }
        tracing::debug!(upload_id = %self.upload_id(), "session actor stopped");
    }

    /// created_at + ttl, as a tokio instant.
    fn next_wake(&self) -> Instant {
        let age = self
            .record
            .value
            .age(self.shared.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let remaining = self.shared.ttl.saturating_sub(age);
        let now = Instant::now();
        let deadline = now
            .checked_add(remaining)
            .unwrap_or_else(|| now + Duration::from_secs(86400 * 365));
        match self.retry_not_before {
            Some(not_before) => deadline.max(not_before),
            None => deadline,
        }
    }

    async fn handle(&mut self, command: Command) -> Flow {
        match command {
            Command::GetState(reply) => {
                let _ = reply.send(Ok(self.record.value.clone()));
                Flow::Continue
            }
            Command::AddPart {
                part_number,
                etag,
                reply,
            } => {
                let _ = reply.send(self.add_part(part_number, &etag).await);
                Flow::Continue
            }
            Command::BeginCompletion(reply) => {
                let _ = reply.send(self.begin_completion().await);
                Flow::Continue
            }
            Command::CancelCompletion(reply) => {
                let _ = reply.send(self.cancel_completion().await);
                Flow::Continue
            }
            Command::Complete(reply) => self.finish(reply, "completed").await,
            Command::Abort(reply) => self.finish(reply, "aborted").await,
            Command::FireExpiry(reply) => {
                let result = self.expire().await;
                let flow = match result {
                    Ok(ExpiryOutcome::NotDue) | Err(_) => Flow::Continue,
                    Ok(_) => Flow::Stop,
                };
                let _ = reply.send(result);
                flow
            }
        }
    }

    async fn persist(&mut self, next: UploadSession) -> JobResult<()> {
        self.record = self
            .shared
            .store
            .compare_and_swap(self.record.revision, next)
            .await?;
        Ok(())
    }

    async fn add_part(&mut self, part_number: u32, etag: &str) -> JobResult<PartProgress> {
        let mut next = self.record.value.clone();
        let progress = next.add_part(part_number, etag, self.shared.clock.now())?;
        self.persist(next).await?;
        tracing::debug!(
            upload_id = %self.upload_id(),
            part_number,
            received = progress.received,
            total = progress.total,
            "part recorded"
        );
        Ok(progress)
    }

    async fn begin_completion(&mut self) -> JobResult<UploadSession> {
        let session = &self.record.value;
        if session.phase == SessionPhase::Completing {
            return Err(JobError::CompletionInProgress(session.upload_id));
        }
        session.parts.ensure_complete(session.total_chunks)?;

        let mut next = session.clone();
        next.phase = SessionPhase::Completing;
        self.persist(next).await?;
        Ok(self.record.value.clone())
    }

    async fn cancel_completion(&mut self) -> JobResult<()> {
        if self.record.value.phase == SessionPhase::Receiving {
            return Ok(());
        }
        let mut next = self.record.value.clone();
        next.phase = SessionPhase::Receiving;
        self.persist(next).await
    }

    /// Delete the state, detach from the host, then answer.
    async fn finish(&mut self, reply: Reply<UploadSession>, how: &'static str) -> Flow {
        match self.remove_state().await {
            Ok(()) => {
                tracing::info!(upload_id = %self.upload_id(), "upload session {how}");
                let _ = reply.send(Ok(self.record.value.clone()));
                Flow::Stop
            }
            Err(err) => {
                let _ = reply.send(Err(err));
                Flow::Continue
            }
        }
    }

    async fn expire(&mut self) -> JobResult<ExpiryOutcome> {
        let session = &self.record.value;
        let age = session.age(self.shared.clock.now()).to_std().unwrap_or(Duration::ZERO);
        if age < self.shared.ttl {
            return Ok(ExpiryOutcome::NotDue);
        }

        if let Err(err) = self
            .shared
            .object_store
            .abort_multipart_upload(&session.target_key, &session.remote_upload_id)
            .await
        {
            // already finalized or cleaned up remotely
            tracing::warn!(
                upload_id = %session.upload_id,
                remote_upload_id = %session.remote_upload_id,
                error = %err,
                "remote abort on expiry failed; dropping local state anyway"
            );
        }
        self.remove_state().await?;
        tracing::info!(upload_id = %self.upload_id(), age_secs = age.as_secs(), "upload session expired");
        Ok(ExpiryOutcome::Expired)
    }

    async fn remove_state(&mut self) -> JobResult<()> {
        self.shared.store.delete(self.upload_id()).await?;
        self.retry_not_before = None;
        if let Some(mailboxes) = self.mailboxes.upgrade() {
            let mut mailboxes = mailboxes.lock().await;
            if mailboxes
                .get(&self.upload_id())
                .is_some_and(|m| m.generation == self.generation)
            {
                mailboxes.remove(&self.upload_id());
            }
        }
        Ok(())
    }
}
