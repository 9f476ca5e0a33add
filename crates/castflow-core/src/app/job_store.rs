//! JobRecordStore - Task / WorkflowInstance の状態遷移と永続化
//!
//! # 設計原則
//! - 遷移の妥当性は domain（`Task` / `WorkflowInstance`）が判定する
//! - 書き込みはすべて revision 付き CAS ループ（`modify`）で適用する
//! - workflow の終端状態は Task にミラーする（Task を processing のまま残さない）

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domain::{
    JobError, JobResult, StatusDetails, Task, TaskId, TaskType, WorkflowId, WorkflowInstance,
    WorkflowStatus,
};
use crate::ports::{Clock, IdGenerator, Record, RecordStore, StoreError, WorkflowEngine};

/// Give up on a write after this many lost CAS races.
const MAX_CAS_ATTEMPTS: usize = 16;

/// Read-modify-write `key` with compare-and-swap, retrying on revision races.
///
/// `apply` mutates a copy of the current record and returns whether anything
/// changed; when it returns `false` the stored record is returned untouched.
pub(crate) async fn modify<R, F>(
    store: &dyn RecordStore<R>,
    key: R::Key,
    missing: fn(R::Key) -> JobError,
    mut apply: F,
) -> JobResult<R>
where
    R: Record,
    F: FnMut(&mut R) -> JobResult<bool>,
{
    for _ in 0..MAX_CAS_ATTEMPTS {
        let Some(current) = store.get(key).await? else {
            return Err(missing(key));
        };
        let mut next = current.value.clone();
        if !apply(&mut next)? {
            return Ok(current.value);
        }
        match store.compare_and_swap(current.revision, next).await {
            Ok(saved) => return Ok(saved.value),
            Err(StoreError::RevisionMismatch { .. }) => {
                tracing::debug!(kind = R::KIND, key = %key, "lost a write race, retrying");
            }
            Err(StoreError::NotFound { .. }) => return Err(missing(key)),
            Err(err) => return Err(err.into()),
        }
    }
    Err(JobError::Conflict(format!(
        "{} {key}: gave up after {MAX_CAS_ATTEMPTS} concurrent writes",
        R::KIND
    )))
}

pub struct JobRecordStore {
    tasks: Arc<dyn RecordStore<Task>>,
    workflows: Arc<dyn RecordStore<WorkflowInstance>>,
    engine: Arc<dyn WorkflowEngine>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl JobRecordStore {
    pub fn new(
        tasks: Arc<dyn RecordStore<Task>>,
        workflows: Arc<dyn RecordStore<WorkflowInstance>>,
        engine: Arc<dyn WorkflowEngine>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            tasks,
            workflows,
            engine,
            clock,
            ids,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn create_task(
        &self,
        task_type: TaskType,
        payload: serde_json::Value,
    ) -> JobResult<Task> {
        let task = Task::new(self.ids.task_id(), task_type, payload, self.clock.now());
        let saved = self.tasks.insert(task).await?;
        tracing::info!(task_id = %saved.value.id, task_type = %saved.value.task_type, "task created");
        Ok(saved.value)
    }

    pub async fn get_task(&self, task_id: TaskId) -> JobResult<Task> {
        self.tasks
            .get(task_id)
            .await?
            .map(|v| v.value)
            .ok_or(JobError::TaskNotFound(task_id))
    }

    pub async fn get_workflow(&self, workflow_id: WorkflowId) -> JobResult<WorkflowInstance> {
        self.workflows
            .get(workflow_id)
            .await?
            .map(|v| v.value)
            .ok_or(JobError::WorkflowNotFound(workflow_id))
    }

    /// Every stored task; used to rebuild in-memory bookkeeping after a restart.
    pub async fn list_tasks(&self) -> JobResult<Vec<Task>> {
        let mut tasks = Vec::new();
        for task_id in self.tasks.keys().await? {
            if let Some(task) = self.tasks.get(task_id).await? {
                tasks.push(task.value);
            }
        }
        Ok(tasks)
    }

    async fn modify_task(
        &self,
        task_id: TaskId,
        apply: impl FnMut(&mut Task) -> JobResult<bool>,
    ) -> JobResult<Task> {
        modify(self.tasks.as_ref(), task_id, JobError::TaskNotFound, apply).await
    }

    /// pending | retry -> processing.
    pub async fn mark_started(&self, task_id: TaskId) -> JobResult<Task> {
        let now = self.clock.now();
        let task = self
            .modify_task(task_id, |t| t.start_attempt(now).map(|_| true))
            .await?;
        tracing::info!(task_id = %task_id, attempt = task.attempts, "task started");
        Ok(task)
    }

    pub async fn mark_done(
        &self,
        task_id: TaskId,
        result: Option<serde_json::Value>,
    ) -> JobResult<Task> {
        let now = self.clock.now();
        let task = self
            .modify_task(task_id, |t| t.mark_done(result.clone(), now).map(|_| true))
            .await?;
        tracing::info!(task_id = %task_id, "task done");
        Ok(task)
    }

    pub async fn mark_failed(&self, task_id: TaskId, error: &str) -> JobResult<Task> {
        let now = self.clock.now();
        let task = self
            .modify_task(task_id, |t| t.mark_failed(error, now).map(|_| true))
            .await?;
        tracing::warn!(task_id = %task_id, error, "task failed");
        Ok(task)
    }

    /// processing -> retry, due at `next_attempt_at`.
    pub async fn mark_retry(
        &self,
        task_id: TaskId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> JobResult<Task> {
        let now = self.clock.now();
        let task = self
            .modify_task(task_id, |t| {
                t.mark_retry(error, next_attempt_at, now).map(|_| true)
            })
            .await?;
        tracing::info!(task_id = %task_id, %next_attempt_at, error, "task scheduled for retry");
        Ok(task)
    }

    /// done | failed | retry -> pending.
    pub async fn reset_for_retry(&self, task_id: TaskId) -> JobResult<Task> {
        let now = self.clock.now();
        let task = self
            .modify_task(task_id, |t| t.reset(now).map(|_| true))
            .await?;
        tracing::info!(task_id = %task_id, "task reset");
        Ok(task)
    }

    pub async fn link_workflow(&self, task_id: TaskId, workflow_id: WorkflowId) -> JobResult<Task> {
        self.relink(task_id, Some(workflow_id)).await.map(|(task, _)| task)
    }

    /// Point the task at `workflow_id`; also returns the previous link.
    async fn relink(
        &self,
        task_id: TaskId,
        workflow_id: Option<WorkflowId>,
    ) -> JobResult<(Task, Option<WorkflowId>)> {
        let now = self.clock.now();
        let mut previous = None;
        let task = self
            .modify_task(task_id, |t| {
                previous = t.workflow_id;
                if t.workflow_id == workflow_id {
                    return Ok(false);
                }
                t.workflow_id = workflow_id;
                t.updated_at = now;
                Ok(true)
            })
            .await?;
        Ok((task, previous))
    }

    /// Copy the workflow's current estimate onto its task.
    ///
    /// Re-reads the workflow after each task write so that concurrent step
    /// callbacks converge on the latest estimate whatever order they land in.
    pub async fn sync_task_progress(&self, workflow_id: WorkflowId) -> JobResult<Task> {
        let now = self.clock.now();
        let mut workflow = self.get_workflow(workflow_id).await?;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let estimate = workflow.estimated_progress;
            let task = self
                .modify_task(workflow.task_id, |t| {
                    if t.progress == estimate
                        || t.status.is_terminal()
                        || t.workflow_id != Some(workflow_id)
                    {
                        return Ok(false);
                    }
                    t.progress = estimate;
                    t.updated_at = now;
                    Ok(true)
                })
                .await?;
            workflow = self.get_workflow(workflow_id).await?;
            if workflow.estimated_progress == estimate {
                return Ok(task);
            }
        }
        Err(JobError::Conflict(format!(
            "task progress for workflow {workflow_id}: gave up after {MAX_CAS_ATTEMPTS} concurrent writes"
        )))
    }

    /// Link the task to a new workflow id, start the engine instance and
    /// record it as `queued`. An engine failure restores the previous link.
    pub async fn create_workflow(
        &self,
        task_id: TaskId,
        workflow_type: TaskType,
        params: serde_json::Value,
    ) -> JobResult<WorkflowInstance> {
        // link first: a callback for the new instance must find its task pointing at it
        let workflow_id = self.ids.workflow_id();
        let (_, previous) = self.relink(task_id, Some(workflow_id)).await?;
        let handle = match self.engine.start_instance(&workflow_type, params).await {
            Ok(handle) => handle,
            Err(err) => {
                if let Err(unlink_err) = self.relink(task_id, previous).await {
                    tracing::warn!(
                        task_id = %task_id,
                        workflow_id = %workflow_id,
                        error = %unlink_err,
                        "could not restore workflow link after engine failure"
                    );
                }
                return Err(err.into());
            }
        };
        let workflow = WorkflowInstance::new(
            workflow_id,
            task_id,
            workflow_type,
            handle,
            self.clock.now(),
        );
        let saved = self.workflows.insert(workflow).await?;
        tracing::info!(
            task_id = %task_id,
            workflow_id = %saved.value.id,
            instance = %saved.value.instance_handle.0,
            "workflow instance started"
        );
        Ok(saved.value)
    }

    /// CAS write of a workflow record; used by the progress aggregator.
    pub async fn save_workflow_progress(
        &self,
        workflow_id: WorkflowId,
        apply: impl FnMut(&mut WorkflowInstance) -> JobResult<bool>,
    ) -> JobResult<WorkflowInstance> {
        modify(
            self.workflows.as_ref(),
            workflow_id,
            JobError::WorkflowNotFound,
            apply,
        )
        .await
    }

    /// Write a workflow status and mirror terminal outcomes onto its task.
    pub async fn update_workflow_status(
        &self,
        workflow_id: WorkflowId,
        status: WorkflowStatus,
        details: StatusDetails,
    ) -> JobResult<WorkflowInstance> {
        let now = self.clock.now();
        let workflow = self
            .save_workflow_progress(workflow_id, |w| {
                w.set_status(status, details.clone(), now).map(|_| true)
            })
            .await?;
        tracing::info!(workflow_id = %workflow_id, status = %status, "workflow status updated");

        let outcome = match status {
            WorkflowStatus::Completed => Ok(Some(serde_json::json!({
                "workflowId": workflow.id,
                "instanceHandle": workflow.instance_handle,
            }))),
            WorkflowStatus::Failed => Err(workflow
                .error
                .clone()
                .unwrap_or_else(|| "workflow failed".to_string())),
            WorkflowStatus::Cancelled => Err("workflow cancelled".to_string()),
            WorkflowStatus::Terminated => Err("workflow terminated".to_string()),
            WorkflowStatus::Queued | WorkflowStatus::Running | WorkflowStatus::Paused => {
                return Ok(workflow);
            }
        };
        self.settle_task(&workflow, outcome).await?;
        Ok(workflow)
    }

    /// Workflow -> failed, its task -> retry (due at `next_attempt_at`).
    pub async fn fail_workflow_for_retry(
        &self,
        workflow_id: WorkflowId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> JobResult<(WorkflowInstance, Task)> {
        let now = self.clock.now();
        let workflow = self
            .save_workflow_progress(workflow_id, |w| {
                w.set_status(WorkflowStatus::Failed, StatusDetails::error(error), now)
                    .map(|_| true)
            })
            .await?;
        let task = self.mark_retry(workflow.task_id, error, next_attempt_at).await?;
        Ok((workflow, task))
    }

    async fn settle_task(
        &self,
        workflow: &WorkflowInstance,
        outcome: Result<Option<serde_json::Value>, String>,
    ) -> JobResult<()> {
        let now = self.clock.now();
        let result = self
            .modify_task(workflow.task_id, |t| {
                if t.status.is_terminal() {
                    tracing::warn!(
                        task_id = %t.id,
                        workflow_id = %workflow.id,
                        status = %t.status,
                        "task already terminal, not mirroring workflow outcome"
                    );
                    return Ok(false);
                }
                if t.workflow_id.is_some_and(|linked| linked != workflow.id) {
                    tracing::warn!(
                        task_id = %t.id,
                        workflow_id = %workflow.id,
                        "outcome from a superseded workflow ignored"
                    );
                    return Ok(false);
                }
                t.settle(outcome.clone(), now).map(|_| true)
            })
            .await;
        match result {
            Ok(task) => {
                tracing::info!(task_id = %task.id, status = %task.status, "task settled from workflow");
                Ok(())
            }
            // a workflow without its task is left as is
            Err(JobError::TaskNotFound(task_id)) => {
                tracing::warn!(task_id = %task_id, workflow_id = %workflow.id, "workflow task missing");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskStatus;
    use crate::impls::{InMemoryRecordStore, RecordingWorkflowEngine};
    use crate::ports::{EngineError, FixedClock, UlidGenerator};
    use rstest::rstest;

    struct Fixture {
        jobs: JobRecordStore,
        engine: Arc<RecordingWorkflowEngine>,
        tasks: Arc<InMemoryRecordStore<Task>>,
    }

    fn fixture() -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(Utc::now()));
        let engine = Arc::new(RecordingWorkflowEngine::new());
        let tasks: Arc<InMemoryRecordStore<Task>> = Arc::new(InMemoryRecordStore::new());
        let workflows: Arc<InMemoryRecordStore<WorkflowInstance>> =
            Arc::new(InMemoryRecordStore::new());
        let jobs = JobRecordStore::new(
            tasks.clone(),
            workflows,
            engine.clone(),
            clock.clone(),
            Arc::new(UlidGenerator::new(clock)),
        );
        Fixture {
            jobs,
            engine,
            tasks,
        }
    }

    async fn running(f: &Fixture) -> (Task, WorkflowInstance) {
        let task = f
            .jobs
            .create_task(TaskType::new(TaskType::AUDIO_PROCESSING), serde_json::json!({}))
            .await
            .unwrap();
        f.jobs.mark_started(task.id).await.unwrap();
        let wf = f
            .jobs
            .create_workflow(task.id, task.task_type.clone(), serde_json::json!({}))
            .await
            .unwrap();
        let task = f.jobs.link_workflow(task.id, wf.id).await.unwrap();
        (task, wf)
    }

    #[tokio::test]
    async fn create_task_starts_pending() {
        let f = fixture();
        let task = f
            .jobs
            .create_task(TaskType::new(TaskType::IMPORT_SHOW), serde_json::json!({"feed": "x"}))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert_eq!(f.jobs.get_task(task.id).await.unwrap(), task);
    }

    #[tokio::test]
    async fn missing_records_are_not_found() {
        let f = fixture();
        let (task, wf) = running(&f).await;
        f.tasks.delete(task.id).await.unwrap();
        assert!(matches!(
            f.jobs.mark_done(task.id, None).await,
            Err(JobError::TaskNotFound(_))
        ));
        // the workflow still settles even though its task is gone
        f.jobs
            .update_workflow_status(wf.id, WorkflowStatus::Completed, StatusDetails::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_workflow_goes_through_the_engine() {
        let f = fixture();
        let (task, wf) = running(&f).await;
        assert_eq!(wf.status, WorkflowStatus::Queued);
        assert_eq!(task.workflow_id, Some(wf.id));
        let started = f.engine.started().await;
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].handle, wf.instance_handle);
    }

    #[tokio::test]
    async fn engine_failure_creates_no_workflow() {
        let f = fixture();
        f.engine
            .fail_next(EngineError::Unavailable("connection refused".into()))
            .await;
        let task = f
            .jobs
            .create_task(TaskType::new(TaskType::TRANSCRIPTION), serde_json::json!({}))
            .await
            .unwrap();
        let err = f
            .jobs
            .create_workflow(task.id, task.task_type.clone(), serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Engine(_)));
    }

    #[rstest]
    #[case::completed(WorkflowStatus::Completed, TaskStatus::Done, None)]
    #[case::failed(WorkflowStatus::Failed, TaskStatus::Failed, Some("encoder exited 1"))]
    #[case::cancelled(WorkflowStatus::Cancelled, TaskStatus::Failed, Some("workflow cancelled"))]
    #[case::terminated(WorkflowStatus::Terminated, TaskStatus::Failed, Some("workflow terminated"))]
    #[tokio::test]
    async fn terminal_workflow_status_is_mirrored(
        #[case] status: WorkflowStatus,
        #[case] task_status: TaskStatus,
        #[case] task_error: Option<&str>,
    ) {
        let f = fixture();
        let (task, wf) = running(&f).await;
        let details = match status {
            WorkflowStatus::Failed => StatusDetails::error("encoder exited 1"),
            _ => StatusDetails::default(),
        };
        let wf = f
            .jobs
            .update_workflow_status(wf.id, status, details)
            .await
            .unwrap();
        assert!(wf.completed_at.is_some());

        let task = f.jobs.get_task(task.id).await.unwrap();
        assert_eq!(task.status, task_status);
        assert_eq!(task.error.as_deref(), task_error);
    }

    #[tokio::test]
    async fn terminal_workflow_refuses_further_writes() {
        let f = fixture();
        let (_, wf) = running(&f).await;
        f.jobs
            .update_workflow_status(wf.id, WorkflowStatus::Completed, StatusDetails::default())
            .await
            .unwrap();
        let err = f
            .jobs
            .update_workflow_status(wf.id, WorkflowStatus::Cancelled, StatusDetails::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            JobError::WorkflowAlreadyTerminal { status: WorkflowStatus::Completed, .. }
        ));
    }

    #[tokio::test]
    async fn running_status_leaves_the_task_alone() {
        let f = fixture();
        let (task, wf) = running(&f).await;
        f.jobs
            .update_workflow_status(wf.id, WorkflowStatus::Running, StatusDetails::default())
            .await
            .unwrap();
        assert_eq!(
            f.jobs.get_task(task.id).await.unwrap().status,
            TaskStatus::Processing
        );
    }

    #[tokio::test]
    async fn fail_for_retry_moves_task_to_retry() {
        let f = fixture();
        let (task, wf) = running(&f).await;
        let due = Utc::now() + chrono::Duration::seconds(40);
        let (wf, task_after) = f
            .jobs
            .fail_workflow_for_retry(wf.id, "503 from transcriber", due)
            .await
            .unwrap();
        assert_eq!(wf.status, WorkflowStatus::Failed);
        assert_eq!(task_after.id, task.id);
        assert_eq!(task_after.status, TaskStatus::Retry);
        assert_eq!(task_after.next_attempt_at, Some(due));
        assert_eq!(task_after.error.as_deref(), Some("503 from transcriber"));
    }

    #[tokio::test]
    async fn reset_then_restart_counts_another_attempt() {
        let f = fixture();
        let (task, _) = running(&f).await;
        f.jobs.mark_failed(task.id, "boom").await.unwrap();
        let reset = f.jobs.reset_for_retry(task.id).await.unwrap();
        assert_eq!(reset.status, TaskStatus::Pending);
        assert_eq!(reset.error, None);

        let restarted = f.jobs.mark_started(task.id).await.unwrap();
        assert_eq!(restarted.attempts, 2);
    }

    #[tokio::test]
    async fn engine_failure_keeps_the_previous_link() {
        let f = fixture();
        let (task, wf) = running(&f).await;
        f.jobs.mark_failed(task.id, "boom").await.unwrap();
        f.jobs.reset_for_retry(task.id).await.unwrap();
        f.jobs.mark_started(task.id).await.unwrap();

        f.engine
            .fail_next(EngineError::Unavailable("connection refused".into()))
            .await;
        f.jobs
            .create_workflow(task.id, task.task_type.clone(), serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(f.jobs.get_task(task.id).await.unwrap().workflow_id, Some(wf.id));
    }

    #[tokio::test]
    async fn task_points_at_a_new_workflow_before_its_first_callback() {
        let f = fixture();
        let (task, old) = running(&f).await;
        f.jobs.mark_failed(task.id, "boom").await.unwrap();
        f.jobs.reset_for_retry(task.id).await.unwrap();
        f.jobs.mark_started(task.id).await.unwrap();

        let new = f
            .jobs
            .create_workflow(task.id, task.task_type.clone(), serde_json::json!({}))
            .await
            .unwrap();
        assert_ne!(new.id, old.id);
        assert_eq!(f.jobs.get_task(task.id).await.unwrap().workflow_id, Some(new.id));

        // the engine reports completion straight away
        f.jobs
            .update_workflow_status(new.id, WorkflowStatus::Completed, StatusDetails::default())
            .await
            .unwrap();
        let task = f.jobs.get_task(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.progress, 100);
    }

    #[tokio::test]
    async fn task_progress_follows_the_latest_estimate() {
        let f = fixture();
        let (task, wf) = running(&f).await;
        let now = Utc::now();
        for estimate in [40u8, 70] {
            f.jobs
                .save_workflow_progress(wf.id, |w| {
                    w.estimated_progress = estimate;
                    w.updated_at = now;
                    Ok(true)
                })
                .await
                .unwrap();
        }
        // a late sync still copies what the workflow holds now
        let synced = f.jobs.sync_task_progress(wf.id).await.unwrap();
        assert_eq!(synced.progress, 70);
        assert_eq!(f.jobs.get_task(task.id).await.unwrap().progress, 70);
    }

    #[tokio::test]
    async fn concurrent_writers_all_land() {
        let f = Arc::new(fixture());
        let (_, wf) = running(&f).await;
        let workflow_id = wf.id;
        let mut joins = Vec::new();
        for step in ["a", "b", "c", "d", "e", "f", "g", "h"] {
            let f = Arc::clone(&f);
            joins.push(tokio::spawn(async move {
                let now = Utc::now();
                f.jobs
                    .save_workflow_progress(workflow_id, |w| Ok(w.upsert_step(step, 50, None, now)))
                    .await
                    .unwrap();
            }));
        }
        for j in joins {
            j.await.unwrap();
        }
        let stored = f.jobs.get_workflow(workflow_id).await.unwrap();
        assert_eq!(stored.step_progress.len(), 8);
    }
}
