//! JobOrchestrator - task の起動・callback 処理・リトライ判断
//!
//! # フロー
//! 1. create_task / submit: Task を作成（submit はそのまま起動も試みる）
//! 2. start_task: admission → mark_started → link → engine で workflow 起動
//! 3. engine callback: on_step_progress / on_workflow_status / on_step_failed
//! 4. 失敗時: classify → decide → retry 予約 or failed
//! 5. run_retry_loop: 期限が来た task を再起動

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};

use crate::domain::{
    AttemptWindow, Decider, Decision, FailureClass, JobError, JobResult, RateLimitSignal,
    StatusDetails, Task, TaskId, TaskStatus, TaskType, WorkflowId, WorkflowInstance,
    WorkflowStatus,
};
use crate::ports::Clock;

use super::job_store::JobRecordStore;
use super::progress::ProgressAggregator;
use super::retry_scheduler::RetryScheduler;

/// Backpressure limits applied when a task attempt starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    /// Tasks allowed in `processing` at once.
    pub max_active_jobs: usize,

    /// Hint returned to callers turned away by the limit.
    pub retry_after: Duration,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            max_active_jobs: 32,
            retry_after: Duration::from_secs(30),
        }
    }
}

pub struct JobOrchestrator {
    jobs: Arc<JobRecordStore>,
    progress: ProgressAggregator,
    decider: Arc<dyn Decider>,
    scheduler: RetryScheduler,
    clock: Arc<dyn Clock>,
    limits: AdmissionLimits,
    active: Mutex<HashSet<TaskId>>,
}

impl JobOrchestrator {
    pub fn new(
        jobs: Arc<JobRecordStore>,
        progress: ProgressAggregator,
        decider: Arc<dyn Decider>,
        limits: AdmissionLimits,
    ) -> Self {
        let clock = Arc::clone(jobs.clock());
        Self {
            jobs,
            progress,
            decider,
            scheduler: RetryScheduler::new(Arc::clone(&clock)),
            clock,
            limits,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn jobs(&self) -> &JobRecordStore {
        &self.jobs
    }

    pub fn scheduler(&self) -> &RetryScheduler {
        &self.scheduler
    }

    pub async fn active_jobs(&self) -> usize {
        self.active.lock().await.len()
    }

    #[tracing::instrument(skip(self, payload), fields(task_type = %task_type))]
    pub async fn create_task(
        &self,
        task_type: TaskType,
        payload: serde_json::Value,
    ) -> JobResult<TaskId> {
        Ok(self.jobs.create_task(task_type, payload).await?.id)
    }

    pub async fn get_task(&self, task_id: TaskId) -> JobResult<Task> {
        self.jobs.get_task(task_id).await
    }

    pub async fn get_workflow(&self, workflow_id: WorkflowId) -> JobResult<WorkflowInstance> {
        self.jobs.get_workflow(workflow_id).await
    }

    /// Create a task and start it. A task turned away by admission stays
    /// `pending` and is picked up by the retry loop after the hint.
    #[tracing::instrument(skip(self, payload), fields(task_type = %task_type))]
    pub async fn submit(&self, task_type: TaskType, payload: serde_json::Value) -> JobResult<Task> {
        let task = self.jobs.create_task(task_type, payload).await?;
        match self.start_task(task.id).await {
            Err(JobError::RateLimited(signal)) => {
                self.defer(task.id, signal).await;
                Ok(task)
            }
            other => other,
        }
    }

    /// Start an attempt: admission, `processing`, then a linked engine instance.
    ///
    /// Engine failures are routed through the decider; the returned task then
    /// shows `retry` or `failed`.
    #[tracing::instrument(skip(self), fields(task_id = %task_id))]
    pub async fn start_task(&self, task_id: TaskId) -> JobResult<Task> {
        self.admit(task_id).await?;
        let task = match self.jobs.mark_started(task_id).await {
            Ok(task) => task,
            Err(err) => {
                self.release(task_id).await;
                return Err(err);
            }
        };

        match self
            .jobs
            .create_workflow(task.id, task.task_type.clone(), task.payload.clone())
            .await
        {
            Ok(workflow) => self.jobs.get_task(workflow.task_id).await,
            Err(err) => {
                let message = err.to_string();
                self.handle_failure(task, None, err, message).await
            }
        }
    }

    /// Reset a finished (or retry-scheduled) task and start it again.
    #[tracing::instrument(skip(self), fields(task_id = %task_id))]
    pub async fn retry_task(&self, task_id: TaskId) -> JobResult<Task> {
        self.jobs.reset_for_retry(task_id).await?;
        self.start_task(task_id).await
    }

    /// Engine callback: one step reported progress.
    pub async fn on_step_progress(
        &self,
        workflow_id: WorkflowId,
        step_name: &str,
        percent_complete: u8,
        message: Option<String>,
    ) -> JobResult<WorkflowInstance> {
        self.progress
            .record_step_progress(workflow_id, step_name, percent_complete, message)
            .await
    }

    /// Engine callback: the instance changed status.
    #[tracing::instrument(skip(self, details), fields(workflow_id = %workflow_id, status = %status))]
    pub async fn on_workflow_status(
        &self,
        workflow_id: WorkflowId,
        status: WorkflowStatus,
        details: StatusDetails,
    ) -> JobResult<WorkflowInstance> {
        let workflow = self
            .jobs
            .update_workflow_status(workflow_id, status, details)
            .await?;
        if status.is_terminal() {
            self.release(workflow.task_id).await;
        }
        Ok(workflow)
    }

    /// Engine callback: a step failed after the engine's own retries.
    #[tracing::instrument(skip(self, error), fields(workflow_id = %workflow_id, step = step_name))]
    pub async fn on_step_failed(
        &self,
        workflow_id: WorkflowId,
        step_name: &str,
        error: JobError,
    ) -> JobResult<Task> {
        let workflow = self.jobs.get_workflow(workflow_id).await?;
        if workflow.status.is_terminal() {
            return Err(JobError::WorkflowAlreadyTerminal {
                id: workflow.id,
                status: workflow.status,
            });
        }
        let task = self.jobs.get_task(workflow.task_id).await?;
        let message = format!("step {step_name}: {error}");
        self.handle_failure(task, Some(workflow.id), error, message)
            .await
    }

    /// A failure observed outside the engine callbacks (e.g. by a worker).
    #[tracing::instrument(skip(self, error), fields(task_id = %task_id))]
    pub async fn report_failure(&self, task_id: TaskId, error: JobError) -> JobResult<Task> {
        let task = self.jobs.get_task(task_id).await?;
        let live_workflow = match task.workflow_id {
            Some(workflow_id) => match self.jobs.get_workflow(workflow_id).await {
                Ok(workflow) => (!workflow.status.is_terminal()).then_some(workflow_id),
                // linked, but the engine never produced the instance
                Err(JobError::WorkflowNotFound(_)) => None,
                Err(err) => return Err(err),
            },
            None => None,
        };
        let message = error.to_string();
        self.handle_failure(task, live_workflow, error, message).await
    }

    /// classify -> decide -> retry or give up.
    async fn handle_failure(
        &self,
        task: Task,
        workflow_id: Option<WorkflowId>,
        error: JobError,
        message: String,
    ) -> JobResult<Task> {
        let now = self.clock.now();
        let failure = FailureClass::classify(&error, task.attempts);
        let window = AttemptWindow {
            started_at: task.first_started_at.unwrap_or(now),
            now,
        };
        let decision = self.decider.decide(window, failure);
        self.release(task.id).await;

        match decision {
            Decision::Retry { delay, reason } => {
                let due_at = due_after(now, delay)?;
                let task = match workflow_id {
                    Some(workflow_id) => {
                        self.jobs
                            .fail_workflow_for_retry(workflow_id, &message, due_at)
                            .await?
                            .1
                    }
                    None => self.jobs.mark_retry(task.id, &message, due_at).await?,
                };
                self.scheduler.schedule(task.id, due_at).await;
                tracing::info!(task_id = %task.id, ?failure, %reason, "retry scheduled");
                Ok(task)
            }
            Decision::GiveUp { reason } => {
                tracing::warn!(task_id = %task.id, ?failure, %reason, error = %message, "giving up");
                match workflow_id {
                    Some(workflow_id) => {
                        self.jobs
                            .update_workflow_status(
                                workflow_id,
                                WorkflowStatus::Failed,
                                StatusDetails::error(message),
                            )
                            .await?;
                        self.jobs.get_task(task.id).await
                    }
                    None => self.jobs.mark_failed(task.id, &message).await,
                }
            }
        }
    }

    async fn admit(&self, task_id: TaskId) -> JobResult<()> {
        let mut active = self.active.lock().await;
        if !active.contains(&task_id) && active.len() >= self.limits.max_active_jobs {
            let signal = RateLimitSignal {
                retry_after_seconds: self.limits.retry_after.as_secs(),
                active_jobs: active.len(),
            };
            tracing::warn!(task_id = %task_id, active_jobs = signal.active_jobs, "admission refused");
            return Err(JobError::RateLimited(signal));
        }
        active.insert(task_id);
        Ok(())
    }

    async fn release(&self, task_id: TaskId) {
        self.active.lock().await.remove(&task_id);
    }

    async fn defer(&self, task_id: TaskId, signal: RateLimitSignal) {
        let delay = Duration::from_secs(signal.retry_after_seconds);
        let now = self.clock.now();
        let due_at = due_after(now, delay).unwrap_or(now);
        self.scheduler.schedule(task_id, due_at).await;
        tracing::info!(task_id = %task_id, %due_at, "task start deferred");
    }

    /// Start every task whose retry is due now; returns how many were started.
    pub async fn run_due_retries(&self) -> JobResult<usize> {
        let due = self.scheduler.pop_due().await;
        self.start_due(due).await
    }

    async fn start_due(&self, due: Vec<TaskId>) -> JobResult<usize> {
        let now = self.clock.now();
        let mut started = 0;
        for task_id in due {
            let task = match self.jobs.get_task(task_id).await {
                Ok(task) => task,
                Err(JobError::TaskNotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            let runnable = match task.status {
                TaskStatus::Pending => true,
                TaskStatus::Retry => task.next_attempt_at.is_none_or(|at| at <= now),
                _ => false,
            };
            if !runnable {
                // reset, restarted or finished since it was scheduled
                tracing::debug!(task_id = %task_id, status = %task.status, "stale retry entry skipped");
                continue;
            }
            match self.start_task(task_id).await {
                Ok(_) => started += 1,
                Err(JobError::RateLimited(signal)) => self.defer(task_id, signal).await,
                Err(err) => {
                    tracing::warn!(task_id = %task_id, error = %err, "scheduled start failed");
                }
            }
        }
        Ok(started)
    }

    /// Rebuild in-memory bookkeeping from stored tasks after a restart:
    /// `processing` tasks hold admission slots, `retry` tasks are rescheduled.
    pub async fn recover(&self) -> JobResult<usize> {
        let mut recovered = 0;
        for task in self.jobs.list_tasks().await? {
            match task.status {
                TaskStatus::Processing => {
                    self.active.lock().await.insert(task.id);
                    recovered += 1;
                }
                TaskStatus::Retry => {
                    let due_at = task.next_attempt_at.unwrap_or_else(|| self.clock.now());
                    self.scheduler.schedule(task.id, due_at).await;
                    recovered += 1;
                }
                _ => {}
            }
        }
        tracing::info!(recovered, "job bookkeeping recovered");
        Ok(recovered)
    }

    /// Start due retries until `shutdown` flips to true (or its sender is dropped).
    pub async fn run_retry_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let due = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                due = self.scheduler.wait_due() => due,
            };
            if let Err(err) = self.start_due(due).await {
                tracing::error!(error = %err, "retry loop pass failed");
            }
        }
        tracing::info!("retry loop stopped");
    }
}

fn due_after(now: DateTime<Utc>, delay: Duration) -> JobResult<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .ok_or_else(|| JobError::Fatal(format!("retry delay {delay:?} out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BudgetDecider, Task, WeightRegistry, WorkflowInstance};
    use crate::impls::{InMemoryRecordStore, RecordingWorkflowEngine};
    use crate::ports::{EngineError, FixedClock, UlidGenerator};

    struct Fixture {
        orchestrator: Arc<JobOrchestrator>,
        engine: Arc<RecordingWorkflowEngine>,
        clock: Arc<FixedClock>,
    }

    fn fixture(limits: AdmissionLimits) -> Fixture {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let engine = Arc::new(RecordingWorkflowEngine::new());
        let tasks: Arc<InMemoryRecordStore<Task>> = Arc::new(InMemoryRecordStore::new());
        let workflows: Arc<InMemoryRecordStore<WorkflowInstance>> =
            Arc::new(InMemoryRecordStore::new());
        let jobs = Arc::new(JobRecordStore::new(
            tasks,
            workflows,
            engine.clone(),
            clock.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
        ));
        let progress = ProgressAggregator::new(
            jobs.clone(),
            Arc::new(WeightRegistry::builtin().unwrap()),
        );
        let orchestrator = Arc::new(JobOrchestrator::new(
            jobs,
            progress,
            Arc::new(BudgetDecider::default()),
            limits,
        ));
        Fixture {
            orchestrator,
            engine,
            clock,
        }
    }

    fn audio() -> TaskType {
        TaskType::new(TaskType::AUDIO_PROCESSING)
    }

    #[tokio::test]
    async fn submit_starts_a_workflow() {
        let f = fixture(AdmissionLimits::default());
        let task = f
            .orchestrator
            .submit(audio(), serde_json::json!({"episode": "ep-1"}))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Processing);
        assert_eq!(task.attempts, 1);
        let workflow = f
            .orchestrator
            .get_workflow(task.workflow_id.unwrap())
            .await
            .unwrap();
        assert_eq!(workflow.task_id, task.id);
        assert_eq!(f.engine.started().await[0].params["episode"], "ep-1");
        assert_eq!(f.orchestrator.active_jobs().await, 1);
    }

    #[tokio::test]
    async fn admission_limit_returns_a_rate_limit_signal() {
        let f = fixture(AdmissionLimits {
            max_active_jobs: 1,
            retry_after: Duration::from_secs(12),
        });
        f.orchestrator.submit(audio(), serde_json::json!({})).await.unwrap();

        let second = f
            .orchestrator
            .create_task(audio(), serde_json::json!({}))
            .await
            .unwrap();
        let err = f.orchestrator.start_task(second).await.unwrap_err();
        assert_eq!(
            err.rate_limit(),
            Some(RateLimitSignal {
                retry_after_seconds: 12,
                active_jobs: 1,
            })
        );
        assert_eq!(
            f.orchestrator.get_task(second).await.unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn deferred_submit_starts_once_a_slot_frees_up() {
        let f = fixture(AdmissionLimits {
            max_active_jobs: 1,
            retry_after: Duration::from_secs(12),
        });
        let first = f.orchestrator.submit(audio(), serde_json::json!({})).await.unwrap();
        let second = f.orchestrator.submit(audio(), serde_json::json!({})).await.unwrap();
        assert_eq!(second.status, TaskStatus::Pending);

        f.orchestrator
            .on_workflow_status(
                first.workflow_id.unwrap(),
                WorkflowStatus::Completed,
                StatusDetails::default(),
            )
            .await
            .unwrap();
        f.clock.advance(chrono::Duration::seconds(12));
        assert_eq!(f.orchestrator.run_due_retries().await.unwrap(), 1);
        assert_eq!(
            f.orchestrator.get_task(second.id).await.unwrap().status,
            TaskStatus::Processing
        );
    }

    #[tokio::test]
    async fn transient_step_failure_schedules_a_retry() {
        let f = fixture(AdmissionLimits::default());
        let task = f.orchestrator.submit(audio(), serde_json::json!({})).await.unwrap();
        let workflow_id = task.workflow_id.unwrap();

        let task = f
            .orchestrator
            .on_step_failed(workflow_id, "encode", JobError::Engine("503".into()))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Retry);
        assert_eq!(task.error.as_deref(), Some("step encode: workflow engine error: 503"));
        // first attempt backs off by the base delay
        assert_eq!(
            task.next_attempt_at,
            Some(f.clock.now() + chrono::Duration::seconds(10))
        );
        assert_eq!(
            f.orchestrator.get_workflow(workflow_id).await.unwrap().status,
            WorkflowStatus::Failed
        );
        assert_eq!(f.orchestrator.active_jobs().await, 0);

        // not yet due
        assert_eq!(f.orchestrator.run_due_retries().await.unwrap(), 0);
        f.clock.advance(chrono::Duration::seconds(10));
        assert_eq!(f.orchestrator.run_due_retries().await.unwrap(), 1);

        let task = f.orchestrator.get_task(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Processing);
        assert_eq!(task.attempts, 2);
        assert_ne!(task.workflow_id, Some(workflow_id));
        assert_eq!(f.engine.started().await.len(), 2);
    }

    #[tokio::test]
    async fn fatal_step_failure_fails_task_and_workflow() {
        let f = fixture(AdmissionLimits::default());
        let task = f.orchestrator.submit(audio(), serde_json::json!({})).await.unwrap();
        let workflow_id = task.workflow_id.unwrap();

        let task = f
            .orchestrator
            .on_step_failed(workflow_id, "encode", JobError::Fatal("unsupported codec".into()))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("step encode: unsupported codec"));
        assert_eq!(
            f.orchestrator.get_workflow(workflow_id).await.unwrap().status,
            WorkflowStatus::Failed
        );
        assert!(f.orchestrator.scheduler().is_empty().await);
    }

    #[tokio::test]
    async fn exhausted_budget_gives_up_with_the_last_error() {
        let f = fixture(AdmissionLimits::default());
        let task = f.orchestrator.submit(audio(), serde_json::json!({})).await.unwrap();
        f.clock.advance(chrono::Duration::seconds(3600 - 35));

        let task = f
            .orchestrator
            .report_failure(task.id, JobError::Storage("connection reset".into()))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.error.as_deref(),
            Some("object storage error: connection reset")
        );
    }

    #[tokio::test]
    async fn throttled_engine_uses_the_hint_exactly() {
        let f = fixture(AdmissionLimits::default());
        f.engine
            .fail_next(EngineError::Throttled(RateLimitSignal {
                retry_after_seconds: 25,
                active_jobs: 9,
            }))
            .await;
        let task = f.orchestrator.submit(audio(), serde_json::json!({})).await.unwrap();
        assert_eq!(task.status, TaskStatus::Retry);
        assert_eq!(task.workflow_id, None);
        assert_eq!(
            task.next_attempt_at,
            Some(f.clock.now() + chrono::Duration::seconds(25))
        );
        assert_eq!(f.orchestrator.scheduler().len().await, 1);
    }

    #[tokio::test]
    async fn retry_task_resets_and_restarts() {
        let f = fixture(AdmissionLimits::default());
        let task = f.orchestrator.submit(audio(), serde_json::json!({})).await.unwrap();
        f.orchestrator
            .on_workflow_status(
                task.workflow_id.unwrap(),
                WorkflowStatus::Failed,
                StatusDetails::error("transcriber crashed"),
            )
            .await
            .unwrap();
        assert_eq!(
            f.orchestrator.get_task(task.id).await.unwrap().error.as_deref(),
            Some("transcriber crashed")
        );

        let task = f.orchestrator.retry_task(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Processing);
        assert_eq!(task.attempts, 2);
        assert_eq!(task.error, None);
    }

    #[tokio::test]
    async fn immediate_completion_of_a_retried_task_settles_it() {
        let f = fixture(AdmissionLimits::default());
        let task = f.orchestrator.submit(audio(), serde_json::json!({})).await.unwrap();
        let first = task.workflow_id.unwrap();
        f.orchestrator
            .on_workflow_status(first, WorkflowStatus::Failed, StatusDetails::error("oom"))
            .await
            .unwrap();

        // the steps of retry_task, with the engine callback arriving as soon
        // as the new instance exists
        let jobs = f.orchestrator.jobs();
        jobs.reset_for_retry(task.id).await.unwrap();
        jobs.mark_started(task.id).await.unwrap();
        let second = jobs
            .create_workflow(task.id, audio(), serde_json::json!({}))
            .await
            .unwrap();
        f.orchestrator
            .on_workflow_status(second.id, WorkflowStatus::Completed, StatusDetails::default())
            .await
            .unwrap();

        let task = f.orchestrator.get_task(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.workflow_id, Some(second.id));
        assert_eq!(f.orchestrator.active_jobs().await, 0);
    }

    #[tokio::test]
    async fn failure_report_tolerates_a_link_without_an_instance() {
        let f = fixture(AdmissionLimits::default());
        let task = f.orchestrator.submit(audio(), serde_json::json!({})).await.unwrap();
        let dangling = WorkflowId::from_ulid(ulid::Ulid::new());
        f.orchestrator.jobs().link_workflow(task.id, dangling).await.unwrap();

        let task = f
            .orchestrator
            .report_failure(task.id, JobError::Fatal("bad input".into()))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn processing_task_cannot_be_retried() {
        let f = fixture(AdmissionLimits::default());
        let task = f.orchestrator.submit(audio(), serde_json::json!({})).await.unwrap();
        assert!(matches!(
            f.orchestrator.retry_task(task.id).await,
            Err(JobError::InvalidTransition { from: TaskStatus::Processing, .. })
        ));
    }

    #[tokio::test]
    async fn step_progress_flows_to_the_task() {
        let f = fixture(AdmissionLimits::default());
        let task = f.orchestrator.submit(audio(), serde_json::json!({})).await.unwrap();
        let workflow_id = task.workflow_id.unwrap();
        f.orchestrator
            .on_step_progress(workflow_id, "download", 100, None)
            .await
            .unwrap();
        f.orchestrator
            .on_step_progress(workflow_id, "encode", 50, Some("encoding".into()))
            .await
            .unwrap();
        // 10*100 + 20*50 over 100
        assert_eq!(f.orchestrator.get_task(task.id).await.unwrap().progress, 20);
    }

    #[tokio::test]
    async fn recover_reschedules_retrying_tasks() {
        let f = fixture(AdmissionLimits::default());
        let task = f.orchestrator.submit(audio(), serde_json::json!({})).await.unwrap();
        f.orchestrator
            .report_failure(task.id, JobError::Engine("503".into()))
            .await
            .unwrap();
        let processing = f.orchestrator.submit(audio(), serde_json::json!({})).await.unwrap();
        assert_eq!(processing.status, TaskStatus::Processing);

        // a fresh orchestrator over the same records
        let progress = ProgressAggregator::new(
            f.orchestrator.jobs.clone(),
            Arc::new(WeightRegistry::builtin().unwrap()),
        );
        let restarted = JobOrchestrator::new(
            f.orchestrator.jobs.clone(),
            progress,
            Arc::new(BudgetDecider::default()),
            AdmissionLimits::default(),
        );
        assert_eq!(restarted.recover().await.unwrap(), 2);
        assert_eq!(restarted.active_jobs().await, 1);
        assert_eq!(restarted.scheduler().len().await, 1);
    }

    #[tokio::test]
    async fn retry_loop_stops_on_shutdown() {
        let f = fixture(AdmissionLimits::default());
        let (tx, rx) = watch::channel(false);
        let orchestrator = Arc::clone(&f.orchestrator);
        let handle = tokio::spawn(async move { orchestrator.run_retry_loop(rx).await });

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
