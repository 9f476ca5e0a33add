//! AppBuilder - アプリケーションの構築とワイヤリング
//!
//! # 設計
//! - 未指定の port は in-memory 実装で埋める（開発・テスト用）
//! - 起動時検証（Fail-fast）: 設定と重み表を build() 時に検証する
//! - `expect_workflow_types` で指定した workflow type に重み表が無ければ失敗

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::CastflowConfig;
use crate::domain::{
    BudgetDecider, Decider, JobError, JobResult, Task, TaskType, UploadSession, WorkflowInstance,
};
use crate::impls::{
    ContentTypeRouting, InMemoryObjectStore, InMemoryRecordStore, RecordingWorkflowEngine,
};
use crate::ports::{
    Clock, IdGenerator, ObjectStore, RecordStore, SystemClock, UlidGenerator,
    UploadCompletionHook, WorkflowEngine,
};

use super::coordinator::UploadCoordinator;
use super::job_store::JobRecordStore;
use super::orchestrator::JobOrchestrator;
use super::progress::ProgressAggregator;
use super::session_actor::SessionHost;

/// AppBuilder はアプリケーションを構築
///
/// # 使用例
/// ```ignore
/// let app = AppBuilder::new()
///     .config(CastflowConfig::from_json_str(raw)?)
///     .object_store(s3)
///     .workflow_engine(engine)
///     .expect_workflow_types(&["audio-processing"])
///     .build()?;
/// ```
#[derive(Default)]
pub struct AppBuilder {
    config: CastflowConfig,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    object_store: Option<Arc<dyn ObjectStore>>,
    engine: Option<Arc<dyn WorkflowEngine>>,
    hook: Option<Arc<dyn UploadCompletionHook>>,
    decider: Option<Arc<dyn Decider>>,
    sessions: Option<Arc<dyn RecordStore<UploadSession>>>,
    tasks: Option<Arc<dyn RecordStore<Task>>>,
    workflows: Option<Arc<dyn RecordStore<WorkflowInstance>>>,
    expected_workflow_types: Vec<String>,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: CastflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn object_store(mut self, object_store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = Some(object_store);
        self
    }

    pub fn workflow_engine(mut self, engine: Arc<dyn WorkflowEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn completion_hook(mut self, hook: Arc<dyn UploadCompletionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Replace the budget decider built from `config.retry`.
    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn session_store(mut self, store: Arc<dyn RecordStore<UploadSession>>) -> Self {
        self.sessions = Some(store);
        self
    }

    pub fn task_store(mut self, store: Arc<dyn RecordStore<Task>>) -> Self {
        self.tasks = Some(store);
        self
    }

    pub fn workflow_store(mut self, store: Arc<dyn RecordStore<WorkflowInstance>>) -> Self {
        self.workflows = Some(store);
        self
    }

    /// Workflow types that must have a weight table at build time.
    pub fn expect_workflow_types(mut self, workflow_types: &[&str]) -> Self {
        self.expected_workflow_types = workflow_types.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Validate the configuration and wire every component.
    pub fn build(self) -> JobResult<App> {
        self.config.validate()?;
        let weights = self.config.weight_registry()?;
        let missing: Vec<&str> = self
            .expected_workflow_types
            .iter()
            .filter(|ty| !weights.contains(&TaskType::new(ty.as_str())))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(JobError::Config(format!(
                "no weight table for workflow types {missing:?}"
            )));
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let object_store = self
            .object_store
            .unwrap_or_else(|| Arc::new(InMemoryObjectStore::new()));
        let engine = self
            .engine
            .unwrap_or_else(|| Arc::new(RecordingWorkflowEngine::new()));
        let hook = self
            .hook
            .unwrap_or_else(|| Arc::new(ContentTypeRouting::default()));
        let decider = self
            .decider
            .unwrap_or_else(|| Arc::new(BudgetDecider::new(self.config.retry_policy())));
        let sessions = self
            .sessions
            .unwrap_or_else(|| Arc::new(InMemoryRecordStore::new()));
        let tasks = self
            .tasks
            .unwrap_or_else(|| Arc::new(InMemoryRecordStore::new()));
        let workflows = self
            .workflows
            .unwrap_or_else(|| Arc::new(InMemoryRecordStore::new()));

        let jobs = Arc::new(JobRecordStore::new(
            tasks,
            workflows,
            engine,
            Arc::clone(&clock),
            Arc::clone(&ids),
        ));
        let progress = ProgressAggregator::new(Arc::clone(&jobs), Arc::new(weights));
        let orchestrator = Arc::new(JobOrchestrator::new(
            jobs,
            progress,
            decider,
            self.config.admission_limits(),
        ));
        let session_host = Arc::new(SessionHost::new(
            sessions,
            Arc::clone(&object_store),
            clock,
            self.config.session_ttl(),
        ));
        let coordinator = Arc::new(UploadCoordinator::new(
            Arc::clone(&session_host),
            object_store,
            hook,
            Arc::clone(&orchestrator),
            ids,
        ));

        Ok(App {
            config: self.config,
            sessions: session_host,
            coordinator,
            orchestrator,
        })
    }
}

/// The wired application.
pub struct App {
    pub config: CastflowConfig,
    pub sessions: Arc<SessionHost>,
    pub coordinator: Arc<UploadCoordinator>,
    pub orchestrator: Arc<JobOrchestrator>,
}

impl App {
    /// Recover persisted state and spawn the retry loop.
    pub async fn start(&self) -> JobResult<Background> {
        self.sessions.resume_persisted().await?;
        self.orchestrator.recover().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let orchestrator = Arc::clone(&self.orchestrator);
        let retry_loop = tokio::spawn(async move {
            orchestrator.run_retry_loop(shutdown_rx).await;
        });
        Ok(Background {
            shutdown_tx,
            retry_loop,
        })
    }
}

/// Background loop handle.
/// - `shutdown_tx` を drop するとループが止まる
/// - `shutdown_and_join()` で終了を待てる
pub struct Background {
    shutdown_tx: watch::Sender<bool>,
    retry_loop: JoinHandle<()>,
}

impl Background {
    pub fn request_shutdown(&self) {
        // ignore send error: the loop may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.retry_loop.await;
    }
}
