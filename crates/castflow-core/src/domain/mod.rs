//! Domain model (ids, upload sessions, tasks, workflows, retry decisions, ...).

pub mod decision;
pub mod errors;
pub mod ids;
pub mod progress;
pub mod retry;
pub mod state;
pub mod task;
pub mod upload;
pub mod workflow;

pub use decision::{AttemptWindow, BudgetDecider, Decider, Decision, FailureClass};
pub use errors::{ErrorKind, JobError, JobResult, RateLimitSignal};
pub use ids::{TaskId, UploadId, WorkflowId};
pub use progress::{WeightRegistry, WeightTable};
pub use retry::RetryPolicy;
pub use state::{TaskStatus, WorkflowStatus};
pub use task::{Task, TaskType};
pub use upload::{
    CompletedPart, PartLedger, PartProgress, PartRecord, SessionPhase, UploadSession, UploadStatus,
};
pub use workflow::{InstanceHandle, StatusDetails, StepProgress, WorkflowInstance};
