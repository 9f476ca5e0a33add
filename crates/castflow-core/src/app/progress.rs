//! ProgressAggregator - step 進捗から workflow 全体の進捗を計算する
//!
//! - step ごとの進捗を upsert し、workflow type の重み表で加重平均を取り直す
//! - 同じ更新が重複して届いても結果は変わらない（idempotent）
//! - 終端状態の workflow への更新は無視する
//! - Task の progress は書き込み後に workflow を読み直して追従させる（順不同の到着に耐える）

use std::sync::Arc;

use crate::domain::{JobError, JobResult, WeightRegistry, WorkflowId, WorkflowInstance};

use super::job_store::JobRecordStore;

pub struct ProgressAggregator {
    jobs: Arc<JobRecordStore>,
    weights: Arc<WeightRegistry>,
}

impl ProgressAggregator {
    pub fn new(jobs: Arc<JobRecordStore>, weights: Arc<WeightRegistry>) -> Self {
        Self { jobs, weights }
    }

    pub fn weights(&self) -> &WeightRegistry {
        &self.weights
    }

    /// Upsert one step and recompute `estimated_progress`; the linked task's
    /// `progress` follows.
    pub async fn record_step_progress(
        &self,
        workflow_id: WorkflowId,
        step_name: &str,
        percent_complete: u8,
        message: Option<String>,
    ) -> JobResult<WorkflowInstance> {
        if percent_complete > 100 {
            return Err(JobError::InvalidInput(format!(
                "percent_complete must be 0..=100, got {percent_complete}"
            )));
        }
        if step_name.trim().is_empty() {
            return Err(JobError::InvalidInput("step name is empty".to_string()));
        }

        let now = self.jobs.clock().now();
        let mut ignored = false;
        let workflow = self
            .jobs
            .save_workflow_progress(workflow_id, |w| {
                ignored = w.status.is_terminal();
                if ignored {
                    return Ok(false);
                }
                let changed = w.upsert_step(step_name, percent_complete, message.clone(), now);
                let estimate = match self.weights.get(&w.workflow_type) {
                    Some(table) => table.estimate(&w.step_progress),
                    None => 0,
                };
                if !changed && estimate == w.estimated_progress {
                    return Ok(false);
                }
                w.estimated_progress = estimate;
                Ok(true)
            })
            .await?;

        if ignored {
            tracing::info!(
                workflow_id = %workflow_id,
                step = step_name,
                status = %workflow.status,
                "progress for terminal workflow ignored"
            );
            return Ok(workflow);
        }
        if !self.weights.contains(&workflow.workflow_type) {
            tracing::debug!(
                workflow_id = %workflow_id,
                workflow_type = %workflow.workflow_type,
                "no weight table for workflow type"
            );
        }
        tracing::debug!(
            workflow_id = %workflow_id,
            step = step_name,
            percent_complete,
            estimated_progress = workflow.estimated_progress,
            "step progress recorded"
        );

        self.jobs.sync_task_progress(workflow_id).await?;
        Ok(workflow)
    }
}
