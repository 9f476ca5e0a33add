//! Configuration for the upload and job subsystems.
//!
//! Every field has a default, so `{}` is a valid configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::AdmissionLimits;
use crate::domain::{JobError, JobResult, RetryPolicy, TaskType, WeightRegistry, WeightTable};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CastflowConfig {
    #[serde(default)]
    pub uploads: UploadConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub jobs: JobConfig,
}

/// Upload session settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Lifetime of an upload session before it is aborted, in seconds.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
}

/// Retry budget and backoff settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total retry budget from a task's first start.
    #[serde(default = "default_max_retry_time_secs")]
    pub max_retry_time_secs: u64,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Budget that must remain after a retry delay.
    #[serde(default = "default_safety_buffer_secs")]
    pub safety_buffer_secs: u64,
}

/// Job admission and progress settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobConfig {
    /// Tasks allowed in `processing` at once.
    #[serde(default = "default_max_active_jobs")]
    pub max_active_jobs: usize,
    /// `retryAfterSeconds` handed out when the limit is hit.
    #[serde(default = "default_rate_limit_retry_after_secs")]
    pub rate_limit_retry_after_secs: u64,
    /// Extra step weight tables, keyed by workflow type. Replaces a built-in
    /// table of the same name.
    #[serde(default)]
    pub weight_tables: BTreeMap<String, BTreeMap<String, u32>>,
}

fn default_session_ttl_secs() -> u64 {
    86400 // 24 hours
}

fn default_max_retry_time_secs() -> u64 {
    3600
}

fn default_base_delay_secs() -> u64 {
    10
}

fn default_max_delay_secs() -> u64 {
    300
}

fn default_safety_buffer_secs() -> u64 {
    30
}

fn default_max_active_jobs() -> usize {
    32
}

fn default_rate_limit_retry_after_secs() -> u64 {
    30
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry_time_secs: default_max_retry_time_secs(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            safety_buffer_secs: default_safety_buffer_secs(),
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_active_jobs: default_max_active_jobs(),
            rate_limit_retry_after_secs: default_rate_limit_retry_after_secs(),
            weight_tables: BTreeMap::new(),
        }
    }
}

impl CastflowConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(s: &str) -> JobResult<Self> {
        let config: Self =
            serde_json::from_str(s).map_err(|e| JobError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> JobResult<()> {
        if self.uploads.session_ttl_secs == 0 {
            return Err(JobError::Config(
                "uploads.session_ttl_secs must be positive".to_string(),
            ));
        }
        let retry = &self.retry;
        if retry.base_delay_secs == 0 {
            return Err(JobError::Config(
                "retry.base_delay_secs must be positive".to_string(),
            ));
        }
        if retry.base_delay_secs > retry.max_delay_secs {
            return Err(JobError::Config(format!(
                "retry.base_delay_secs ({}) exceeds retry.max_delay_secs ({})",
                retry.base_delay_secs, retry.max_delay_secs
            )));
        }
        if self.jobs.max_active_jobs == 0 {
            return Err(JobError::Config(
                "jobs.max_active_jobs must be positive".to_string(),
            ));
        }
        self.weight_registry().map(|_| ())
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.uploads.session_ttl_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retry_time: Duration::from_secs(self.retry.max_retry_time_secs),
            base_delay: Duration::from_secs(self.retry.base_delay_secs),
            max_delay: Duration::from_secs(self.retry.max_delay_secs),
            safety_buffer: Duration::from_secs(self.retry.safety_buffer_secs),
        }
    }

    pub fn admission_limits(&self) -> AdmissionLimits {
        AdmissionLimits {
            max_active_jobs: self.jobs.max_active_jobs,
            retry_after: Duration::from_secs(self.jobs.rate_limit_retry_after_secs),
        }
    }

    /// Built-in tables plus the configured ones, all validated.
    pub fn weight_registry(&self) -> JobResult<WeightRegistry> {
        let mut registry = WeightRegistry::builtin()?;
        for (workflow_type, weights) in &self.jobs.weight_tables {
            let table = WeightTable::new(weights.clone()).map_err(|e| {
                JobError::Config(format!("weight table {workflow_type:?}: {e}"))
            })?;
            registry.insert(TaskType::new(workflow_type.clone()), table);
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let config = CastflowConfig::from_json_str("{}").unwrap();
        assert_eq!(config.session_ttl(), Duration::from_secs(86400));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.admission_limits(), AdmissionLimits::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = CastflowConfig::from_json_str(
            r#"{"retry": {"base_delay_secs": 5}, "jobs": {"max_active_jobs": 4}}"#,
        )
        .unwrap();
        assert_eq!(config.retry.base_delay_secs, 5);
        assert_eq!(config.retry.max_delay_secs, 300);
        assert_eq!(config.jobs.max_active_jobs, 4);
        assert_eq!(config.jobs.rate_limit_retry_after_secs, 30);
    }

    #[test]
    fn configured_tables_join_the_builtin_ones() {
        let config = CastflowConfig::from_json_str(
            r#"{"jobs": {"weight_tables": {"ad-stitching": {"fetch": 30, "stitch": 70}}}}"#,
        )
        .unwrap();
        let registry = config.weight_registry().unwrap();
        assert!(registry.contains(&TaskType::new("ad-stitching")));
        assert!(registry.contains(&TaskType::new(TaskType::AUDIO_PROCESSING)));
    }

    #[test]
    fn bad_table_is_rejected_at_load() {
        let err = CastflowConfig::from_json_str(
            r#"{"jobs": {"weight_tables": {"ad-stitching": {"fetch": 30, "stitch": 60}}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, JobError::Config(_)));
        assert!(err.to_string().contains("ad-stitching"));
    }

    #[test]
    fn inverted_delays_are_rejected() {
        let err = CastflowConfig::from_json_str(
            r#"{"retry": {"base_delay_secs": 600, "max_delay_secs": 300}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, JobError::Config(_)));
    }

    #[test]
    fn zero_ttl_is_rejected() {
        assert!(CastflowConfig::from_json_str(r#"{"uploads": {"session_ttl_secs": 0}}"#).is_err());
    }
}
