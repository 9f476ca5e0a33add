//! IdGenerator port - ID 生成の抽象化
//!
//! テスト容易性のために、trait として抽象化しています。
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use std::sync::Arc;

use ulid::Ulid;

use crate::domain::ids::{TaskId, UploadId, WorkflowId};
use crate::ports::Clock;

/// IdGenerator は分散システムで使える ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数スレッドから使える）
pub trait IdGenerator: Send + Sync {
    /// Upload session ID を生成
    fn upload_id(&self) -> UploadId;

    /// Task ID を生成
    fn task_id(&self) -> TaskId;

    /// Workflow instance ID を生成
    fn workflow_id(&self) -> WorkflowId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// Clock を使って現在時刻ベースの ULID を生成します。
/// テスト時に FixedClock を使うと timestamp 部分が決定的になります。
pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl IdGenerator for UlidGenerator {
    fn upload_id(&self) -> UploadId {
        UploadId::from(self.next())
    }

    fn task_id(&self) -> TaskId {
        TaskId::from(self.next())
    }

    fn workflow_id(&self) -> WorkflowId {
        WorkflowId::from(self.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn ulid_generator_generates_unique_ids() {
        let id_gen = UlidGenerator::new(Arc::new(SystemClock));

        let id1 = id_gen.task_id();
        let id2 = id_gen.task_id();
        assert_ne!(id1, id2);
    }

    #[test]
    fn ulid_generator_with_fixed_clock_shares_timestamp() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(Arc::new(FixedClock::new(fixed_time)));

        let id1 = id_gen.upload_id();
        let id2 = id_gen.upload_id();

        // ランダム部分があるので ID は異なる
        assert_ne!(id1, id2);

        // timestamp 部分は同じ
        assert_eq!(id1.as_ulid().timestamp_ms(), id2.as_ulid().timestamp_ms());
        assert_eq!(
            id1.as_ulid().timestamp_ms(),
            fixed_time.timestamp_millis() as u64
        );
    }

    #[test]
    fn different_id_types_are_generated() {
        let id_gen = UlidGenerator::new(Arc::new(SystemClock));

        assert!(id_gen.upload_id().to_string().starts_with("upload-"));
        assert!(id_gen.task_id().to_string().starts_with("task-"));
        assert!(id_gen.workflow_id().to_string().starts_with("wf-"));
    }
}
