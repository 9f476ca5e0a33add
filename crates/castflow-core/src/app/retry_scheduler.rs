//! RetryScheduler - 再試行予定の task を期限順に保持する
//!
//! BinaryHeap（逆順 Ord で min-heap）+ Notify による待機。
//! 期限の判定は Clock で行うので、テストでは FixedClock を進めて `pop_due` を呼べる。

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use crate::domain::TaskId;
use crate::ports::Clock;

/// Scheduled retry entry.
///
/// Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledRetry {
    due_at: DateTime<Utc>,
    task_id: TaskId,
}

impl PartialOrd for ScheduledRetry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledRetry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .due_at
            .cmp(&self.due_at)
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}

pub struct RetryScheduler {
    clock: Arc<dyn Clock>,
    heap: Mutex<BinaryHeap<ScheduledRetry>>,
    notify: Notify,
}

impl RetryScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
        }
    }

    pub async fn schedule(&self, task_id: TaskId, due_at: DateTime<Utc>) {
        self.heap.lock().await.push(ScheduledRetry { due_at, task_id });
        self.notify.notify_one();
    }

    pub async fn len(&self) -> usize {
        self.heap.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.heap.lock().await.is_empty()
    }

    pub async fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.heap.lock().await.peek().map(|entry| entry.due_at)
    }

    /// Remove and return every entry due at the current clock time.
    pub async fn pop_due(&self) -> Vec<TaskId> {
        let now = self.clock.now();
        let mut heap = self.heap.lock().await;
        let mut due = Vec::new();
        while let Some(entry) = heap.peek() {
            if entry.due_at > now {
                break;
            }
            if let Some(entry) = heap.pop() {
                due.push(entry.task_id);
            }
        }
        due
    }

    /// Wait until at least one entry is due and return the due entries.
    pub async fn wait_due(&self) -> Vec<TaskId> {
        loop {
            let due = self.pop_due().await;
            if !due.is_empty() {
                return due;
            }

            // Wait for a new entry OR the earliest scheduled time
            match self.next_due_at().await {
                Some(due_at) => {
                    let wait = (due_at - self.clock.now())
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = self.notify.notified() => {},
                        _ = tokio::time::sleep(wait) => {},
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }
}
