//! Priority-ordered ready queue for submitted jobs.
//!
//! One list per priority. Producers LPUSH; workers BRPOP across the lists
//! in high→normal→low order, which yields strict priority with FIFO inside
//! each class.

use crate::kv::{KvClient, KvError};
use crate::metrics::Metrics;
use crate::model::Priority;

fn queue_key(priority: Priority) -> String {
    format!("queue:ready:{}", priority.as_str())
}

#[derive(Clone)]
pub struct ReadyQueue {
    kv: KvClient,
    metrics: Metrics,
}

impl ReadyQueue {
    pub fn new(kv: KvClient, metrics: Metrics) -> Self {
        Self { kv, metrics }
    }

    pub async fn push(&self, job_id: &str, priority: Priority) -> Result<(), KvError> {
        self.kv.lpush(&queue_key(priority), job_id).await?;
        self.refresh_depth_gauge().await;
        Ok(())
    }

    /// Pop the next job id, honoring priority. Blocks up to `timeout_secs`;
    /// `None` means the queue stayed empty.
    pub async fn pop(&self, timeout_secs: u64) -> Result<Option<String>, KvError> {
        let keys: Vec<String> = Priority::ordered_desc()
            .iter()
            .map(|priority| queue_key(*priority))
            .collect();
        let popped = self.kv.brpop(&keys, timeout_secs).await?;
        if popped.is_some() {
            self.refresh_depth_gauge().await;
        }
        Ok(popped.map(|(_key, job_id)| job_id))
    }

    pub async fn depth(&self, priority: Priority) -> Result<u64, KvError> {
        self.kv.llen(&queue_key(priority)).await
    }

    pub async fn total_depth(&self) -> Result<u64, KvError> {
        let mut total = 0;
        for priority in Priority::ordered_desc() {
            total += self.depth(priority).await?;
        }
        Ok(total)
    }

    async fn refresh_depth_gauge(&self) {
        for priority in Priority::ordered_desc() {
            if let Ok(depth) = self.depth(priority).await {
                self.metrics
                    .queue_depth
                    .with_label_values(&[priority.as_str()])
                    .set(depth as i64);
            }
        }
    }
}
