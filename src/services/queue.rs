use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::models::job::{QueuedJob, Tier};

const QUEUE_KEY_PREFIX: &str = "image_jobs:queue";

pub fn queue_key(tier: Tier) -> String {
    format!("{}:{}", QUEUE_KEY_PREFIX, tier)
}

/// In-flight list, one per worker so a restarted worker can reclaim its own.
pub fn processing_key(tier: Tier, worker_id: &str) -> String {
    format!("{}:{}:processing:{}", QUEUE_KEY_PREFIX, tier, worker_id)
}

pub fn dead_letter_key(tier: Tier) -> String {
    format!("{}:{}:dead", QUEUE_KEY_PREFIX, tier)
}

fn first_attempt() -> u32 {
    1
}

/// Job payload plus delivery bookkeeping, as serialized into Redis. The
/// payload fields sit at the top level, so a bare job pushed by the admitting
/// API reads as its first attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEnvelope {
    #[serde(flatten)]
    pub job: QueuedJob,
    /// 1-based delivery attempt.
    #[serde(default = "first_attempt")]
    pub attempt: u32,
}

impl QueueEnvelope {
    pub fn new(job: QueuedJob) -> Self {
        Self { job, attempt: 1 }
    }

    pub fn next_attempt(&self) -> Self {
        Self {
            job: self.job.clone(),
            attempt: self.attempt + 1,
        }
    }
}

/// A dequeued envelope together with the exact payload that was moved to
/// the processing list, needed to remove it again.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: QueueEnvelope,
    pub raw: String,
}

/// One tier's queue.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    fn tier(&self) -> Tier;

    async fn enqueue(&self, envelope: &QueueEnvelope) -> Result<(), QueueError>;

    /// Non-blocking pop into the processing list.
    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError>;

    /// Acknowledge a delivery.
    async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Acknowledge and push the next attempt back onto the queue.
    async fn requeue(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Acknowledge and park the payload on the dead-letter list.
    async fn dead_letter(&self, delivery: &Delivery) -> Result<(), QueueError>;
}

/// Redis list-backed tier queue.
pub struct RedisTierQueue {
    tier: Tier,
    worker_id: String,
    conn: MultiplexedConnection,
}

impl RedisTierQueue {
    pub fn new(tier: Tier, worker_id: &str, conn: MultiplexedConnection) -> Self {
        Self {
            tier,
            worker_id: worker_id.to_string(),
            conn,
        }
    }

    fn processing_key(&self) -> String {
        processing_key(self.tier, &self.worker_id)
    }

    /// Move anything this worker left in flight back onto the queue.
    pub async fn recover_in_flight(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let processing = self.processing_key();
        let queue = queue_key(self.tier);
        let mut recovered = 0;
        loop {
            let moved: Option<String> = conn.rpoplpush(&processing, &queue).await?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    /// Get the current queue depth (pending jobs).
    pub async fn queue_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let depth: u64 = conn.llen(queue_key(self.tier)).await?;
        Ok(depth)
    }
}

#[async_trait]
impl WorkQueue for RedisTierQueue {
    fn tier(&self) -> Tier {
        self.tier
    }

    async fn enqueue(&self, envelope: &QueueEnvelope) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(envelope)?;
        conn.lpush::<_, _, ()>(queue_key(self.tier), &payload).await?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        let processing = self.processing_key();
        let result: Option<String> = conn.rpoplpush(queue_key(self.tier), &processing).await?;

        let Some(raw) = result else {
            return Ok(None);
        };

        match serde_json::from_str::<QueueEnvelope>(&raw) {
            Ok(envelope) => Ok(Some(Delivery { envelope, raw })),
            Err(e) => {
                // Unparseable payloads would otherwise sit in flight forever.
                redis::pipe()
                    .atomic()
                    .lpush(dead_letter_key(self.tier), &raw)
                    .ignore()
                    .lrem(&processing, 1, &raw)
                    .ignore()
                    .query_async::<()>(&mut conn)
                    .await?;
                Err(QueueError::Malformed(e))
            }
        }
    }

    async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(self.processing_key(), 1, &delivery.raw)
            .await?;
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(&delivery.envelope.next_attempt())?;
        redis::pipe()
            .atomic()
            .lpush(queue_key(self.tier), &payload)
            .ignore()
            .lrem(self.processing_key(), 1, &delivery.raw)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .lpush(dead_letter_key(self.tier), &delivery.raw)
            .ignore()
            .lrem(self.processing_key(), 1, &delivery.raw)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("malformed queue payload moved to dead letter: {0}")]
    Malformed(serde_json::Error),
}
