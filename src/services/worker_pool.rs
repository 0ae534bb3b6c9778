//! Per-tier dispatchers. Each tier pulls from its own queue and is bounded by
//! its own semaphore, so a backlog in one tier cannot starve another.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, Instant};

use crate::config::{ConfigError, TierConcurrency};
use crate::models::job::{QueuedJob, Tier};
use crate::services::events::{self, Level};
use crate::services::processor::{JobFailure, JobOutcome, JobProcessor};
use crate::services::queue::{Delivery, WorkQueue};
use crate::services::shutdown::ShutdownError;

/// Runs one delivered job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &QueuedJob) -> Result<JobOutcome, JobFailure>;
}

#[async_trait]
impl JobHandler for JobProcessor {
    async fn handle(&self, job: &QueuedJob) -> Result<JobOutcome, JobFailure> {
        self.process_job(job).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub concurrency: TierConcurrency,
    pub poll_interval: Duration,
    pub max_delivery_attempts: u32,
}

/// What happens to a delivery whose job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redelivery {
    Requeue,
    DeadLetter,
}

/// A failure already persisted on the record is final. Otherwise the job
/// gets another delivery until the attempt budget runs out.
pub fn redelivery(status_persisted: bool, attempt: u32, max_delivery_attempts: u32) -> Redelivery {
    if status_persisted || attempt >= max_delivery_attempts {
        Redelivery::DeadLetter
    } else {
        Redelivery::Requeue
    }
}

fn tier_size(concurrency: &TierConcurrency, tier: Tier) -> usize {
    match tier {
        Tier::Fast => concurrency.fast,
        Tier::Slow => concurrency.slow,
        Tier::Bulk => concurrency.bulk,
    }
}

pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    dispatchers: Mutex<Vec<(Tier, JoinHandle<()>)>>,
}

impl WorkerPool {
    /// Validate tier sizing and spawn one dispatcher per tier.
    pub fn start(
        queues: Vec<Arc<dyn WorkQueue>>,
        handler: Arc<dyn JobHandler>,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        config.concurrency.validate()?;

        let mut seen = HashSet::new();
        for queue in &queues {
            if !seen.insert(queue.tier()) {
                return Err(PoolError::DuplicateTier(queue.tier()));
            }
        }
        if let Some(missing) = Tier::ALL.into_iter().find(|t| !seen.contains(t)) {
            return Err(PoolError::MissingTier(missing));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatchers = queues
            .into_iter()
            .map(|queue| {
                let tier = queue.tier();
                let dispatcher = Dispatcher {
                    tier,
                    queue,
                    handler: handler.clone(),
                    permits: Arc::new(Semaphore::new(tier_size(&config.concurrency, tier))),
                    poll_interval: config.poll_interval,
                    max_delivery_attempts: config.max_delivery_attempts,
                };
                tracing::info!(
                    tier = %tier,
                    concurrency = tier_size(&config.concurrency, tier),
                    "Starting tier dispatcher"
                );
                (tier, tokio::spawn(dispatcher.run(shutdown_rx.clone())))
            })
            .collect();

        Ok(Self {
            shutdown_tx,
            dispatchers: Mutex::new(dispatchers),
        })
    }

    /// Stop pulling new work and wait up to `grace` for in-flight jobs.
    /// Tiers still busy at the deadline are aborted.
    pub async fn close(&self, grace: Duration) -> Result<(), ShutdownError> {
        let _ = self.shutdown_tx.send(true);
        let dispatchers = std::mem::take(&mut *self.dispatchers.lock());
        let deadline = Instant::now() + grace;

        let mut overran = Vec::new();
        for (tier, mut handle) in dispatchers {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {
                    events::emit(Level::Info, "worker.shutdown.tier_closed", json!({ "tier": tier }));
                }
                Ok(Err(e)) => {
                    tracing::error!(tier = %tier, error = %e, "Tier dispatcher ended abnormally");
                    overran.push(tier);
                }
                Err(_) => {
                    handle.abort();
                    overran.push(tier);
                }
            }
        }

        if overran.is_empty() {
            Ok(())
        } else {
            Err(ShutdownError::Timeout {
                step: format!(
                    "close tiers {}",
                    overran.iter().map(Tier::to_string).collect::<Vec<_>>().join(",")
                ),
            })
        }
    }
}

struct Dispatcher {
    tier: Tier,
    queue: Arc<dyn WorkQueue>,
    handler: Arc<dyn JobHandler>,
    permits: Arc<Semaphore>,
    poll_interval: Duration,
    max_delivery_attempts: u32,
}

impl Dispatcher {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut in_flight = JoinSet::new();
        let this = Arc::new(self);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = this.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            while let Some(result) = in_flight.try_join_next() {
                this.reap(result);
            }

            let delivery = match this.queue.dequeue().await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = sleep(this.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(tier = %this.tier, error = %e, "Failed to dequeue job");
                    tokio::select! {
                        _ = sleep(this.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            };

            let worker = this.clone();
            in_flight.spawn(async move {
                let gauge = metrics::gauge!("worker_inflight_jobs", "tier" => worker.tier.to_string());
                gauge.increment(1.0);
                let result = worker.handler.handle(&delivery.envelope.job).await;
                worker.settle(&delivery, result).await;
                gauge.decrement(1.0);
                drop(permit);
            });
        }

        // Drain: no new pulls, in-flight jobs run to completion.
        while let Some(result) = in_flight.join_next().await {
            this.reap(result);
        }
    }

    fn reap(&self, result: Result<(), tokio::task::JoinError>) {
        if let Err(e) = result {
            tracing::error!(tier = %self.tier, error = %e, "Job task panicked");
        }
    }

    /// Acknowledge, requeue or dead-letter a finished delivery.
    async fn settle(&self, delivery: &Delivery, result: Result<JobOutcome, JobFailure>) {
        let job_id = delivery.envelope.job.id;
        let attempt = delivery.envelope.attempt;

        let settled = match result {
            Ok(_) => self.queue.complete(delivery).await,
            Err(failure) => {
                match redelivery(failure.status_persisted, attempt, self.max_delivery_attempts) {
                    Redelivery::Requeue => {
                        events::emit(
                            Level::Warn,
                            "worker.job.requeued",
                            json!({ "jobId": job_id, "tier": self.tier, "attempt": attempt, "code": failure.classification.code }),
                        );
                        self.queue.requeue(delivery).await
                    }
                    Redelivery::DeadLetter => {
                        events::emit(
                            Level::Warn,
                            "worker.job.dead_lettered",
                            json!({ "jobId": job_id, "tier": self.tier, "attempt": attempt, "code": failure.classification.code }),
                        );
                        self.queue.dead_letter(delivery).await
                    }
                }
            }
        };

        if let Err(e) = settled {
            tracing::error!(job_id = %job_id, tier = %self.tier, error = %e, "Failed to settle queue delivery");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no queue configured for tier {0}")]
    MissingTier(Tier),

    #[error("more than one queue configured for tier {0}")]
    DuplicateTier(Tier),
}
