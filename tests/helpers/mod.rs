//! In-memory doubles for the worker's external dependencies.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use image_job_worker::db::{JobRepository, RepositoryError};
use image_job_worker::models::audit::DeletionAuditRecord;
use image_job_worker::models::job::{ImageJob, JobStatus, JobUpdate, QueuedJob, Tier};
use image_job_worker::services::bg_removal::{
    BackgroundRemover, BgRemovalError, ProviderResponse, ProviderTransport, RemovedBackground,
};
use image_job_worker::services::processor::JobProcessor;
use image_job_worker::services::queue::{Delivery, QueueEnvelope, QueueError, WorkQueue};
use image_job_worker::services::storage::{ObjectStore, PutObject, StorageError, StoredObject};

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    pub fail_deletes: AtomicBool,
}

impl MemoryObjectStore {
    pub fn insert(&self, key: &str, bytes: Vec<u8>, content_type: &str) {
        self.objects.lock().insert(
            key.to_string(),
            StoredObject {
                bytes: Bytes::from(bytes),
                content_type: Some(content_type.to_string()),
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().contains_key(key)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get_object_buffer(&self, key: &str) -> Result<StoredObject, StorageError> {
        self.get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put_object_buffer(&self, object: PutObject) -> Result<(), StorageError> {
        self.objects.lock().insert(
            object.key,
            StoredObject {
                bytes: object.bytes,
                content_type: Some(object.content_type),
            },
        );
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Status {
                key: key.to_string(),
                code: 503,
            });
        }
        self.objects.lock().remove(key);
        Ok(())
    }
}

/// Applies updates with the same existence and terminal guards as the real
/// backends, and keeps the history of applied statuses.
#[derive(Default)]
pub struct MemoryJobRepository {
    jobs: Mutex<HashMap<Uuid, ImageJob>>,
    audits: Mutex<Vec<DeletionAuditRecord>>,
    history: Mutex<Vec<(Uuid, JobStatus)>>,
    pub fail_updates: AtomicBool,
}

impl MemoryJobRepository {
    pub fn insert(&self, job: ImageJob) {
        self.jobs.lock().insert(job.id, job);
    }

    pub fn job(&self, id: Uuid) -> Option<ImageJob> {
        self.jobs.lock().get(&id).cloned()
    }

    pub fn audits(&self) -> Vec<DeletionAuditRecord> {
        self.audits.lock().clone()
    }

    pub fn history(&self, id: Uuid) -> Vec<JobStatus> {
        self.history
            .lock()
            .iter()
            .filter(|(job_id, _)| *job_id == id)
            .map(|(_, status)| *status)
            .collect()
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn get_job(&self, id: Uuid) -> Result<Option<ImageJob>, RepositoryError> {
        Ok(self.job(id))
    }

    async fn update_job_status(
        &self,
        update: &JobUpdate,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(RepositoryError::Closed);
        }
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.get_mut(&update.id) else {
            return Ok(false);
        };
        if job.status.is_terminal() {
            return Ok(false);
        }
        job.apply(update, updated_at);
        self.history.lock().push((update.id, update.status()));
        Ok(true)
    }

    async fn append_deletion_audit(&self, record: &DeletionAuditRecord) -> Result<(), RepositoryError> {
        self.audits.lock().push(record.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

/// Remover that returns a fixed result without any network.
pub struct StubRemover {
    result: Result<Vec<u8>, fn() -> BgRemovalError>,
    pub calls: AtomicU32,
}

impl StubRemover {
    pub fn returning(bytes: Vec<u8>) -> Self {
        Self {
            result: Ok(bytes),
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing(error: fn() -> BgRemovalError) -> Self {
        Self {
            result: Err(error),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackgroundRemover for StubRemover {
    async fn remove_background(
        &self,
        _image: Bytes,
        _content_type: &str,
    ) -> Result<RemovedBackground, BgRemovalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.result {
            Ok(bytes) => Ok(RemovedBackground {
                bytes: Bytes::from(bytes.clone()),
                content_type: "image/png".to_string(),
            }),
            Err(error) => Err(error()),
        }
    }
}

/// Transport that replays a fixed sequence of provider answers.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<ProviderResponse, BgRemovalError>>>,
    pub calls: AtomicU32,
}

impl ScriptedTransport {
    /// One response per call, by status code. 2xx answers carry a PNG body.
    pub fn statuses(statuses: &[u16]) -> Self {
        let script = statuses
            .iter()
            .map(|&status| {
                Ok(ProviderResponse {
                    status,
                    content_type: Some("image/png".to_string()),
                    body: if (200..300).contains(&status) {
                        Bytes::from_static(b"\x89PNG cutout")
                    } else {
                        Bytes::new()
                    },
                })
            })
            .collect();
        Self {
            script: Mutex::new(script),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderTransport for ScriptedTransport {
    async fn send(&self, _image: Bytes, _content_type: &str) -> Result<ProviderResponse, BgRemovalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .pop_front()
            .unwrap_or(Err(BgRemovalError::Transport("script exhausted".to_string())))
    }
}

/// Single-tier queue held in memory.
pub struct MemoryQueue {
    tier: Tier,
    pending: Mutex<VecDeque<QueueEnvelope>>,
    pub completed: Mutex<Vec<QueueEnvelope>>,
    pub requeued: Mutex<Vec<QueueEnvelope>>,
    pub dead: Mutex<Vec<QueueEnvelope>>,
}

impl MemoryQueue {
    pub fn new(tier: Tier) -> Self {
        Self {
            tier,
            pending: Mutex::new(VecDeque::new()),
            completed: Mutex::new(Vec::new()),
            requeued: Mutex::new(Vec::new()),
            dead: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, job: QueuedJob) {
        self.pending.lock().push_back(QueueEnvelope::new(job));
    }

    pub fn settled(&self) -> usize {
        self.completed.lock().len() + self.dead.lock().len()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    fn tier(&self) -> Tier {
        self.tier
    }

    async fn enqueue(&self, envelope: &QueueEnvelope) -> Result<(), QueueError> {
        self.pending.lock().push_back(envelope.clone());
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let next = self.pending.lock().pop_front();
        match next {
            Some(envelope) => {
                let raw = serde_json::to_string(&envelope)?;
                Ok(Some(Delivery { envelope, raw }))
            }
            None => Ok(None),
        }
    }

    async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.completed.lock().push(delivery.envelope.clone());
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let next = delivery.envelope.next_attempt();
        self.requeued.lock().push(next.clone());
        self.pending.lock().push_back(next);
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.dead.lock().push(delivery.envelope.clone());
        Ok(())
    }
}

/// Processor wired to in-memory doubles.
pub struct Harness {
    pub store: Arc<MemoryObjectStore>,
    pub jobs: Arc<MemoryJobRepository>,
    pub remover: Arc<StubRemover>,
    pub processor: JobProcessor,
}

impl Harness {
    pub fn new(remover: StubRemover) -> Self {
        let store = Arc::new(MemoryObjectStore::default());
        let jobs = Arc::new(MemoryJobRepository::default());
        let remover = Arc::new(remover);
        let processor = JobProcessor::new(store.clone(), jobs.clone(), remover.clone());
        Self {
            store,
            jobs,
            remover,
            processor,
        }
    }

    /// Store the input and the queued record for `job`.
    pub fn admit(&self, job: &QueuedJob, input: Vec<u8>) {
        self.store.insert(&job.input_object_key, input, &job.input_mime);
        self.jobs.insert(ImageJob::queued(job, Utc::now()));
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until<F: Fn() -> bool>(check: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
