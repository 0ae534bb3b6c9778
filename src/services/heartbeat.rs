use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::services::events::{self, Level};

pub fn heartbeat_key(worker_id: &str) -> String {
    format!("image_jobs:worker:{}:heartbeat", worker_id)
}

/// Where liveness beats are written.
#[async_trait]
pub trait HeartbeatStore: Send + Sync {
    async fn beat(&self, worker_id: &str, at: DateTime<Utc>, ttl: Duration) -> Result<(), HeartbeatError>;
}

/// `SET <key> <rfc3339> PX <ttl>`: the key disappears on its own once the
/// worker stops beating.
pub struct RedisHeartbeatStore {
    conn: MultiplexedConnection,
}

impl RedisHeartbeatStore {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl HeartbeatStore for RedisHeartbeatStore {
    async fn beat(&self, worker_id: &str, at: DateTime<Utc>, ttl: Duration) -> Result<(), HeartbeatError> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(heartbeat_key(worker_id))
            .arg(at.to_rfc3339())
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

/// Periodic liveness signal. Failures are logged and never stop the loop.
pub struct HeartbeatMonitor {
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    last_beat: Arc<Mutex<Option<Instant>>>,
}

impl HeartbeatMonitor {
    /// Start beating immediately, then every `interval`.
    pub fn spawn(
        store: Arc<dyn HeartbeatStore>,
        worker_id: &str,
        interval: Duration,
        ttl: Duration,
    ) -> Result<Self, HeartbeatError> {
        if interval.is_zero() {
            return Err(HeartbeatError::InvalidInterval);
        }
        if ttl <= interval {
            return Err(HeartbeatError::TtlTooShort { ttl, interval });
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let last_beat = Arc::new(Mutex::new(None));
        let worker_id = worker_id.to_string();
        let beats = last_beat.clone();
        let started = Instant::now();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => break,
                }
                if *stop_rx.borrow() {
                    break;
                }

                match store.beat(&worker_id, Utc::now(), ttl).await {
                    Ok(()) => {
                        *beats.lock() = Some(Instant::now());
                        events::emit(
                            Level::Info,
                            "worker.heartbeat",
                            json!({
                                "workerId": worker_id,
                                "uptimeMs": started.elapsed().as_millis() as u64,
                                "pid": std::process::id(),
                            }),
                        );
                    }
                    Err(e) => {
                        events::emit(
                            Level::Warn,
                            "worker.heartbeat.failed",
                            json!({ "workerId": worker_id, "error": e.to_string() }),
                        );
                    }
                }
            }
        });

        Ok(Self {
            stop_tx,
            handle: Mutex::new(Some(handle)),
            last_beat,
        })
    }

    /// Time since the last successful beat.
    pub fn last_beat_age(&self) -> Option<Duration> {
        self.last_beat.lock().map(|at| at.elapsed())
    }

    /// Stop beating and wait for the loop to exit. Idempotent.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Heartbeat task ended abnormally");
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("heartbeat interval must be positive")]
    InvalidInterval,

    #[error("heartbeat ttl {ttl:?} must exceed interval {interval:?}")]
    TtlTooShort { ttl: Duration, interval: Duration },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingStore {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl HeartbeatStore for CountingStore {
        async fn beat(&self, _worker_id: &str, _at: DateTime<Utc>, _ttl: Duration) -> Result<(), HeartbeatError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(HeartbeatError::InvalidInterval);
            }
            Ok(())
        }
    }

    fn store(fail: bool) -> Arc<CountingStore> {
        Arc::new(CountingStore {
            calls: AtomicU32::new(0),
            fail,
        })
    }

    #[test]
    fn test_heartbeat_key() {
        assert_eq!(heartbeat_key("w-1"), "image_jobs:worker:w-1:heartbeat");
    }

    #[tokio::test]
    async fn test_ttl_must_exceed_interval() {
        let result = HeartbeatMonitor::spawn(
            store(false),
            "w",
            Duration::from_millis(100),
            Duration::from_millis(100),
        );
        assert!(matches!(result, Err(HeartbeatError::TtlTooShort { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_beats_until_stopped() {
        let counting = store(false);
        let monitor = HeartbeatMonitor::spawn(
            counting.clone(),
            "w",
            Duration::from_millis(100),
            Duration::from_millis(300),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        monitor.stop().await;
        let after_stop = counting.calls.load(Ordering::SeqCst);
        assert!(after_stop >= 2);
        assert!(monitor.last_beat_age().is_some());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(counting.calls.load(Ordering::SeqCst), after_stop);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_beats_are_logged_at_info() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let monitor = HeartbeatMonitor::spawn(
            store(false),
            "w-info",
            Duration::from_millis(100),
            Duration::from_millis(300),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.stop().await;

        let output = String::from_utf8(logs.0.lock().clone()).unwrap();
        let beat = output
            .lines()
            .find(|line| line.contains("worker.heartbeat"))
            .expect("heartbeat should be logged at the default level");
        assert!(beat.contains("INFO"));
        assert!(beat.contains("w-info"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_the_loop() {
        let failing = store(true);
        let monitor = HeartbeatMonitor::spawn(
            failing.clone(),
            "w",
            Duration::from_millis(100),
            Duration::from_millis(300),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;
        monitor.stop().await;
        assert!(failing.calls.load(Ordering::SeqCst) >= 3);
        assert!(monitor.last_beat_age().is_none());
    }
}
