use std::sync::Arc;
use std::time::Duration;

use crate::services::{heartbeat::HeartbeatMonitor, queue::RedisTierQueue};

/// Shared state for the operational HTTP routes.
#[derive(Clone)]
pub struct AppState {
    pub queues: Arc<Vec<Arc<RedisTierQueue>>>,
    pub heartbeat: Arc<HeartbeatMonitor>,
    pub heartbeat_ttl: Duration,
}

impl AppState {
    pub fn new(
        queues: Vec<Arc<RedisTierQueue>>,
        heartbeat: Arc<HeartbeatMonitor>,
        heartbeat_ttl: Duration,
    ) -> Self {
        Self {
            queues: Arc::new(queues),
            heartbeat,
            heartbeat_ttl,
        }
    }
}
