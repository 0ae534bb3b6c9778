use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::services::queue::WorkQueue;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub redis: ComponentHealth,
    pub heartbeat: HeartbeatHealth,
    pub queues: Vec<QueueDepth>,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct HeartbeatHealth {
    pub status: String,
    pub age_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct QueueDepth {
    pub tier: String,
    pub depth: Option<u64>,
}

/// GET /health: Redis reachability, heartbeat freshness and queue depths.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let redis_start = std::time::Instant::now();
    let ping = match state.queues.first() {
        Some(queue) => queue.health_check().await.is_ok(),
        None => false,
    };
    let redis_check = if ping {
        ComponentHealth {
            status: "ok".to_string(),
            latency_ms: Some(redis_start.elapsed().as_millis() as u64),
        }
    } else {
        ComponentHealth {
            status: "error".to_string(),
            latency_ms: None,
        }
    };

    // A beat older than the TTL means the key has already expired in Redis.
    let age = state.heartbeat.last_beat_age();
    let heartbeat_check = HeartbeatHealth {
        status: match age {
            Some(age) if age < state.heartbeat_ttl => "ok".to_string(),
            _ => "stale".to_string(),
        },
        age_ms: age.map(|a| a.as_millis() as u64),
    };

    let mut queues = Vec::with_capacity(state.queues.len());
    for queue in state.queues.iter() {
        let depth = queue.queue_depth().await.ok();
        if let Some(depth) = depth {
            metrics::gauge!("image_jobs_queue_depth", "tier" => queue.tier().to_string()).set(depth as f64);
        }
        queues.push(QueueDepth {
            tier: queue.tier().to_string(),
            depth,
        });
    }

    let all_healthy = redis_check.status == "ok" && heartbeat_check.status == "ok";
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            redis: redis_check,
            heartbeat: heartbeat_check,
            queues,
        },
    };

    (status_code, Json(response))
}
