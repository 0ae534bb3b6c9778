use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use crate::config::AppConfig;
use crate::services::events::{self, Level};
use crate::services::resilience::{Admission, BreakerConfig, CircuitBreaker, RetryPolicy};

/// Raw provider answer before classification.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// One HTTP exchange with the provider. Kept thin so retry and breaker
/// composition can be exercised against a scripted transport.
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    async fn send(&self, image: Bytes, content_type: &str) -> Result<ProviderResponse, BgRemovalError>;
}

/// reqwest-backed transport. Each request is bounded by an abortable timeout.
pub struct ReqwestTransport {
    http: Client,
    url: String,
    api_key: String,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(url: &str, api_key: &str, timeout: Duration) -> Result<Self, BgRemovalError> {
        let http = Client::builder().build()?;
        Ok(Self {
            http,
            url: url.to_string(),
            api_key: api_key.to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl ProviderTransport for ReqwestTransport {
    async fn send(&self, image: Bytes, content_type: &str) -> Result<ProviderResponse, BgRemovalError> {
        let exchange = async {
            let response = self
                .http
                .post(&self.url)
                .header(CONTENT_TYPE, content_type)
                .header("X-Api-Key", &self.api_key)
                .body(image)
                .send()
                .await?;

            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.bytes().await?;

            Ok::<_, reqwest::Error>(ProviderResponse {
                status,
                content_type,
                body,
            })
        };

        // Dropping the future on timeout aborts the in-flight request.
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) if e.is_timeout() => Err(BgRemovalError::Timeout(self.timeout)),
            Ok(Err(e)) => Err(BgRemovalError::Transport(e.without_url().to_string())),
            Err(_) => Err(BgRemovalError::Timeout(self.timeout)),
        }
    }
}

/// Image with its background removed, as returned by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedBackground {
    pub bytes: Bytes,
    pub content_type: String,
}

#[async_trait]
pub trait BackgroundRemover: Send + Sync {
    async fn remove_background(
        &self,
        image: Bytes,
        content_type: &str,
    ) -> Result<RemovedBackground, BgRemovalError>;
}

/// Observable retry notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEvent {
    pub attempt: u32,
    pub max_retries: u32,
    pub reason: String,
}

pub type RetryObserver = Arc<dyn Fn(&RetryEvent) + Send + Sync>;

/// Resilient wrapper around the provider: circuit breaker per attempt,
/// bounded exponential retries around that.
pub struct BackgroundRemovalClient {
    transport: Arc<dyn ProviderTransport>,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    observer: Option<RetryObserver>,
}

impl BackgroundRemovalClient {
    pub fn new(
        transport: Arc<dyn ProviderTransport>,
        retry: RetryPolicy,
        breaker: BreakerConfig,
    ) -> Self {
        Self {
            transport,
            retry,
            breaker: CircuitBreaker::new(breaker),
            observer: None,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, BgRemovalError> {
        let transport = ReqwestTransport::new(
            &config.bg_removal_url,
            &config.bg_removal_api_key,
            Duration::from_millis(config.bg_removal_timeout_ms),
        )?;
        let retry = RetryPolicy {
            max_retries: config.bg_removal_max_retries,
            base_delay: Duration::from_millis(config.bg_removal_backoff_base_ms),
            max_delay: Duration::from_millis(config.bg_removal_backoff_max_ms),
        };
        let breaker = BreakerConfig {
            error_threshold_percent: config.breaker_error_threshold_percent,
            volume_threshold: config.breaker_volume_threshold,
            rolling_window: Duration::from_millis(config.breaker_rolling_window_ms),
            reset_timeout: Duration::from_millis(config.breaker_reset_timeout_ms),
            call_timeout: Duration::from_millis(config.breaker_call_timeout_ms),
        };
        Ok(Self::new(Arc::new(transport), retry, breaker))
    }

    pub fn with_retry_observer(mut self, observer: RetryObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// One breaker-guarded attempt.
    async fn attempt(&self, image: Bytes, content_type: &str) -> Result<RemovedBackground, BgRemovalError> {
        let permit = match self.breaker.try_acquire(Instant::now()) {
            Admission::Rejected => return Err(BgRemovalError::CircuitOpen),
            Admission::Probe {
                permit,
                transitioned,
            } => {
                if transitioned {
                    events::emit(
                        Level::Warn,
                        "worker.bg_remove_breaker.halfOpen",
                        json!({ "state": "half_open" }),
                    );
                }
                permit
            }
            Admission::Allowed(permit) => permit,
        };

        // The transport's own request timeout normally fires first; this
        // bound also covers a transport that never yields.
        let call_timeout = self.breaker.call_timeout();
        let sent = tokio::time::timeout(call_timeout, self.transport.send(image, content_type)).await;
        let result = match sent {
            Ok(sent) => sent.and_then(classify_response),
            Err(_) => Err(BgRemovalError::Timeout(call_timeout)),
        };

        let healthy = match &result {
            Ok(_) => true,
            Err(e) => !e.counts_against_breaker(),
        };
        if let Some(state) = permit.record(healthy, Instant::now()) {
            let level = if healthy { Level::Info } else { Level::Warn };
            events::emit(level, state.event_name(), json!({ "state": format!("{:?}", state) }));
        }

        result
    }

    fn notify_retry(&self, event: &RetryEvent) {
        metrics::counter!("bg_remove_retries_total").increment(1);
        events::emit(
            Level::Warn,
            "worker.bg_remove.retry",
            json!({
                "attempt": event.attempt,
                "maxRetries": event.max_retries,
                "reason": event.reason,
            }),
        );
        if let Some(observer) = &self.observer {
            observer(event);
        }
    }
}

#[async_trait]
impl BackgroundRemover for BackgroundRemovalClient {
    async fn remove_background(
        &self,
        image: Bytes,
        content_type: &str,
    ) -> Result<RemovedBackground, BgRemovalError> {
        let mut attempt: u32 = 1;
        loop {
            let err = match self.attempt(image.clone(), content_type).await {
                Ok(removed) => return Ok(removed),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err);
            }
            if !self.retry.should_retry(&err, attempt) {
                return Err(BgRemovalError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            self.notify_retry(&RetryEvent {
                attempt,
                max_retries: self.retry.max_retries,
                reason: err.to_string(),
            });
            sleep(self.retry.next_delay(attempt)).await;
            attempt += 1;
        }
    }
}

/// Map a raw provider response onto success or a classified error.
pub fn classify_response(response: ProviderResponse) -> Result<RemovedBackground, BgRemovalError> {
    match response.status {
        200..=299 => {
            let content_type = match response.content_type {
                Some(ct) if is_well_formed_mime(&ct) => ct,
                other => return Err(BgRemovalError::InvalidContentType(other)),
            };
            if response.body.is_empty() {
                return Err(BgRemovalError::EmptyBody);
            }
            Ok(RemovedBackground {
                bytes: response.body,
                content_type,
            })
        }
        429 | 500..=599 => Err(BgRemovalError::RetryableStatus {
            status: response.status,
        }),
        status => Err(BgRemovalError::NonRetryable { status }),
    }
}

/// `type/subtype` with RFC 6838 token characters, parameters allowed.
pub fn is_well_formed_mime(value: &str) -> bool {
    let essence = value.split(';').next().unwrap_or_default().trim();
    let mut parts = essence.split('/');
    let (Some(kind), Some(subtype), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    let token = |s: &str| {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || "!#$&-^_.+".contains(c))
    };
    token(kind) && token(subtype)
}

#[derive(Debug, thiserror::Error)]
pub enum BgRemovalError {
    #[error("provider returned retryable status {status}")]
    RetryableStatus { status: u16 },

    #[error("provider rejected request with status {status}")]
    NonRetryable { status: u16 },

    #[error("provider request timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider transport failure: {0}")]
    Transport(String),

    #[error("provider returned invalid content type {0:?}")]
    InvalidContentType(Option<String>),

    #[error("provider returned an empty body")]
    EmptyBody,

    #[error("background removal failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<BgRemovalError>,
    },

    #[error("background removal circuit is open")]
    CircuitOpen,
}

impl BgRemovalError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BgRemovalError::RetryableStatus { .. }
                | BgRemovalError::Timeout(_)
                | BgRemovalError::Transport(_)
        )
    }

    /// Client-side rejections (4xx) mean the provider is up and answering.
    fn counts_against_breaker(&self) -> bool {
        self.is_retryable()
            || matches!(
                self,
                BgRemovalError::InvalidContentType(_) | BgRemovalError::EmptyBody
            )
    }
}

impl From<reqwest::Error> for BgRemovalError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BgRemovalError::Timeout(Duration::ZERO)
        } else {
            BgRemovalError::Transport(e.without_url().to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, content_type: Option<&str>, body: &'static [u8]) -> ProviderResponse {
        ProviderResponse {
            status,
            content_type: content_type.map(str::to_string),
            body: Bytes::from_static(body),
        }
    }

    #[test]
    fn test_mime_validation() {
        assert!(is_well_formed_mime("image/png"));
        assert!(is_well_formed_mime("image/svg+xml; charset=utf-8"));
        assert!(!is_well_formed_mime(""));
        assert!(!is_well_formed_mime("image"));
        assert!(!is_well_formed_mime("image/"));
        assert!(!is_well_formed_mime("/png"));
        assert!(!is_well_formed_mime("image/png/extra"));
        assert!(!is_well_formed_mime("image/p ng"));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_response(response(429, None, b"")),
            Err(BgRemovalError::RetryableStatus { status: 429 })
        ));
        assert!(matches!(
            classify_response(response(503, None, b"")),
            Err(BgRemovalError::RetryableStatus { status: 503 })
        ));
        assert!(matches!(
            classify_response(response(404, None, b"")),
            Err(BgRemovalError::NonRetryable { status: 404 })
        ));
    }

    #[test]
    fn test_success_requires_mime_and_body() {
        assert!(matches!(
            classify_response(response(200, None, b"png")),
            Err(BgRemovalError::InvalidContentType(None))
        ));
        assert!(matches!(
            classify_response(response(200, Some("garbage"), b"png")),
            Err(BgRemovalError::InvalidContentType(Some(_)))
        ));
        assert!(matches!(
            classify_response(response(200, Some("image/png"), b"")),
            Err(BgRemovalError::EmptyBody)
        ));
        let ok = classify_response(response(200, Some("image/png"), b"png")).unwrap();
        assert_eq!(ok.content_type, "image/png");
    }

    #[test]
    fn test_breaker_accounting() {
        assert!(!BgRemovalError::NonRetryable { status: 400 }.counts_against_breaker());
        assert!(BgRemovalError::RetryableStatus { status: 500 }.counts_against_breaker());
        assert!(BgRemovalError::EmptyBody.counts_against_breaker());
    }
}
