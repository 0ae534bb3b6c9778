//! Ordered, time-bounded teardown.

use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::services::events::{self, Level};

/// What started the shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownTrigger {
    Interrupt,
    Terminate,
    /// An unrecoverable error reported by a running component.
    Fatal(String),
}

impl ShutdownTrigger {
    fn reason(&self) -> String {
        match self {
            ShutdownTrigger::Interrupt => "SIGINT".to_string(),
            ShutdownTrigger::Terminate => "SIGTERM".to_string(),
            ShutdownTrigger::Fatal(message) => format!("fatal: {}", message),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("shutdown step '{step}' timed out")]
    Timeout { step: String },

    #[error("shutdown step '{step}' failed: {reason}")]
    Failed { step: String, reason: String },
}

/// Wait for SIGINT, SIGTERM or a message on `fatal`.
pub async fn wait_for_trigger(fatal: &mut mpsc::Receiver<String>) -> ShutdownTrigger {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let fatal = async {
        match fatal.recv().await {
            Some(message) => message,
            // All reporters gone; only signals can end the process now.
            None => std::future::pending::<String>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
            ShutdownTrigger::Interrupt
        },
        _ = terminate => {
            tracing::info!("Received terminate signal");
            ShutdownTrigger::Terminate
        },
        message = fatal => ShutdownTrigger::Fatal(message),
    }
}

type StepFuture = Pin<Box<dyn Future<Output = Result<(), ShutdownError>> + Send>>;

/// Teardown steps run strictly in registration order, each under its own
/// deadline. A failed step does not prevent later ones from running.
pub struct ShutdownCoordinator {
    step_timeout: Duration,
    steps: Vec<(&'static str, StepFuture)>,
}

/// Result of a shutdown run.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub failures: Vec<ShutdownError>,
}

impl ShutdownReport {
    /// 0 whenever every step finished in time, whatever triggered the shutdown.
    pub fn exit_code(&self) -> i32 {
        if self.failures.is_empty() {
            0
        } else {
            1
        }
    }
}

impl ShutdownCoordinator {
    pub fn new(step_timeout: Duration) -> Self {
        Self {
            step_timeout,
            steps: Vec::new(),
        }
    }

    pub fn step<F>(mut self, name: &'static str, step: F) -> Self
    where
        F: Future<Output = Result<(), ShutdownError>> + Send + 'static,
    {
        self.steps.push((name, Box::pin(step)));
        self
    }

    pub async fn run(self, trigger: &ShutdownTrigger) -> ShutdownReport {
        events::emit(
            Level::Info,
            "worker.shutdown.start",
            json!({ "reason": trigger.reason(), "steps": self.steps.len() }),
        );

        let mut report = ShutdownReport::default();

        for (name, step) in self.steps {
            match tokio::time::timeout(self.step_timeout, step).await {
                Ok(Ok(())) => tracing::debug!(step = name, "Shutdown step complete"),
                Ok(Err(e)) => report.failures.push(e),
                Err(_) => report.failures.push(ShutdownError::Timeout {
                    step: name.to_string(),
                }),
            }
        }

        if report.failures.is_empty() {
            events::emit(
                Level::Info,
                "worker.shutdown.complete",
                json!({ "exitCode": report.exit_code() }),
            );
        } else {
            let failures: Vec<String> = report.failures.iter().map(|e| e.to_string()).collect();
            events::emit(
                Level::Error,
                "worker.shutdown.forced",
                json!({ "failures": failures, "exitCode": report.exit_code() }),
            );
        }

        report
    }
}
