use crate::builder::{Builder, CompletionRegistry};
use crate::crds::ValidationError;
use crate::resources::remote::RegistryError;
use crate::resources::EntrypointResolver;
use crate::tasks::config::ControllerConfig;
use kube::Client;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid build: {0}")]
    ValidationError(#[from] ValidationError),

    #[error("Image registry error: {0}")]
    RegistryError(#[from] RegistryError),

    #[error("Entrypoint options error: {0}")]
    EntrypointError(#[from] build_entrypoint::EntrypointError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Missing object key")]
    MissingObjectKey,

    #[error("another process is already waiting on {0}")]
    AlreadyWaiting(String),

    #[error("Builder {0} is not supported by this controller")]
    UnsupportedBuilder(String),

    #[error("Completion notifier for {0} was dropped before the pod finished")]
    WaiterDropped(String),

    #[error("{kind} {name} not found")]
    TemplateNotFound { kind: String, name: String },
}

impl Error {
    /// Errors caused by the build itself rather than by the control plane
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Error::ValidationError(_) | Error::RegistryError(_) | Error::TemplateNotFound { .. }
        )
    }

    /// The API server reported the object as missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(ae)) if ae.code == 404)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Shared state handed to every reconciliation
pub struct Context {
    pub client: Client,
    pub config: Arc<ControllerConfig>,
    pub builder: Arc<dyn Builder>,
    pub registry: Arc<CompletionRegistry>,
    pub resolver: Arc<EntrypointResolver>,
    pub backoff: ErrorBackoff,
}

const BACKOFF_STEP: Duration = Duration::from_secs(5);
const BACKOFF_MAX: Duration = Duration::from_secs(5 * 60);

/// Entries idle for this long belong to builds that stopped failing or are gone
const BACKOFF_IDLE: Duration = Duration::from_secs(10 * 60);

/// Per-build count of consecutive reconcile failures
#[derive(Debug, Default)]
pub struct ErrorBackoff {
    attempts: Mutex<HashMap<String, (u32, Instant)>>,
}

impl ErrorBackoff {
    /// Record a failure for `key` and return how long to wait before retrying
    pub fn next_delay(&self, key: &str) -> Duration {
        self.record_failure(key, Instant::now())
    }

    fn record_failure(&self, key: &str, now: Instant) -> Duration {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        attempts.retain(|_, (_, last)| now.saturating_duration_since(*last) < BACKOFF_IDLE);

        let (attempt, last) = attempts.entry(key.to_string()).or_insert((0, now));
        *attempt = attempt.saturating_add(1);
        *last = now;
        BACKOFF_STEP.saturating_mul(*attempt).min(BACKOFF_MAX)
    }

    pub fn reset(&self, key: &str) {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}
