use crate::tasks::types::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info};

/// Identifies a build pod
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Terminal outcome of a build pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Succeeded,
    Failed(String),
}

/// One-shot completion callbacks keyed by pod.
///
/// A notification for a key nobody waits on is dropped, not buffered.
#[derive(Debug, Default)]
pub struct CompletionRegistry {
    waiters: Mutex<HashMap<PodKey, oneshot::Sender<Completion>>>,
}

impl CompletionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the single waiter for `key`.
    ///
    /// Fails while another live waiter is registered; an entry whose receiver
    /// has been dropped is replaced.
    pub async fn register(&self, key: PodKey) -> Result<oneshot::Receiver<Completion>> {
        let mut waiters = self.waiters.lock().await;
        if let Some(existing) = waiters.get(&key) {
            if !existing.is_closed() {
                return Err(Error::AlreadyWaiting(key.to_string()));
            }
            debug!("Replacing abandoned waiter for {}", key);
        }

        let (sender, receiver) = oneshot::channel();
        waiters.insert(key, sender);
        Ok(receiver)
    }

    /// Deliver `completion` to the waiter of `key`, removing the entry.
    ///
    /// Returns whether a waiter received it.
    pub async fn complete(&self, key: &PodKey, completion: Completion) -> bool {
        let sender = self.waiters.lock().await.remove(key);
        match sender {
            Some(sender) => {
                if sender.send(completion).is_err() {
                    debug!("Waiter for {} went away before completion", key);
                    return false;
                }
                true
            }
            None => {
                info!("No waiter registered for pod {}, dropping completion", key);
                false
            }
        }
    }

    /// Remove the registration for `key` without notifying it
    pub async fn unregister(&self, key: &PodKey) {
        self.waiters.lock().await.remove(key);
    }

    pub async fn is_waiting(&self, key: &PodKey) -> bool {
        self.waiters
            .lock()
            .await
            .get(key)
            .is_some_and(|sender| !sender.is_closed())
    }
}
