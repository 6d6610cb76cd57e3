//! Scoped progress notifications
//!
//! Publishers emit staged progress and terminal errors for a scope id
//! (usually the caller's session id). Every current subscriber of that scope
//! receives the event; publishing with nobody listening is a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

pub type ProgressReceiver = broadcast::Receiver<ProgressEvent>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Progress {
        scope_id: String,
        /// 0.0 - 100.0
        percentage: f64,
        stage: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    Error {
        scope_id: String,
        message: String,
        details: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    pub fn scope_id(&self) -> &str {
        match self {
            ProgressEvent::Progress { scope_id, .. } | ProgressEvent::Error { scope_id, .. } => {
                scope_id
            }
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ProgressEvent::Progress { timestamp, .. } | ProgressEvent::Error { timestamp, .. } => {
                *timestamp
            }
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ProgressEvent::Error { .. })
    }

    pub fn percentage(&self) -> Option<f64> {
        match self {
            ProgressEvent::Progress { percentage, .. } => Some(*percentage),
            ProgressEvent::Error { .. } => None,
        }
    }
}

#[derive(Default)]
struct Scopes {
    senders: HashMap<String, broadcast::Sender<ProgressEvent>>,
    latest: HashMap<String, ProgressEvent>,
}

/// Cloneable handle to a set of per-scope broadcast channels
#[derive(Clone)]
pub struct ProgressReporter {
    scopes: Arc<RwLock<Scopes>>,
    capacity: usize,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ProgressReporter {
    /// `capacity` bounds how many events a slow subscriber may lag behind
    /// before it starts missing the oldest ones.
    pub fn new(capacity: usize) -> Self {
        Self {
            scopes: Arc::new(RwLock::new(Scopes::default())),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, scope_id: &str) -> ProgressReceiver {
        let mut scopes = self.scopes.write().unwrap_or_else(|e| e.into_inner());
        scopes
            .senders
            .entry(scope_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn emit_progress(
        &self,
        scope_id: &str,
        percentage: f64,
        stage: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.publish(ProgressEvent::Progress {
            scope_id: scope_id.to_string(),
            percentage,
            stage: stage.into(),
            message: message.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn emit_error(&self, scope_id: &str, message: impl Into<String>, details: Option<String>) {
        self.publish(ProgressEvent::Error {
            scope_id: scope_id.to_string(),
            message: message.into(),
            details,
            timestamp: Utc::now(),
        });
    }

    fn publish(&self, event: ProgressEvent) {
        let mut scopes = self.scopes.write().unwrap_or_else(|e| e.into_inner());
        let scope_id = event.scope_id().to_string();

        match scopes.senders.get(&scope_id) {
            Some(sender) => {
                // Err only means every receiver is gone
                let delivered = sender.send(event.clone()).unwrap_or(0);
                debug!("Progress event for scope {} delivered to {} subscribers", scope_id, delivered);
            }
            None => debug!("Progress event for scope {} dropped, no subscribers", scope_id),
        }

        scopes.latest.insert(scope_id, event);
    }

    /// Most recent event published for a scope, whether or not anybody received it
    pub fn latest(&self, scope_id: &str) -> Option<ProgressEvent> {
        let scopes = self.scopes.read().unwrap_or_else(|e| e.into_inner());
        scopes.latest.get(scope_id).cloned()
    }

    pub fn subscriber_count(&self, scope_id: &str) -> usize {
        let scopes = self.scopes.read().unwrap_or_else(|e| e.into_inner());
        scopes
            .senders
            .get(scope_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    /// Drop channels whose subscribers have all gone away. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut scopes = self.scopes.write().unwrap_or_else(|e| e.into_inner());
        let before = scopes.senders.len();
        scopes.senders.retain(|_, sender| sender.receiver_count() > 0);
        let removed = before - scopes.senders.len();
        let Scopes { senders, latest } = &mut *scopes;
        latest.retain(|scope, _| senders.contains_key(scope));
        removed
    }
}
