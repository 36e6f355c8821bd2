//! Registry of active subscriptions.
//!
//! # Example
//!
//! ```
//! use c8y_realtime::protocol::Message;
//! use c8y_realtime::subscription::SubscriptionRegistry;
//! use serde_json::json;
//! use tokio::sync::mpsc;
//!
//! let registry = SubscriptionRegistry::new();
//! let (tx, mut rx) = mpsc::channel(8);
//! registry.add("/measurements/*", tx).unwrap();
//!
//! let outcome = registry.route(&Message::data("/measurements/1", json!(21.5)));
//! assert_eq!(outcome.delivered, 1);
//! assert_eq!(rx.try_recv().unwrap().channel, "/measurements/1");
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::Result;
use crate::pattern::ChannelPattern;
use crate::protocol::Message;

/// Identifier assigned to each registration.
pub type SubscriptionId = u64;

/// Snapshot of one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub pattern: String,
    /// Messages dropped because the subscriber channel was full.
    pub dropped: u64,
}

/// Result of routing one message.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RouteOutcome {
    /// Subscriptions that accepted the message.
    pub delivered: usize,
    /// Subscriptions whose channel was full.
    pub dropped: usize,
    /// Patterns left without any subscriber after pruning closed channels.
    pub orphaned: Vec<String>,
}

struct Entry {
    id: SubscriptionId,
    pattern: ChannelPattern,
    destination: mpsc::Sender<Message>,
    dropped: u64,
}

/// Active subscriptions, guarded by one mutex that is never held across an
/// `.await`.
pub struct SubscriptionRegistry {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Compile `pattern` and register `destination` for it.
    ///
    /// Registration is immediate: a matching message routed right after this
    /// returns is delivered, whether or not the server has acknowledged the
    /// subscription yet.
    pub fn add(&self, pattern: &str, destination: mpsc::Sender<Message>) -> Result<SubscriptionId> {
        let pattern = ChannelPattern::compile(pattern)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Registered subscription {} for {}", id, pattern);
        self.lock().push(Entry {
            id,
            pattern,
            destination,
            dropped: 0,
        });
        Ok(id)
    }

    /// Remove one registration. Returns true if it existed.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    /// Remove every registration for `pattern`. Returns how many were removed.
    pub fn remove_pattern(&self, pattern: &str) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| e.pattern.as_str() != pattern);
        before - entries.len()
    }

    /// Deliver `message` to every subscription whose pattern matches its
    /// channel.
    pub fn route(&self, message: &Message) -> RouteOutcome {
        let mut outcome = RouteOutcome::default();
        let mut entries = self.lock();
        let mut closed = Vec::new();

        for entry in entries.iter_mut() {
            if !entry.pattern.matches(&message.channel) {
                continue;
            }
            match entry.destination.try_send(message.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    entry.dropped += 1;
                    outcome.dropped += 1;
                    tracing::warn!(
                        "Subscriber {} for {} is full, dropping message on {}",
                        entry.id,
                        entry.pattern,
                        message.channel
                    );
                }
                Err(TrySendError::Closed(_)) => closed.push(entry.id),
            }
        }

        if !closed.is_empty() {
            let mut gone = Vec::new();
            entries.retain(|e| {
                if closed.contains(&e.id) {
                    tracing::debug!(
                        "Pruning subscription {} for {}: receiver dropped",
                        e.id,
                        e.pattern
                    );
                    if !gone.iter().any(|p| p == e.pattern.as_str()) {
                        gone.push(e.pattern.as_str().to_string());
                    }
                    false
                } else {
                    true
                }
            });
            outcome.orphaned = gone
                .into_iter()
                .filter(|p| !entries.iter().any(|e| e.pattern.as_str() == p))
                .collect();
        }

        outcome
    }

    /// Distinct patterns in registration order.
    pub fn patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = Vec::new();
        for entry in self.lock().iter() {
            if !patterns.iter().any(|p| p == entry.pattern.as_str()) {
                patterns.push(entry.pattern.as_str().to_string());
            }
        }
        patterns
    }

    pub fn has_pattern(&self, pattern: &str) -> bool {
        self.lock().iter().any(|e| e.pattern.as_str() == pattern)
    }

    pub fn snapshot(&self) -> Vec<SubscriptionInfo> {
        self.lock()
            .iter()
            .map(|e| SubscriptionInfo {
                id: e.id,
                pattern: e.pattern.as_str().to_string(),
                dropped: e.dropped,
            })
            .collect()
    }

    /// Drop every registration, releasing the subscriber channels.
    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        let count = entries.len();
        entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
