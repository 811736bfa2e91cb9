// src/bus/mod.rs
//!
//! Publish/subscribe bus seam between pipeline stages.
//!
//! Stages never call each other; they publish entities as JSON on well-known
//! subjects and consume them through queue groups, so each stage scales by
//! adding competing consumers. The trait mirrors the broker surface the
//! pipeline needs (subject wildcards, queue-group load balancing); the
//! in-process implementation wires a single-binary deployment and the test
//! suite.

use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::error::{Result, SentryError};

pub const SUBJECT_EVENTS_RAW_PREFIX: &str = "events.raw";
pub const SUBJECT_EVENTS_RAW_WILDCARD: &str = "events.raw.>";
pub const SUBJECT_EVENTS_ENRICHED: &str = "events.enriched";
pub const SUBJECT_ALERTS: &str = "alerts";
pub const SUBJECT_ALERTS_PROCESSED: &str = "alerts.processed";

pub const GROUP_ENRICH: &str = "enrich-workers";
pub const GROUP_DETECT: &str = "detect-workers";
pub const GROUP_INCIDENT: &str = "incident-workers";
pub const GROUP_RESPOND: &str = "respond-workers";

/// Subject for raw events from one (cluster, node) source
pub fn raw_subject(cluster_id: &str, node_id: &str) -> String {
    format!("{}.{}.{}", SUBJECT_EVENTS_RAW_PREFIX, cluster_id, node_id)
}

#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()>;

    /// Competing-consumer subscription: messages matching `subject` are
    /// delivered to exactly one member of `queue_group`.
    async fn queue_subscribe(
        &self,
        subject: &str,
        queue_group: &str,
    ) -> Result<mpsc::Receiver<BusMessage>>;

    /// Fan-out subscription: every subscriber sees every matching message.
    async fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<BusMessage>>;
}

/// Trailing `>` matches any suffix: `events.raw.>` covers
/// `events.raw.<cluster>.<node>`.
fn subject_matches(pattern: &str, subject: &str) -> bool {
    match pattern.strip_suffix('>') {
        Some(prefix) => subject.len() > prefix.len() && subject.starts_with(prefix),
        None => pattern == subject,
    }
}

struct Subscription {
    pattern: String,
    queue_group: Option<String>,
    members: Vec<mpsc::Sender<BusMessage>>,
    next: usize,
}

/// In-process bus with bounded per-subscriber channels.
///
/// Delivery within a queue group is round-robin, skipping members whose
/// channel is full or closed; a full fan-out subscriber loses the message
/// with a warning rather than blocking the publisher.
pub struct InProcessBus {
    subscriptions: Mutex<Vec<Subscription>>,
    capacity: usize,
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InProcessBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            capacity,
        }
    }

    fn add_member(
        &self,
        pattern: &str,
        queue_group: Option<&str>,
    ) -> mpsc::Receiver<BusMessage> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(group) = queue_group {
            if let Some(sub) = subs
                .iter_mut()
                .find(|s| s.pattern == pattern && s.queue_group.as_deref() == Some(group))
            {
                sub.members.push(tx);
                return rx;
            }
        }

        subs.push(Subscription {
            pattern: pattern.to_string(),
            queue_group: queue_group.map(str::to_string),
            members: vec![tx],
            next: 0,
        });
        rx
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        if subject.is_empty() {
            return Err(SentryError::Transport("empty subject".to_string()));
        }

        let mut subs = self.subscriptions.lock().unwrap_or_else(|e| e.into_inner());
        for sub in subs.iter_mut() {
            if !subject_matches(&sub.pattern, subject) {
                continue;
            }
            sub.members.retain(|member| !member.is_closed());
            let message = BusMessage {
                subject: subject.to_string(),
                payload: payload.clone(),
            };

            if sub.queue_group.is_some() {
                // One delivery per group; start at the cursor and take the
                // first member with room.
                let count = sub.members.len();
                if count == 0 {
                    continue;
                }
                let mut delivered = false;
                for offset in 0..count {
                    let idx = (sub.next + offset) % count;
                    if sub.members[idx].try_send(message.clone()).is_ok() {
                        sub.next = (idx + 1) % count;
                        delivered = true;
                        break;
                    }
                }
                if !delivered {
                    log::warn!(
                        "bus: no capacity in queue group {:?} for {}",
                        sub.queue_group,
                        subject
                    );
                }
            } else {
                for member in &sub.members {
                    if member.try_send(message.clone()).is_err() {
                        log::warn!("bus: dropping message for slow subscriber on {}", subject);
                    }
                }
            }
        }
        Ok(())
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        queue_group: &str,
    ) -> Result<mpsc::Receiver<BusMessage>> {
        Ok(self.add_member(subject, Some(queue_group)))
    }

    async fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<BusMessage>> {
        Ok(self.add_member(subject, None))
    }
}
