// src/enrich/mod.rs
//!
//! Enrichment stage: join raw events with orchestrator pod metadata.
//!
//! Host agents only know the container id; this stage maintains a live
//! container-to-pod index fed by an orchestrator watch and rewrites the
//! container sub-document of every event that resolves. Cache misses pass
//! the event through unchanged; nothing is dropped here. Deleted pods
//! linger in the index for a grace interval so late-arriving events still
//! resolve.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::bus::{self, MessageBus};
use crate::error::Result;
use crate::model::RuntimeEvent;

/// Pod metadata carried into the event's container sub-document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodRecord {
    pub pod: String,
    pub namespace: String,
    pub service_account: String,
    pub labels: HashMap<String, String>,
}

/// One observed pod with the container ids that belong to it
#[derive(Debug, Clone)]
pub struct PodSnapshot {
    pub container_ids: Vec<String>,
    pub record: PodRecord,
}

#[derive(Debug, Clone)]
pub enum PodUpdate {
    Upsert(PodSnapshot),
    Delete(PodSnapshot),
}

/// Source of pod updates. The initial sync failing is fatal; a broken watch
/// stream is reconnected with exponential backoff while the stale index
/// keeps serving.
#[async_trait]
pub trait PodWatch: Send + Sync {
    async fn sync(&self) -> Result<Vec<PodSnapshot>>;
    /// Blocks until the next batch of updates arrives.
    async fn next(&self) -> Result<Vec<PodUpdate>>;
}

/// Watch source for deployments without an orchestrator connection; the
/// index stays empty and every event passes through unenriched.
pub struct StaticPodWatch;

#[async_trait]
impl PodWatch for StaticPodWatch {
    async fn sync(&self) -> Result<Vec<PodSnapshot>> {
        Ok(Vec::new())
    }

    async fn next(&self) -> Result<Vec<PodUpdate>> {
        std::future::pending().await
    }
}

struct IndexEntry {
    record: Arc<PodRecord>,
    deleted_at: Option<Instant>,
}

/// container id to pod index: one writer (the watch task), many readers.
///
/// Sources report container ids inconsistently, so each container is stored
/// under the full id (`containerd://<hex>`), the bare hex, and the 12-char
/// short form.
pub struct PodIndex {
    entries: RwLock<HashMap<String, IndexEntry>>,
    grace: Duration,
}

fn index_keys(container_id: &str) -> Vec<String> {
    let mut keys = vec![container_id.to_string()];
    if let Some((_, hex)) = container_id.split_once("://") {
        keys.push(hex.to_string());
        if hex.len() > 12 {
            keys.push(hex[..12].to_string());
        }
    }
    keys
}

impl PodIndex {
    pub fn new(grace: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            grace,
        }
    }

    pub fn apply(&self, update: PodUpdate) {
        match update {
            PodUpdate::Upsert(snapshot) => self.upsert(&snapshot),
            PodUpdate::Delete(snapshot) => self.mark_deleted(&snapshot),
        }
    }

    pub fn upsert(&self, snapshot: &PodSnapshot) {
        let record = Arc::new(snapshot.record.clone());
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        for container_id in &snapshot.container_ids {
            for key in index_keys(container_id) {
                entries.insert(
                    key,
                    IndexEntry {
                        record: Arc::clone(&record),
                        deleted_at: None,
                    },
                );
            }
        }
    }

    /// Deletion only stamps the entry; `sweep` removes it after the grace
    /// interval so late events still resolve.
    pub fn mark_deleted(&self, snapshot: &PodSnapshot) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        for container_id in &snapshot.container_ids {
            for key in index_keys(container_id) {
                if let Some(entry) = entries.get_mut(&key) {
                    entry.deleted_at = Some(Instant::now());
                }
            }
        }
    }

    pub fn lookup(&self, container_id: &str) -> Option<Arc<PodRecord>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(container_id).map(|e| Arc::clone(&e.record))
    }

    pub fn sweep(&self) {
        let grace = self.grace;
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, entry| match entry.deleted_at {
            Some(deleted_at) => deleted_at.elapsed() < grace,
            None => true,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Enricher {
    index: Arc<PodIndex>,
}

impl Enricher {
    pub fn new(index: Arc<PodIndex>) -> Self {
        Self { index }
    }

    /// Rewrite the container sub-document from the index. Idempotent, never
    /// touches identity fields, passes cache misses through unchanged.
    pub fn enrich(&self, mut event: RuntimeEvent) -> RuntimeEvent {
        let Some(container) = event.container.as_mut() else {
            return event;
        };
        if container.container_id.is_empty() {
            return event;
        }
        if let Some(record) = self.index.lookup(&container.container_id) {
            container.pod = record.pod.clone();
            container.namespace = record.namespace.clone();
            container.service_account = record.service_account.clone();
            container.labels = record.labels.clone();
        }
        event
    }
}

async fn watch_loop(watch: Arc<dyn PodWatch>, index: Arc<PodIndex>, mut shutdown: watch::Receiver<bool>) {
    let mut backoff = Duration::from_secs(1);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            updates = watch.next() => match updates {
                Ok(updates) => {
                    for update in updates {
                        index.apply(update);
                    }
                    index.sweep();
                    backoff = Duration::from_secs(1);
                }
                Err(e) => {
                    log::warn!("pod watch disconnected, retrying in {:?}: {}", backoff, e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(60));
                    match watch.sync().await {
                        Ok(snapshots) => {
                            for snapshot in snapshots {
                                index.upsert(&snapshot);
                            }
                            log::info!("pod watch resynced, {} index entries", index.len());
                        }
                        Err(e) => log::warn!("pod resync failed: {}", e),
                    }
                }
            }
        }
    }
}

/// Run the enrichment stage until shutdown. The initial index sync must
/// succeed or the stage refuses to serve.
pub async fn run_enricher(
    bus_handle: Arc<dyn MessageBus>,
    watch_source: Arc<dyn PodWatch>,
    grace: Duration,
    pool: usize,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let index = Arc::new(PodIndex::new(grace));
    for snapshot in watch_source.sync().await? {
        index.upsert(&snapshot);
    }
    log::info!("enricher started, {} index entries", index.len());

    tokio::spawn(watch_loop(
        Arc::clone(&watch_source),
        Arc::clone(&index),
        shutdown.clone(),
    ));

    let mut workers = Vec::new();
    for _ in 0..pool.max(1) {
        let mut rx = bus_handle
            .queue_subscribe(bus::SUBJECT_EVENTS_RAW_WILDCARD, bus::GROUP_ENRICH)
            .await?;
        let bus_handle = Arc::clone(&bus_handle);
        let enricher = Enricher::new(Arc::clone(&index));
        let mut shutdown = shutdown.clone();
        workers.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    message = rx.recv() => {
                        let Some(message) = message else { break };
                        let event: RuntimeEvent = match serde_json::from_slice(&message.payload) {
                            Ok(event) => event,
                            Err(e) => {
                                log::error!("failed to decode raw event: {}", e);
                                continue;
                            }
                        };
                        let enriched = enricher.enrich(event);
                        match serde_json::to_vec(&enriched) {
                            Ok(payload) => {
                                if let Err(e) = bus_handle
                                    .publish(bus::SUBJECT_EVENTS_ENRICHED, payload)
                                    .await
                                {
                                    log::error!("failed to publish enriched event: {}", e);
                                }
                            }
                            Err(e) => log::error!("failed to encode enriched event: {}", e),
                        }
                    }
                }
            }
        }));
    }

    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContainerInfo;
    use chrono::Utc;

    fn snapshot(container_id: &str, pod: &str, namespace: &str) -> PodSnapshot {
        PodSnapshot {
            container_ids: vec![container_id.to_string()],
            record: PodRecord {
                pod: pod.to_string(),
                namespace: namespace.to_string(),
                service_account: "default".to_string(),
                labels: HashMap::from([("app".to_string(), pod.to_string())]),
            },
        }
    }

    fn raw_event(container_id: &str) -> RuntimeEvent {
        RuntimeEvent {
            timestamp: Utc::now(),
            cluster_id: "c1".to_string(),
            node_id: "n1".to_string(),
            event_type: "process_exec".to_string(),
            event_id: "e1".to_string(),
            process: None,
            container: Some(ContainerInfo {
                container_id: container_id.to_string(),
                ..Default::default()
            }),
            network: None,
        }
    }

    #[test]
    fn resolves_full_hex_and_short_ids() {
        let hex = "a".repeat(64);
        let full = format!("containerd://{}", hex);
        let index = Arc::new(PodIndex::new(Duration::from_secs(300)));
        index.upsert(&snapshot(&full, "web-1", "prod"));
        let enricher = Enricher::new(index);

        for id in [full.as_str(), hex.as_str(), &hex[..12]] {
            let enriched = enricher.enrich(raw_event(id));
            let container = enriched.container.unwrap();
            assert_eq!(container.pod, "web-1");
            assert_eq!(container.namespace, "prod");
            assert_eq!(container.service_account, "default");
        }
    }

    #[test]
    fn cache_miss_passes_through_unchanged() {
        let index = Arc::new(PodIndex::new(Duration::from_secs(300)));
        let enricher = Enricher::new(index);
        let event = raw_event("containerd://unknown");
        assert_eq!(enricher.enrich(event.clone()), event);
    }

    #[test]
    fn enrichment_is_idempotent_and_preserves_identity() {
        let index = Arc::new(PodIndex::new(Duration::from_secs(300)));
        index.upsert(&snapshot("containerd://abc123def456xyz", "web-1", "prod"));
        let enricher = Enricher::new(index);

        let event = raw_event("containerd://abc123def456xyz");
        let once = enricher.enrich(event.clone());
        let twice = enricher.enrich(once.clone());
        assert_eq!(once, twice);
        assert_eq!(once.event_id, event.event_id);
        assert_eq!(once.timestamp, event.timestamp);
        assert_eq!(once.cluster_id, event.cluster_id);
    }

    #[test]
    fn deleted_pods_linger_for_the_grace_interval() {
        let index = Arc::new(PodIndex::new(Duration::from_secs(300)));
        let snap = snapshot("containerd://abc123def456xyz", "web-1", "prod");
        index.upsert(&snap);
        index.mark_deleted(&snap);
        index.sweep();

        // Still resolvable inside the grace interval.
        assert!(index.lookup("containerd://abc123def456xyz").is_some());
    }

    #[test]
    fn sweep_removes_entries_past_grace() {
        let index = Arc::new(PodIndex::new(Duration::from_millis(0)));
        let snap = snapshot("containerd://abc123def456xyz", "web-1", "prod");
        index.upsert(&snap);
        index.mark_deleted(&snap);
        std::thread::sleep(Duration::from_millis(5));
        index.sweep();
        assert!(index.lookup("containerd://abc123def456xyz").is_none());
    }
}
