// src/archive/mod.rs
//!
//! Cold archive: raw events batched per (cluster, node), gzip-compressed,
//! flushed to an object store under
//! `raw/<cluster>/<YYYY-MM-DD>/<node>/<HH>/<unix_nanos>.jsonl.gz`.
//!
//! A buffer flushes only when the flush interval has elapsed since its last
//! flush and it holds data. The object store is a trait; the filesystem
//! implementation covers single-node deployments and tests, blob storage is
//! a deployment concern behind the same seam.

use async_trait::async_trait;
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::error::{Result, SentryError};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()>;
}

/// Object store rooted at a local directory
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        Ok(())
    }
}

struct NodeBuffer {
    encoder: GzEncoder<Vec<u8>>,
    lines: usize,
    last_flush: Instant,
}

impl NodeBuffer {
    fn new() -> Self {
        Self {
            encoder: GzEncoder::new(Vec::new(), Compression::default()),
            lines: 0,
            last_flush: Instant::now(),
        }
    }
}

pub struct ArchiveWriter {
    store: std::sync::Arc<dyn ObjectStore>,
    flush_interval: Duration,
    buffers: Mutex<HashMap<(String, String), NodeBuffer>>,
}

impl ArchiveWriter {
    pub fn new(store: std::sync::Arc<dyn ObjectStore>, flush_interval: Duration) -> Self {
        Self {
            store,
            flush_interval,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Append one raw event line to the (cluster, node) buffer.
    pub fn append(&self, cluster_id: &str, node_id: &str, line: &[u8]) -> Result<()> {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        let buffer = buffers
            .entry((cluster_id.to_string(), node_id.to_string()))
            .or_insert_with(NodeBuffer::new);
        buffer
            .encoder
            .write_all(line)
            .and_then(|_| buffer.encoder.write_all(b"\n"))
            .map_err(|e| SentryError::Store(format!("archive buffer: {}", e)))?;
        buffer.lines += 1;
        Ok(())
    }

    fn object_key(cluster_id: &str, node_id: &str) -> String {
        let now = Utc::now();
        format!(
            "raw/{}/{}/{}/{}/{}.jsonl.gz",
            cluster_id,
            now.format("%Y-%m-%d"),
            node_id,
            now.format("%H"),
            now.timestamp_nanos_opt().unwrap_or_default()
        )
    }

    /// Seal and collect every buffer that is due (or all of them when
    /// `force` is set, used on shutdown).
    fn take_due(&self, force: bool) -> Vec<(String, Vec<u8>)> {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        for ((cluster_id, node_id), buffer) in buffers.iter_mut() {
            let due = buffer.lines > 0
                && (force || buffer.last_flush.elapsed() >= self.flush_interval);
            if !due {
                continue;
            }
            let sealed = std::mem::replace(buffer, NodeBuffer::new());
            match sealed.encoder.finish() {
                Ok(payload) => out.push((Self::object_key(cluster_id, node_id), payload)),
                Err(e) => log::error!("archive gzip finish failed: {}", e),
            }
        }
        out
    }

    pub async fn flush_due(&self, force: bool) {
        for (key, payload) in self.take_due(force) {
            match self.store.put(&key, payload).await {
                Ok(()) => log::info!("archived {}", key),
                Err(e) => log::error!("archive upload {} failed: {}", key, e),
            }
        }
    }

    /// Run the flush loop until shutdown; drains the buffers on exit.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.flush_due(false).await,
            }
        }
        self.flush_due(true).await;
    }
}
