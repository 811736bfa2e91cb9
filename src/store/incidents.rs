// src/store/incidents.rs
//!
//! Durable store for alerts, incidents and action logs.
//!
//! Three logical tables behind one trait so the incident stage, response
//! orchestrator and read API share a single seam. The sled implementation
//! keeps one tree per table with JSON values; queries scan and filter, which
//! is fine at alert volumes where the hot path is the insert.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sled::{Db, Tree};
use std::path::Path;

use crate::error::{Result, SentryError};
use crate::model::{ActionLog, Alert, Incident, IncidentStatus, Severity};

#[async_trait]
pub trait IncidentStore: Send + Sync {
    async fn insert_alert(&self, alert: &Alert) -> Result<()>;
    async fn set_alert_incident(&self, alert_id: &str, incident_id: &str) -> Result<()>;
    async fn get_alert(&self, id: &str) -> Result<Option<Alert>>;
    /// Most recent first
    async fn list_alerts(&self, limit: usize) -> Result<Vec<Alert>>;
    async fn alerts_for_incident(&self, incident_id: &str) -> Result<Vec<Alert>>;

    /// Newest open incident of this severity created after `cutoff`.
    async fn find_open_incident(
        &self,
        severity: Severity,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<Incident>>;
    async fn create_incident(&self, incident: &Incident) -> Result<()>;
    async fn append_alert(&self, incident_id: &str, alert_id: &str) -> Result<()>;
    async fn get_incident(&self, id: &str) -> Result<Option<Incident>>;
    async fn list_incidents(
        &self,
        status: Option<IncidentStatus>,
        limit: usize,
    ) -> Result<Vec<Incident>>;
    /// Returns the updated incident, or None if it does not exist.
    async fn update_incident_status(
        &self,
        id: &str,
        status: IncidentStatus,
    ) -> Result<Option<Incident>>;

    async fn insert_action_log(&self, row: &ActionLog) -> Result<()>;
    async fn actions_for_incident(&self, incident_id: &str) -> Result<Vec<ActionLog>>;
}

const TREE_ALERTS: &[u8] = b"alerts";
const TREE_INCIDENTS: &[u8] = b"incidents";
const TREE_ACTION_LOGS: &[u8] = b"action_logs";

pub struct SledIncidentStore {
    db: Db,
}

impl SledIncidentStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = sled::Config::new()
            .path(path)
            .flush_every_ms(Some(5000))
            .open()?;
        Ok(Self { db })
    }

    /// Throwaway in-memory instance
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn tree(&self, name: &[u8]) -> Result<Tree> {
        self.db.open_tree(name).map_err(Into::into)
    }

    fn put_json<T: serde::Serialize>(&self, tree: &Tree, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| SentryError::Store(format!("encode {}: {}", key, e)))?;
        tree.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    fn scan<T: serde::de::DeserializeOwned>(&self, tree: &Tree) -> Vec<T> {
        tree.iter()
            .flatten()
            .filter_map(|(_, value)| serde_json::from_slice(&value).ok())
            .collect()
    }
}

#[async_trait]
impl IncidentStore for SledIncidentStore {
    async fn insert_alert(&self, alert: &Alert) -> Result<()> {
        let tree = self.tree(TREE_ALERTS)?;
        self.put_json(&tree, &alert.id, alert)
    }

    async fn set_alert_incident(&self, alert_id: &str, incident_id: &str) -> Result<()> {
        let tree = self.tree(TREE_ALERTS)?;
        let Some(raw) = tree.get(alert_id.as_bytes())? else {
            return Ok(());
        };
        let mut alert: Alert = serde_json::from_slice(&raw)
            .map_err(|e| SentryError::Store(format!("decode alert {}: {}", alert_id, e)))?;
        alert.incident_id = incident_id.to_string();
        self.put_json(&tree, alert_id, &alert)
    }

    async fn get_alert(&self, id: &str) -> Result<Option<Alert>> {
        let tree = self.tree(TREE_ALERTS)?;
        match tree.get(id.as_bytes())? {
            Some(raw) => Ok(serde_json::from_slice(&raw).ok()),
            None => Ok(None),
        }
    }

    async fn list_alerts(&self, limit: usize) -> Result<Vec<Alert>> {
        let tree = self.tree(TREE_ALERTS)?;
        let mut alerts: Vec<Alert> = self.scan(&tree);
        alerts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        alerts.truncate(limit);
        Ok(alerts)
    }

    async fn alerts_for_incident(&self, incident_id: &str) -> Result<Vec<Alert>> {
        let tree = self.tree(TREE_ALERTS)?;
        let mut alerts: Vec<Alert> = self
            .scan(&tree)
            .into_iter()
            .filter(|a: &Alert| a.incident_id == incident_id)
            .collect();
        alerts.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(alerts)
    }

    async fn find_open_incident(
        &self,
        severity: Severity,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<Incident>> {
        let tree = self.tree(TREE_INCIDENTS)?;
        Ok(self
            .scan::<Incident>(&tree)
            .into_iter()
            .filter(|i| {
                i.status == IncidentStatus::Open
                    && i.severity == severity
                    && i.created_at > cutoff
            })
            .max_by_key(|i| i.created_at))
    }

    async fn create_incident(&self, incident: &Incident) -> Result<()> {
        let tree = self.tree(TREE_INCIDENTS)?;
        self.put_json(&tree, &incident.id, incident)
    }

    async fn append_alert(&self, incident_id: &str, alert_id: &str) -> Result<()> {
        let tree = self.tree(TREE_INCIDENTS)?;
        let Some(raw) = tree.get(incident_id.as_bytes())? else {
            return Err(SentryError::Store(format!(
                "incident {} not found",
                incident_id
            )));
        };
        let mut incident: Incident = serde_json::from_slice(&raw)
            .map_err(|e| SentryError::Store(format!("decode incident {}: {}", incident_id, e)))?;
        incident.alert_ids.push(alert_id.to_string());
        incident.updated_at = Utc::now();
        self.put_json(&tree, incident_id, &incident)
    }

    async fn get_incident(&self, id: &str) -> Result<Option<Incident>> {
        let tree = self.tree(TREE_INCIDENTS)?;
        match tree.get(id.as_bytes())? {
            Some(raw) => Ok(serde_json::from_slice(&raw).ok()),
            None => Ok(None),
        }
    }

    async fn list_incidents(
        &self,
        status: Option<IncidentStatus>,
        limit: usize,
    ) -> Result<Vec<Incident>> {
        let tree = self.tree(TREE_INCIDENTS)?;
        let mut incidents: Vec<Incident> = self
            .scan(&tree)
            .into_iter()
            .filter(|i: &Incident| status.map(|s| i.status == s).unwrap_or(true))
            .collect();
        incidents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        incidents.truncate(limit);
        Ok(incidents)
    }

    async fn update_incident_status(
        &self,
        id: &str,
        status: IncidentStatus,
    ) -> Result<Option<Incident>> {
        let tree = self.tree(TREE_INCIDENTS)?;
        let Some(raw) = tree.get(id.as_bytes())? else {
            return Ok(None);
        };
        let mut incident: Incident = serde_json::from_slice(&raw)
            .map_err(|e| SentryError::Store(format!("decode incident {}: {}", id, e)))?;
        incident.status = status;
        incident.updated_at = Utc::now();
        self.put_json(&tree, id, &incident)?;
        Ok(Some(incident))
    }

    async fn insert_action_log(&self, row: &ActionLog) -> Result<()> {
        let tree = self.tree(TREE_ACTION_LOGS)?;
        self.put_json(&tree, &row.id, row)
    }

    async fn actions_for_incident(&self, incident_id: &str) -> Result<Vec<ActionLog>> {
        let tree = self.tree(TREE_ACTION_LOGS)?;
        let mut rows: Vec<ActionLog> = self
            .scan(&tree)
            .into_iter()
            .filter(|r: &ActionLog| r.incident_id == incident_id)
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }
}
