// src/incident/mod.rs
//!
//! Incident stage: persist alerts, group them into incidents, hand them on.
//!
//! Grouping is deliberately coarse: an alert joins the newest open incident
//! of the same severity created within the last hour, otherwise it opens a
//! new one. The lookup and insert run under one lock so concurrent alerts
//! cannot double-create an incident. `alerts.processed` is published only
//! after the alert row is durable, which is what gives the response stage
//! its causal ordering.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::bus::{self, MessageBus};
use crate::error::Result;
use crate::model::{Alert, Incident, IncidentStatus};
use crate::store::incidents::IncidentStore;

/// Open incidents older than this never absorb new alerts.
const GROUPING_WINDOW_HOURS: i64 = 1;

pub struct IncidentStage {
    store: Arc<dyn IncidentStore>,
    bus: Arc<dyn MessageBus>,
    grouping_lock: Mutex<()>,
}

impl IncidentStage {
    pub fn new(store: Arc<dyn IncidentStore>, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            store,
            bus,
            grouping_lock: Mutex::new(()),
        }
    }

    pub async fn handle_alert(&self, mut alert: Alert) -> Result<Alert> {
        self.store.insert_alert(&alert).await?;

        let incident_id = self.find_or_create_incident(&alert).await?;
        self.store.set_alert_incident(&alert.id, &incident_id).await?;
        alert.incident_id = incident_id;

        let payload = serde_json::to_vec(&alert)?;
        self.bus
            .publish(bus::SUBJECT_ALERTS_PROCESSED, payload)
            .await?;
        Ok(alert)
    }

    async fn find_or_create_incident(&self, alert: &Alert) -> Result<String> {
        let _guard = self.grouping_lock.lock().await;

        let cutoff = Utc::now() - ChronoDuration::hours(GROUPING_WINDOW_HOURS);
        if let Some(incident) = self.store.find_open_incident(alert.severity, cutoff).await? {
            self.store.append_alert(&incident.id, &alert.id).await?;
            log::info!("added alert {} to incident {}", alert.id, incident.id);
            return Ok(incident.id);
        }

        let namespace = alert
            .event
            .as_ref()
            .and_then(|e| e.container.as_ref())
            .map(|c| c.namespace.clone())
            .unwrap_or_default();
        let title = if namespace.is_empty() {
            alert.rule_name.clone()
        } else {
            format!("{} in {}", alert.rule_name, namespace)
        };

        let now = Utc::now();
        let incident = Incident {
            id: Uuid::new_v4().to_string(),
            status: IncidentStatus::Open,
            severity: alert.severity,
            title,
            created_at: now,
            updated_at: now,
            alert_ids: vec![alert.id.clone()],
            triggering_event: alert
                .event
                .as_ref()
                .map(|e| e.event_id.clone())
                .unwrap_or_default(),
        };
        self.store.create_incident(&incident).await?;
        log::info!("created incident {} for alert {}", incident.id, alert.id);
        Ok(incident.id)
    }
}

/// Run the incident stage until shutdown.
pub async fn run_incident_stage(
    stage: Arc<IncidentStage>,
    pool: usize,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut workers = Vec::new();
    for _ in 0..pool.max(1) {
        let mut rx = stage
            .bus
            .queue_subscribe(bus::SUBJECT_ALERTS, bus::GROUP_INCIDENT)
            .await?;
        let stage = Arc::clone(&stage);
        let mut shutdown = shutdown.clone();
        workers.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    message = rx.recv() => {
                        let Some(message) = message else { break };
                        let alert: Alert = match serde_json::from_slice(&message.payload) {
                            Ok(alert) => alert,
                            Err(e) => {
                                log::error!("failed to decode alert: {}", e);
                                continue;
                            }
                        };
                        let alert_id = alert.id.clone();
                        if let Err(e) = stage.handle_alert(alert).await {
                            if e.retryable() {
                                log::warn!("re-queueing alert {} after: {}", alert_id, e);
                                let _ = stage.bus.publish(&message.subject, message.payload).await;
                            } else {
                                log::error!("dropping alert {}: {}", alert_id, e);
                            }
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
    use crate::bus::InProcessBus;
    use crate::model::{ContainerInfo, RuntimeEvent, Severity};
    use crate::store::incidents::SledIncidentStore;

    fn alert(id: &str, severity: Severity, namespace: &str) -> Alert {
        Alert {
            id: id.to_string(),
            timestamp: Utc::now(),
            rule_name: "Shell Spawn in Prod".to_string(),
            severity,
            description: String::new(),
            event: Some(RuntimeEvent {
                timestamp: Utc::now(),
                cluster_id: "c1".to_string(),
                node_id: "n1".to_string(),
                event_type: "process_exec".to_string(),
                event_id: format!("evt-{}", id),
                process: None,
                container: Some(ContainerInfo {
                    namespace: namespace.to_string(),
                    ..Default::default()
                }),
                network: None,
            }),
            incident_id: String::new(),
            response: String::new(),
            event_ids: Vec::new(),
        }
    }

    #[tokio::test]
    async fn same_severity_alerts_share_an_incident() {
        let store = Arc::new(SledIncidentStore::temporary().unwrap());
        let stage = IncidentStage::new(store.clone(), Arc::new(InProcessBus::default()));

        let first = stage.handle_alert(alert("a1", Severity::High, "prod")).await.unwrap();
        let second = stage.handle_alert(alert("a2", Severity::High, "prod")).await.unwrap();
        assert_eq!(first.incident_id, second.incident_id);

        let incident = store.get_incident(&first.incident_id).await.unwrap().unwrap();
        assert_eq!(incident.alert_ids, vec!["a1".to_string(), "a2".to_string()]);
        assert_eq!(incident.title, "Shell Spawn in Prod in prod");
        assert_eq!(incident.triggering_event, "evt-a1");
    }

    #[tokio::test]
    async fn different_severities_open_separate_incidents() {
        let store = Arc::new(SledIncidentStore::temporary().unwrap());
        let stage = IncidentStage::new(store, Arc::new(InProcessBus::default()));

        let high = stage.handle_alert(alert("a1", Severity::High, "prod")).await.unwrap();
        let critical = stage
            .handle_alert(alert("a2", Severity::Critical, "prod"))
            .await
            .unwrap();
        assert_ne!(high.incident_id, critical.incident_id);
    }

    #[tokio::test]
    async fn processed_alerts_are_published_after_persistence() {
        let store = Arc::new(SledIncidentStore::temporary().unwrap());
        let bus = Arc::new(InProcessBus::default());
        let mut rx = bus.subscribe(bus::SUBJECT_ALERTS_PROCESSED).await.unwrap();
        let stage = IncidentStage::new(store.clone(), bus);

        stage.handle_alert(alert("a1", Severity::High, "prod")).await.unwrap();

        let message = rx.recv().await.unwrap();
        let published: Alert = serde_json::from_slice(&message.payload).unwrap();
        assert!(!published.incident_id.is_empty());

        let stored = store.get_alert("a1").await.unwrap().unwrap();
        assert_eq!(stored.incident_id, published.incident_id);
    }

    #[tokio::test]
    async fn concurrent_alerts_do_not_duplicate_incidents() {
        let store = Arc::new(SledIncidentStore::temporary().unwrap());
        let stage = Arc::new(IncidentStage::new(store.clone(), Arc::new(InProcessBus::default())));

        let mut handles = Vec::new();
        for i in 0..8 {
            let stage = Arc::clone(&stage);
            handles.push(tokio::spawn(async move {
                stage
                    .handle_alert(alert(&format!("a{}", i), Severity::High, "prod"))
                    .await
                    .unwrap()
            }));
        }
        let mut incident_ids = Vec::new();
        for handle in handles {
            incident_ids.push(handle.await.unwrap().incident_id);
        }
        incident_ids.sort();
        incident_ids.dedup();
        assert_eq!(incident_ids.len(), 1);
    }
}
