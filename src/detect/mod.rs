// src/detect/mod.rs
//!
//! Detection stage: stateless rule matching plus stateful correlation.
//!
//! Consumes enriched events from the bus, runs them through the compiled
//! rule engine and the correlator, and publishes resulting alerts. Alert
//! identity (id, timestamp) is assigned here at publish time so evaluation
//! stays pure.

pub mod correlator;
pub mod expr;
pub mod matcher;
pub mod rules;

use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use uuid::Uuid;

use crate::bus::{self, MessageBus};
use crate::error::Result;
use crate::logging::SecurityLogger;
use crate::model::{Alert, Rule, RuntimeEvent};
use crate::store::CorrelationStore;
use correlator::Correlator;
use matcher::RuleEngine;
use rules::RuleSet;

pub struct Detector {
    engine: RwLock<Arc<RuleEngine>>,
    correlator: Correlator,
    bus: Arc<dyn MessageBus>,
    logger: SecurityLogger,
}

impl Detector {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn CorrelationStore>,
        rule_set: RuleSet,
    ) -> Result<Self> {
        let engine = RuleEngine::new(rule_set.rules)?;
        let correlator = Correlator::new(store, rule_set.thresholds, rule_set.sequences)?;
        log::info!("detection engine ready, {} stateless rules", engine.rule_count());
        Ok(Self {
            engine: RwLock::new(Arc::new(engine)),
            correlator,
            bus,
            logger: SecurityLogger::new("podsentry", "detect"),
        })
    }

    /// Compile a replacement rule set and swap it in atomically. The old
    /// engine keeps serving until the new one compiled cleanly.
    pub fn reload(&self, rules: Vec<Rule>) -> Result<()> {
        let engine = Arc::new(RuleEngine::new(rules)?);
        let count = engine.rule_count();
        *self.engine.write().unwrap_or_else(|e| e.into_inner()) = engine;
        log::info!("rule engine reloaded, {} stateless rules", count);
        Ok(())
    }

    /// Evaluate one event end to end and publish every resulting alert.
    ///
    /// Correlation store failures bubble up so the caller can re-queue the
    /// event; stateless matching never fails the event.
    pub async fn handle_event(&self, event: &RuntimeEvent) -> Result<Vec<Alert>> {
        let engine = {
            let guard = self.engine.read().unwrap_or_else(|e| e.into_inner());
            Arc::clone(&guard)
        };

        let mut alerts = engine.evaluate(event);
        alerts.extend(self.correlator.process(event).await?);

        let mut published = Vec::with_capacity(alerts.len());
        for mut alert in alerts {
            alert.id = Uuid::new_v4().to_string();
            alert.timestamp = chrono::Utc::now();
            self.logger.alert(&alert.description, &alert);

            let payload = serde_json::to_vec(&alert)?;
            self.bus.publish(bus::SUBJECT_ALERTS, payload).await?;
            published.push(alert);
        }
        Ok(published)
    }
}

async fn detector_worker(
    detector: Arc<Detector>,
    mut rx: tokio::sync::mpsc::Receiver<bus::BusMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            message = rx.recv() => {
                let Some(message) = message else { break };
                let event: RuntimeEvent = match serde_json::from_slice(&message.payload) {
                    Ok(event) => event,
                    Err(e) => {
                        log::error!("failed to decode event on {}: {}", message.subject, e);
                        continue;
                    }
                };
                if let Err(e) = detector.handle_event(&event).await {
                    if e.retryable() {
                        // The bus is the retry mechanism; put the event back.
                        log::warn!("re-queueing event {} after: {}", event.event_id, e);
                        let _ = detector
                            .bus
                            .publish(&message.subject, message.payload)
                            .await;
                    } else {
                        log::error!("dropping event {}: {}", event.event_id, e);
                    }
                }
            }
        }
    }
}

/// Run the detection stage until shutdown. Spawns `pool` competing workers
/// on the enriched stream; the optional raw tap re-evaluates unenriched
/// events, which double-processes each event and is off by default.
pub async fn run_detector(
    detector: Arc<Detector>,
    pool: usize,
    tap_raw: bool,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut workers = Vec::new();
    for _ in 0..pool.max(1) {
        let rx = detector
            .bus
            .queue_subscribe(bus::SUBJECT_EVENTS_ENRICHED, bus::GROUP_DETECT)
            .await?;
        workers.push(tokio::spawn(detector_worker(
            Arc::clone(&detector),
            rx,
            shutdown.clone(),
        )));
    }

    if tap_raw {
        log::warn!("raw event tap enabled, events will be evaluated twice");
        let rx = detector.bus.subscribe(bus::SUBJECT_EVENTS_RAW_WILDCARD).await?;
        workers.push(tokio::spawn(detector_worker(
            Arc::clone(&detector),
            rx,
            shutdown.clone(),
        )));
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
    use crate::model::{ContainerInfo, ProcessInfo, Severity};
    use crate::store::MemoryCorrelationStore;
    use chrono::Utc;

    fn shell_rule() -> Rule {
        Rule {
            id: "r1".to_string(),
            name: "Shell Spawn in Prod".to_string(),
            description: "Bash in prod".to_string(),
            severity: Severity::High,
            condition: "event.process.exe in ['/bin/bash', '/bin/sh'] && event.container.namespace == 'prod'"
                .to_string(),
            response: "kill_pod".to_string(),
            enabled: true,
        }
    }

    fn shell_event() -> RuntimeEvent {
        RuntimeEvent {
            timestamp: Utc::now(),
            cluster_id: "c1".to_string(),
            node_id: "n1".to_string(),
            event_type: "process_exec".to_string(),
            event_id: "e1".to_string(),
            process: Some(ProcessInfo {
                exe: "/bin/bash".to_string(),
                ..Default::default()
            }),
            container: Some(ContainerInfo {
                namespace: "prod".to_string(),
                pod: "p1".to_string(),
                ..Default::default()
            }),
            network: None,
        }
    }

    #[tokio::test]
    async fn alerts_get_identity_and_reach_the_bus() {
        let bus = Arc::new(InProcessBus::default());
        let mut alerts_rx = bus.subscribe(bus::SUBJECT_ALERTS).await.unwrap();

        let detector = Detector::new(
            bus.clone(),
            Arc::new(MemoryCorrelationStore::new()),
            RuleSet {
                rules: vec![shell_rule()],
                ..Default::default()
            },
        )
        .unwrap();

        let published = detector.handle_event(&shell_event()).await.unwrap();
        assert_eq!(published.len(), 1);
        assert!(!published[0].id.is_empty());
        assert_eq!(published[0].response, "kill_pod");

        let message = alerts_rx.recv().await.unwrap();
        let alert: Alert = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(alert.id, published[0].id);
        assert_eq!(alert.severity, Severity::High);
    }

    #[tokio::test]
    async fn reload_swaps_the_rule_set() {
        let bus = Arc::new(InProcessBus::default());
        let detector = Detector::new(
            bus,
            Arc::new(MemoryCorrelationStore::new()),
            RuleSet {
                rules: vec![shell_rule()],
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(detector.handle_event(&shell_event()).await.unwrap().len(), 1);

        detector.reload(vec![]).unwrap();
        assert!(detector.handle_event(&shell_event()).await.unwrap().is_empty());

        // A broken replacement leaves the old engine serving.
        assert!(detector
            .reload(vec![Rule {
                condition: "event.".to_string(),
                ..shell_rule()
            }])
            .is_err());
    }
}
