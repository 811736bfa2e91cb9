// src/detect/correlator.rs
//!
//! Stateful correlation: patterns no single-event rule can express.
//!
//! Two pattern kinds, both keyed by `(rule_id, group_key)` where the group
//! key is extracted from the event by a configured field path:
//!
//! - threshold: N condition-matching events within W seconds from one group.
//!   Level-triggered: once the window holds N events, every further event
//!   fires again until entries age out.
//! - sequence: steps S0..Sn-1 all observed within W seconds from one group,
//!   arrival order free, completion edge-triggered (state cleared on fire).
//!
//! Window eviction is bounded by the correlator host's wall clock, not event
//! time, so late events never stretch a window backwards. All state lives in
//! the correlation store; store failures propagate as retryable errors and
//! the caller re-queues the event, so duplicate tracking is tolerated.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::detect::expr::{self, Expr};
use crate::error::{Result, SentryError};
use crate::model::{Alert, RuntimeEvent, Severity};
use crate::store::CorrelationStore;

fn default_true() -> bool {
    true
}

/// Rate-based detection config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub condition: String,
    pub count: usize,
    pub window_secs: i64,
    pub group_by: String,
    pub severity: Severity,
    #[serde(default)]
    pub response: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Multi-step pattern config; steps are predicates in sequence order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<String>,
    pub window_secs: i64,
    pub group_by: String,
    pub severity: Severity,
    #[serde(default)]
    pub response: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

struct CompiledThreshold {
    rule: ThresholdRule,
    condition: Expr,
}

struct CompiledSequence {
    rule: SequenceRule,
    steps: Vec<Expr>,
}

pub struct Correlator {
    store: Arc<dyn CorrelationStore>,
    thresholds: Vec<CompiledThreshold>,
    sequences: Vec<CompiledSequence>,
}

fn window_key(rule_id: &str, group_key: &str) -> String {
    format!("corr:{}:{}", rule_id, group_key)
}

fn sequence_key(rule_id: &str, group_key: &str) -> String {
    format!("seq:{}:{}", rule_id, group_key)
}

fn store_err(e: SentryError) -> SentryError {
    // Correlation state lives out of process; treat every failure there as
    // retryable so the caller re-queues instead of dropping the event.
    match e {
        SentryError::Store(msg) => SentryError::Store(msg),
        other => SentryError::Store(other.to_string()),
    }
}

impl Correlator {
    pub fn new(
        store: Arc<dyn CorrelationStore>,
        thresholds: Vec<ThresholdRule>,
        sequences: Vec<SequenceRule>,
    ) -> Result<Self> {
        let mut compiled_thresholds = Vec::new();
        for rule in thresholds.into_iter().filter(|r| r.enabled) {
            let condition =
                expr::compile(&rule.condition).map_err(|diagnostic| SentryError::Compile {
                    rule_id: rule.id.clone(),
                    diagnostic,
                })?;
            compiled_thresholds.push(CompiledThreshold { rule, condition });
        }

        let mut compiled_sequences = Vec::new();
        for rule in sequences.into_iter().filter(|r| r.enabled) {
            let steps = rule
                .steps
                .iter()
                .map(|step| {
                    expr::compile(step).map_err(|diagnostic| SentryError::Compile {
                        rule_id: rule.id.clone(),
                        diagnostic,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            if steps.is_empty() {
                return Err(SentryError::Compile {
                    rule_id: rule.id.clone(),
                    diagnostic: "sequence has no steps".to_string(),
                });
            }
            compiled_sequences.push(CompiledSequence { rule, steps });
        }

        Ok(Self {
            store,
            thresholds: compiled_thresholds,
            sequences: compiled_sequences,
        })
    }

    /// Insert an event into a threshold window and evict entries older than
    /// the window, measured from now.
    pub async fn track_event(
        &self,
        event: &RuntimeEvent,
        rule_id: &str,
        group_key: &str,
        window_secs: i64,
    ) -> Result<()> {
        let key = window_key(rule_id, group_key);
        let member = serde_json::to_string(event)
            .map_err(|e| SentryError::Store(format!("serialize event: {}", e)))?;
        let ttl = Duration::from_secs(window_secs.max(0) as u64);

        self.store
            .window_add(&key, event.timestamp.timestamp(), member, ttl)
            .await
            .map_err(store_err)?;
        self.store
            .window_remove_below(&key, Utc::now().timestamp() - window_secs)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    /// True with the ids of every event currently in the window once the
    /// window holds at least `count` entries. Does not clear the window.
    pub async fn check_threshold(
        &self,
        rule_id: &str,
        group_key: &str,
        count: usize,
        window_secs: i64,
    ) -> Result<(bool, Vec<String>)> {
        let key = window_key(rule_id, group_key);
        let now = Utc::now().timestamp();
        let members = self
            .store
            .window_range(&key, now - window_secs, now)
            .await
            .map_err(store_err)?;

        if members.len() < count {
            return Ok((false, Vec::new()));
        }
        let event_ids = members
            .iter()
            .filter_map(|m| serde_json::from_str::<RuntimeEvent>(m).ok())
            .map(|e| e.event_id)
            .collect();
        Ok((true, event_ids))
    }

    /// Record completion of one sequence step. Re-triggering a step before
    /// the sequence completes overwrites the earlier event id.
    pub async fn track_sequence_step(
        &self,
        rule_id: &str,
        group_key: &str,
        step: usize,
        event_id: &str,
        window_secs: i64,
    ) -> Result<()> {
        let key = sequence_key(rule_id, group_key);
        let ttl = Duration::from_secs(window_secs.max(0) as u64);
        self.store
            .step_set(&key, step, event_id, ttl)
            .await
            .map_err(store_err)
    }

    /// True with the step event ids in sequence order once every step index
    /// is present; the key is deleted on fire, so completion is consumed.
    pub async fn check_sequence_complete(
        &self,
        rule_id: &str,
        group_key: &str,
        total_steps: usize,
    ) -> Result<(bool, Vec<String>)> {
        let key = sequence_key(rule_id, group_key);
        let steps = self.store.step_all(&key).await.map_err(store_err)?;

        if (0..total_steps).any(|i| !steps.contains_key(&i)) {
            return Ok((false, Vec::new()));
        }
        let event_ids = (0..total_steps)
            .filter_map(|i| steps.get(&i).cloned())
            .collect();
        self.store.delete(&key).await.map_err(store_err)?;
        Ok((true, event_ids))
    }

    /// Run one event through every correlation rule and collect the alerts
    /// whose patterns completed.
    pub async fn process(&self, event: &RuntimeEvent) -> Result<Vec<Alert>> {
        let mut alerts = Vec::new();

        for threshold in &self.thresholds {
            let Some(group_key) = expr::resolve_group_key(event, &threshold.rule.group_by)
            else {
                continue;
            };
            match expr::evaluate(&threshold.condition, event) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    log::debug!(
                        "threshold rule {} skipped for event {}: {}",
                        threshold.rule.name,
                        event.event_id,
                        e
                    );
                    continue;
                }
            }

            self.track_event(event, &threshold.rule.id, &group_key, threshold.rule.window_secs)
                .await?;
            let (fired, event_ids) = self
                .check_threshold(
                    &threshold.rule.id,
                    &group_key,
                    threshold.rule.count,
                    threshold.rule.window_secs,
                )
                .await?;
            if fired {
                alerts.push(self.correlated_alert(
                    &threshold.rule.name,
                    &threshold.rule.description,
                    threshold.rule.severity,
                    &threshold.rule.response,
                    event,
                    event_ids,
                ));
            }
        }

        for sequence in &self.sequences {
            let Some(group_key) = expr::resolve_group_key(event, &sequence.rule.group_by)
            else {
                continue;
            };

            for (index, step) in sequence.steps.iter().enumerate() {
                match expr::evaluate(step, event) {
                    Ok(true) => {
                        self.track_sequence_step(
                            &sequence.rule.id,
                            &group_key,
                            index,
                            &event.event_id,
                            sequence.rule.window_secs,
                        )
                        .await?;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        log::debug!(
                            "sequence rule {} step {} skipped for event {}: {}",
                            sequence.rule.name,
                            index,
                            event.event_id,
                            e
                        );
                    }
                }
            }

            let (fired, event_ids) = self
                .check_sequence_complete(&sequence.rule.id, &group_key, sequence.steps.len())
                .await?;
            if fired {
                alerts.push(self.correlated_alert(
                    &sequence.rule.name,
                    &sequence.rule.description,
                    sequence.rule.severity,
                    &sequence.rule.response,
                    event,
                    event_ids,
                ));
            }
        }

        Ok(alerts)
    }

    fn correlated_alert(
        &self,
        rule_name: &str,
        description: &str,
        severity: Severity,
        response: &str,
        event: &RuntimeEvent,
        event_ids: Vec<String>,
    ) -> Alert {
        Alert {
            id: String::new(),
            timestamp: event.timestamp,
            rule_name: rule_name.to_string(),
            severity,
            description: description.to_string(),
            event: Some(event.clone()),
            incident_id: String::new(),
            response: response.to_string(),
            event_ids,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContainerInfo, ProcessInfo};
    use crate::store::MemoryCorrelationStore;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::collections::HashMap;

    fn exec_event(id: &str, container_id: &str, age_secs: i64) -> RuntimeEvent {
        RuntimeEvent {
            timestamp: Utc::now() - ChronoDuration::seconds(age_secs),
            cluster_id: "c1".to_string(),
            node_id: "n1".to_string(),
            event_type: "process_exec".to_string(),
            event_id: id.to_string(),
            process: Some(ProcessInfo {
                exe: "/bin/true".to_string(),
                ..Default::default()
            }),
            container: Some(ContainerInfo {
                container_id: container_id.to_string(),
                ..Default::default()
            }),
            network: None,
        }
    }

    fn threshold_rule(count: usize, window_secs: i64) -> ThresholdRule {
        ThresholdRule {
            id: "th-1".to_string(),
            name: "Exec burst".to_string(),
            description: "Rapid process execution".to_string(),
            condition: "event.event_type == 'process_exec'".to_string(),
            count,
            window_secs,
            group_by: "container.container_id".to_string(),
            severity: Severity::Medium,
            response: String::new(),
            enabled: true,
        }
    }

    fn correlator(
        thresholds: Vec<ThresholdRule>,
        sequences: Vec<SequenceRule>,
    ) -> Correlator {
        Correlator::new(Arc::new(MemoryCorrelationStore::new()), thresholds, sequences).unwrap()
    }

    #[tokio::test]
    async fn threshold_fires_at_count_and_stays_level_triggered() {
        let correlator = correlator(vec![threshold_rule(5, 60)], vec![]);

        for i in 0..4 {
            let event = exec_event(&format!("e{}", i), "cont-1", 0);
            assert!(correlator.process(&event).await.unwrap().is_empty());
        }

        let fifth = exec_event("e4", "cont-1", 0);
        let alerts = correlator.process(&fifth).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].event_ids.len(), 5);

        // No clearing on fire: the next event fires again.
        let sixth = exec_event("e5", "cont-1", 0);
        let alerts = correlator.process(&sixth).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].event_ids.len(), 6);
    }

    #[tokio::test]
    async fn threshold_groups_are_independent() {
        let correlator = correlator(vec![threshold_rule(2, 60)], vec![]);

        let first = exec_event("a1", "cont-a", 0);
        assert!(correlator.process(&first).await.unwrap().is_empty());
        let other_group = exec_event("b1", "cont-b", 0);
        assert!(correlator.process(&other_group).await.unwrap().is_empty());

        let second = exec_event("a2", "cont-a", 0);
        assert_eq!(correlator.process(&second).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn events_outside_the_window_do_not_count() {
        let correlator = correlator(vec![threshold_rule(5, 60)], vec![]);

        // Old events are tracked but fall outside now - window.
        for i in 0..6 {
            let event = exec_event(&format!("old{}", i), "cont-1", 120);
            assert!(correlator.process(&event).await.unwrap().is_empty());
        }
        let fresh = exec_event("fresh", "cont-1", 0);
        assert!(correlator.process(&fresh).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn threshold_of_one_fires_immediately() {
        let correlator = correlator(vec![threshold_rule(1, 60)], vec![]);
        let event = exec_event("solo", "cont-1", 0);
        let alerts = correlator.process(&event).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].event_ids, vec!["solo".to_string()]);
    }

    #[tokio::test]
    async fn events_without_a_group_key_are_ignored() {
        let correlator = correlator(vec![threshold_rule(1, 60)], vec![]);
        let mut event = exec_event("no-container", "x", 0);
        event.container = None;
        assert!(correlator.process(&event).await.unwrap().is_empty());
    }

    fn token_then_connect_sequence() -> SequenceRule {
        SequenceRule {
            id: "seq-1".to_string(),
            name: "Token theft chain".to_string(),
            description: "Token read followed by external connect".to_string(),
            steps: vec![
                "event.event_type == 'file_open' && event.process.cmdline.contains('serviceaccount/token')"
                    .to_string(),
                "event.event_type == 'network_connect' && !event.network.dst_ip.startsWith('10.')"
                    .to_string(),
            ],
            window_secs: 300,
            group_by: "container.container_id".to_string(),
            severity: Severity::Critical,
            response: "kill_pod".to_string(),
            enabled: true,
        }
    }

    fn token_read_event(id: &str, container_id: &str) -> RuntimeEvent {
        let mut event = exec_event(id, container_id, 0);
        event.event_type = "file_open".to_string();
        event.process.as_mut().unwrap().cmdline =
            "cat /var/run/secrets/kubernetes.io/serviceaccount/token".to_string();
        event
    }

    fn connect_event(id: &str, container_id: &str) -> RuntimeEvent {
        let mut event = exec_event(id, container_id, 0);
        event.event_type = "network_connect".to_string();
        event.network = Some(crate::model::NetworkInfo {
            dst_ip: "203.0.113.9".to_string(),
            dst_port: 4444,
            proto: "tcp".to_string(),
            dst_domain: String::new(),
        });
        event
    }

    #[tokio::test]
    async fn sequence_fires_in_order_and_clears() {
        let correlator = correlator(vec![], vec![token_then_connect_sequence()]);

        let step0 = token_read_event("s0", "cont-1");
        assert!(correlator.process(&step0).await.unwrap().is_empty());

        let step1 = connect_event("s1", "cont-1");
        let alerts = correlator.process(&step1).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].event_ids, vec!["s0".to_string(), "s1".to_string()]);

        // Consumed on completion: the second step alone does not re-fire.
        let lone = connect_event("s2", "cont-1");
        assert!(correlator.process(&lone).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sequence_accepts_out_of_order_arrival() {
        let correlator = correlator(vec![], vec![token_then_connect_sequence()]);

        let step1 = connect_event("s1", "cont-1");
        assert!(correlator.process(&step1).await.unwrap().is_empty());

        let step0 = token_read_event("s0", "cont-1");
        let alerts = correlator.process(&step0).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].event_ids, vec!["s0".to_string(), "s1".to_string()]);
    }

    #[tokio::test]
    async fn single_step_sequence_fires_and_clears() {
        let mut rule = token_then_connect_sequence();
        rule.steps.truncate(1);
        let correlator = correlator(vec![], vec![rule]);

        let step0 = token_read_event("only", "cont-1");
        let alerts = correlator.process(&step0).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].event_ids, vec!["only".to_string()]);
    }

    struct FailingStore;

    #[async_trait]
    impl CorrelationStore for FailingStore {
        async fn window_add(&self, _: &str, _: i64, _: String, _: Duration) -> Result<()> {
            Err(SentryError::Store("connection refused".to_string()))
        }
        async fn window_remove_below(&self, _: &str, _: i64) -> Result<()> {
            Err(SentryError::Store("connection refused".to_string()))
        }
        async fn window_range(&self, _: &str, _: i64, _: i64) -> Result<Vec<String>> {
            Err(SentryError::Store("connection refused".to_string()))
        }
        async fn step_set(&self, _: &str, _: usize, _: &str, _: Duration) -> Result<()> {
            Err(SentryError::Store("connection refused".to_string()))
        }
        async fn step_all(&self, _: &str) -> Result<HashMap<usize, String>> {
            Err(SentryError::Store("connection refused".to_string()))
        }
        async fn delete(&self, _: &str) -> Result<()> {
            Err(SentryError::Store("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn store_failures_surface_as_retryable() {
        let correlator =
            Correlator::new(Arc::new(FailingStore), vec![threshold_rule(1, 60)], vec![]).unwrap();
        let event = exec_event("e1", "cont-1", 0);
        let err = correlator.process(&event).await.unwrap_err();
        assert!(err.retryable());
    }
}
