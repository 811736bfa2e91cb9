// src/respond/mod.rs
//!
//! Response stage: translate an alert's response tag into one bounded
//! action against the orchestrator, guarded and audited.
//!
//! Guardrails run before any destructive call: protected namespaces block,
//! control-plane nodes block, the `security.response=manual` pod label
//! skips, and missing target fields fail. Every attempted action leaves
//! exactly one action-log row with a terminal status; a blocked or skipped
//! action is an outcome, not an error. Orchestrator failures are terminal
//! for the action; the alert bus is the retry mechanism upstream.

pub mod kube;

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

use crate::bus::{self, MessageBus};
use crate::error::{Result, SentryError};
use crate::logging::{ResponseRecord, SecurityLogger};
use crate::model::{ActionLog, ActionStatus, Alert};
use crate::store::incidents::IncidentStore;

pub const ACTION_KILL_POD: &str = "kill_pod";
pub const ACTION_QUARANTINE_NAMESPACE: &str = "quarantine_namespace";
pub const ACTION_ISOLATE_NODE: &str = "isolate_node";
pub const ACTION_EVIDENCE_BUNDLE: &str = "evidence_bundle";
pub const ACTION_NOTIFY: &str = "notify";
pub const ACTION_BLOCK_NETWORK: &str = "block_network";
pub const ACTION_REVOKE_CREDENTIALS: &str = "revoke_credentials";

/// Pods labelled this way are handled by a human, never automatically.
pub const MANUAL_OVERRIDE_LABEL: &str = "security.response";
pub const MANUAL_OVERRIDE_VALUE: &str = "manual";

const CONTROL_PLANE_LABELS: [&str; 2] = [
    "node-role.kubernetes.io/control-plane",
    "node-role.kubernetes.io/master",
];

/// Deadline for a single orchestrator mutation.
const ORCHESTRATOR_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The pod was already gone; for a kill that is mission accomplished.
    NotFound,
}

/// The orchestrator surface the responder needs. Implemented against the
/// Kubernetes REST API in `kube`; tests substitute a recording stub.
#[async_trait]
pub trait OrchestratorApi: Send + Sync {
    async fn pod_labels(&self, namespace: &str, pod: &str)
        -> Result<Option<HashMap<String, String>>>;
    async fn delete_pod(&self, namespace: &str, pod: &str) -> Result<DeleteOutcome>;
    async fn node_labels(&self, node: &str) -> Result<Option<HashMap<String, String>>>;
    async fn cordon_node(&self, node: &str) -> Result<()>;
    async fn quarantine_namespace(&self, namespace: &str) -> Result<()>;
    async fn isolate_pod_network(&self, namespace: &str, pod: &str) -> Result<()>;
    /// Delete the service account's token secrets, forcing a rotation.
    async fn revoke_service_account(&self, namespace: &str, service_account: &str) -> Result<()>;
}

/// Orchestrator stand-in for deployments without cluster credentials;
/// destructive actions fail cleanly instead of pretending.
pub struct OfflineOrchestrator;

#[async_trait]
impl OrchestratorApi for OfflineOrchestrator {
    async fn pod_labels(&self, _: &str, _: &str) -> Result<Option<HashMap<String, String>>> {
        Ok(None)
    }
    async fn delete_pod(&self, _: &str, _: &str) -> Result<DeleteOutcome> {
        Err(SentryError::Action("orchestrator not configured".to_string()))
    }
    async fn node_labels(&self, _: &str) -> Result<Option<HashMap<String, String>>> {
        Ok(None)
    }
    async fn cordon_node(&self, _: &str) -> Result<()> {
        Err(SentryError::Action("orchestrator not configured".to_string()))
    }
    async fn quarantine_namespace(&self, _: &str) -> Result<()> {
        Err(SentryError::Action("orchestrator not configured".to_string()))
    }
    async fn isolate_pod_network(&self, _: &str, _: &str) -> Result<()> {
        Err(SentryError::Action("orchestrator not configured".to_string()))
    }
    async fn revoke_service_account(&self, _: &str, _: &str) -> Result<()> {
        Err(SentryError::Action("orchestrator not configured".to_string()))
    }
}

struct Target {
    namespace: String,
    pod: String,
    node: String,
    service_account: String,
}

impl Target {
    fn from_alert(alert: &Alert) -> Self {
        let mut target = Target {
            namespace: String::new(),
            pod: String::new(),
            node: String::new(),
            service_account: String::new(),
        };
        if let Some(event) = &alert.event {
            target.node = event.node_id.clone();
            if let Some(container) = &event.container {
                target.namespace = container.namespace.clone();
                target.pod = container.pod.clone();
                target.service_account = container.service_account.clone();
            }
        }
        target
    }
}

pub struct Responder {
    orchestrator: Arc<dyn OrchestratorApi>,
    store: Arc<dyn IncidentStore>,
    protected_namespaces: HashSet<String>,
    logger: SecurityLogger,
}

impl Responder {
    pub fn new(
        orchestrator: Arc<dyn OrchestratorApi>,
        store: Arc<dyn IncidentStore>,
        protected_namespaces: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            orchestrator,
            store,
            protected_namespaces: protected_namespaces.into_iter().collect(),
            logger: SecurityLogger::new("podsentry", "respond"),
        }
    }

    pub async fn handle_alert(&self, alert: &Alert) -> Result<()> {
        if alert.response.is_empty() {
            return Ok(());
        }
        let target = Target::from_alert(alert);

        // Manual-override label: a human owns responses for this pod.
        // Operationally distinct from blocked, hence skipped.
        if !target.namespace.is_empty() && !target.pod.is_empty() {
            let labels = self
                .orchestrator
                .pod_labels(&target.namespace, &target.pod)
                .await
                .unwrap_or(None);
            let manual = labels
                .as_ref()
                .and_then(|l| l.get(MANUAL_OVERRIDE_LABEL))
                .map(|v| v == MANUAL_OVERRIDE_VALUE)
                .unwrap_or(false);
            if manual {
                self.log_action(
                    alert,
                    &alert.response,
                    &target.pod,
                    ActionStatus::Skipped,
                    "pod has security.response=manual label",
                    "manual override label",
                    0,
                )
                .await;
                return Ok(());
            }
        }

        match alert.response.as_str() {
            ACTION_KILL_POD => self.execute_kill_pod(alert, &target).await,
            ACTION_QUARANTINE_NAMESPACE => self.execute_quarantine(alert, &target).await,
            ACTION_ISOLATE_NODE => self.execute_isolate_node(alert, &target).await,
            ACTION_BLOCK_NETWORK => self.execute_block_network(alert, &target).await,
            ACTION_EVIDENCE_BUNDLE => {
                let bundle_id = Uuid::new_v4().to_string();
                self.log_action(
                    alert,
                    ACTION_EVIDENCE_BUNDLE,
                    &bundle_id,
                    ActionStatus::Success,
                    "evidence collected",
                    "",
                    0,
                )
                .await;
                Ok(())
            }
            ACTION_NOTIFY => self.execute_notify(alert, &target).await,
            ACTION_REVOKE_CREDENTIALS => self.execute_revoke_credentials(alert, &target).await,
            unknown => {
                log::info!(
                    "unknown response action '{}' on alert {}, skipping",
                    unknown,
                    alert.id
                );
                Ok(())
            }
        }
    }

    async fn execute_kill_pod(&self, alert: &Alert, target: &Target) -> Result<()> {
        let started = Instant::now();

        if self.protected_namespaces.contains(&target.namespace) {
            self.log_action(
                alert,
                ACTION_KILL_POD,
                &target.pod,
                ActionStatus::Blocked,
                "protected namespace",
                "namespace is protected",
                0,
            )
            .await;
            return Ok(());
        }
        if target.namespace.is_empty() || target.pod.is_empty() {
            let missing = if target.namespace.is_empty() { "missing namespace" } else { "missing pod name" };
            self.log_action(alert, ACTION_KILL_POD, "unknown", ActionStatus::Failed, missing, "", 0)
                .await;
            return Ok(());
        }

        let target_str = format!("{}/{}", target.namespace, target.pod);
        let outcome = tokio::time::timeout(
            ORCHESTRATOR_DEADLINE,
            self.orchestrator.delete_pod(&target.namespace, &target.pod),
        )
        .await
        .unwrap_or_else(|_| Err(SentryError::Action("deadline exceeded".to_string())));
        let duration_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok(DeleteOutcome::Deleted) => {
                self.log_action(
                    alert,
                    ACTION_KILL_POD,
                    &target_str,
                    ActionStatus::Success,
                    "pod terminated",
                    "",
                    duration_ms,
                )
                .await;
            }
            Ok(DeleteOutcome::NotFound) => {
                self.log_action(
                    alert,
                    ACTION_KILL_POD,
                    &target_str,
                    ActionStatus::Success,
                    "pod already gone",
                    "",
                    duration_ms,
                )
                .await;
            }
            Err(e) => {
                self.log_action(
                    alert,
                    ACTION_KILL_POD,
                    &target_str,
                    ActionStatus::Failed,
                    &e.to_string(),
                    "",
                    duration_ms,
                )
                .await;
            }
        }
        Ok(())
    }

    async fn execute_quarantine(&self, alert: &Alert, target: &Target) -> Result<()> {
        let started = Instant::now();

        if self.protected_namespaces.contains(&target.namespace) {
            self.log_action(
                alert,
                ACTION_QUARANTINE_NAMESPACE,
                &target.namespace,
                ActionStatus::Blocked,
                "protected namespace",
                "namespace is protected",
                0,
            )
            .await;
            return Ok(());
        }
        if target.namespace.is_empty() {
            self.log_action(
                alert,
                ACTION_QUARANTINE_NAMESPACE,
                "unknown",
                ActionStatus::Failed,
                "missing namespace",
                "",
                0,
            )
            .await;
            return Ok(());
        }

        let outcome = tokio::time::timeout(
            ORCHESTRATOR_DEADLINE,
            self.orchestrator.quarantine_namespace(&target.namespace),
        )
        .await
        .unwrap_or_else(|_| Err(SentryError::Action("deadline exceeded".to_string())));
        let duration_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok(()) => {
                self.log_action(
                    alert,
                    ACTION_QUARANTINE_NAMESPACE,
                    &target.namespace,
                    ActionStatus::Success,
                    "deny-all network policy applied",
                    "",
                    duration_ms,
                )
                .await;
            }
            Err(e) => {
                self.log_action(
                    alert,
                    ACTION_QUARANTINE_NAMESPACE,
                    &target.namespace,
                    ActionStatus::Failed,
                    &e.to_string(),
                    "",
                    duration_ms,
                )
                .await;
            }
        }
        Ok(())
    }

    async fn execute_isolate_node(&self, alert: &Alert, target: &Target) -> Result<()> {
        let started = Instant::now();

        if target.node.is_empty() {
            self.log_action(
                alert,
                ACTION_ISOLATE_NODE,
                "unknown",
                ActionStatus::Failed,
                "missing node name",
                "",
                0,
            )
            .await;
            return Ok(());
        }

        let labels = match self.orchestrator.node_labels(&target.node).await {
            Ok(Some(labels)) => labels,
            Ok(None) => {
                self.log_action(
                    alert,
                    ACTION_ISOLATE_NODE,
                    &target.node,
                    ActionStatus::Failed,
                    "node not found",
                    "",
                    started.elapsed().as_millis() as i64,
                )
                .await;
                return Ok(());
            }
            Err(e) => {
                self.log_action(
                    alert,
                    ACTION_ISOLATE_NODE,
                    &target.node,
                    ActionStatus::Failed,
                    &e.to_string(),
                    "",
                    started.elapsed().as_millis() as i64,
                )
                .await;
                return Ok(());
            }
        };

        // The control plane is never cordoned automatically.
        if CONTROL_PLANE_LABELS.iter().any(|l| labels.contains_key(*l)) {
            self.log_action(
                alert,
                ACTION_ISOLATE_NODE,
                &target.node,
                ActionStatus::Blocked,
                "control plane node",
                "cannot isolate control plane",
                0,
            )
            .await;
            return Ok(());
        }

        let outcome = tokio::time::timeout(
            ORCHESTRATOR_DEADLINE,
            self.orchestrator.cordon_node(&target.node),
        )
        .await
        .unwrap_or_else(|_| Err(SentryError::Action("deadline exceeded".to_string())));
        let duration_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok(()) => {
                self.log_action(
                    alert,
                    ACTION_ISOLATE_NODE,
                    &target.node,
                    ActionStatus::Success,
                    "node cordoned",
                    "",
                    duration_ms,
                )
                .await;
            }
            Err(e) => {
                self.log_action(
                    alert,
                    ACTION_ISOLATE_NODE,
                    &target.node,
                    ActionStatus::Failed,
                    &e.to_string(),
                    "",
                    duration_ms,
                )
                .await;
            }
        }
        Ok(())
    }

    async fn execute_block_network(&self, alert: &Alert, target: &Target) -> Result<()> {
        let started = Instant::now();

        if self.protected_namespaces.contains(&target.namespace) {
            self.log_action(
                alert,
                ACTION_BLOCK_NETWORK,
                &target.pod,
                ActionStatus::Blocked,
                "protected namespace",
                "namespace is protected",
                0,
            )
            .await;
            return Ok(());
        }
        if target.namespace.is_empty() || target.pod.is_empty() {
            let missing = if target.namespace.is_empty() { "missing namespace" } else { "missing pod name" };
            self.log_action(alert, ACTION_BLOCK_NETWORK, "unknown", ActionStatus::Failed, missing, "", 0)
                .await;
            return Ok(());
        }

        let target_str = format!("{}/{}", target.namespace, target.pod);
        let outcome = tokio::time::timeout(
            ORCHESTRATOR_DEADLINE,
            self.orchestrator
                .isolate_pod_network(&target.namespace, &target.pod),
        )
        .await
        .unwrap_or_else(|_| Err(SentryError::Action("deadline exceeded".to_string())));
        let duration_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok(()) => {
                self.log_action(
                    alert,
                    ACTION_BLOCK_NETWORK,
                    &target_str,
                    ActionStatus::Success,
                    "pod network isolated",
                    "",
                    duration_ms,
                )
                .await;
            }
            Err(e) => {
                self.log_action(
                    alert,
                    ACTION_BLOCK_NETWORK,
                    &target_str,
                    ActionStatus::Failed,
                    &e.to_string(),
                    "",
                    duration_ms,
                )
                .await;
            }
        }
        Ok(())
    }

    async fn execute_notify(&self, alert: &Alert, target: &Target) -> Result<()> {
        if self.protected_namespaces.contains(&target.namespace) {
            self.log_action(
                alert,
                ACTION_NOTIFY,
                &alert.rule_name,
                ActionStatus::Blocked,
                "protected namespace",
                "namespace is protected",
                0,
            )
            .await;
            return Ok(());
        }
        self.log_action(
            alert,
            ACTION_NOTIFY,
            &alert.rule_name,
            ActionStatus::Success,
            "notification dispatched",
            "",
            0,
        )
        .await;
        Ok(())
    }

    async fn execute_revoke_credentials(&self, alert: &Alert, target: &Target) -> Result<()> {
        let started = Instant::now();

        if self.protected_namespaces.contains(&target.namespace) {
            self.log_action(
                alert,
                ACTION_REVOKE_CREDENTIALS,
                &target.service_account,
                ActionStatus::Blocked,
                "protected namespace",
                "namespace is protected",
                0,
            )
            .await;
            return Ok(());
        }
        if target.namespace.is_empty() || target.service_account.is_empty() {
            let missing = if target.namespace.is_empty() {
                "missing namespace"
            } else {
                "missing service account"
            };
            self.log_action(
                alert,
                ACTION_REVOKE_CREDENTIALS,
                "unknown",
                ActionStatus::Failed,
                missing,
                "",
                0,
            )
            .await;
            return Ok(());
        }

        let target_str = format!("{}/{}", target.namespace, target.service_account);
        let outcome = tokio::time::timeout(
            ORCHESTRATOR_DEADLINE,
            self.orchestrator
                .revoke_service_account(&target.namespace, &target.service_account),
        )
        .await
        .unwrap_or_else(|_| Err(SentryError::Action("deadline exceeded".to_string())));
        let duration_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok(()) => {
                self.log_action(
                    alert,
                    ACTION_REVOKE_CREDENTIALS,
                    &target_str,
                    ActionStatus::Success,
                    "service account token secrets deleted",
                    "",
                    duration_ms,
                )
                .await;
            }
            Err(e) => {
                self.log_action(
                    alert,
                    ACTION_REVOKE_CREDENTIALS,
                    &target_str,
                    ActionStatus::Failed,
                    &e.to_string(),
                    "",
                    duration_ms,
                )
                .await;
            }
        }
        Ok(())
    }

    /// One audit row per attempted action, terminal status only, plus the
    /// structured response log line.
    async fn log_action(
        &self,
        alert: &Alert,
        action_type: &str,
        target: &str,
        status: ActionStatus,
        message: &str,
        block_reason: &str,
        duration_ms: i64,
    ) {
        let row = ActionLog {
            id: Uuid::new_v4().to_string(),
            incident_id: alert.incident_id.clone(),
            action_type: action_type.to_string(),
            target: target.to_string(),
            status,
            message: message.to_string(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.insert_action_log(&row).await {
            log::error!("failed to persist action log {}: {}", row.id, e);
        }

        self.logger.response(
            message,
            &ResponseRecord {
                action: action_type,
                status,
                target,
                blocked: !block_reason.is_empty(),
                block_reason,
                duration_ms,
                incident_id: &alert.incident_id,
            },
        );
    }
}

/// Run the response stage until shutdown.
pub async fn run_responder(
    responder: Arc<Responder>,
    bus_handle: Arc<dyn MessageBus>,
    pool: usize,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut workers = Vec::new();
    for _ in 0..pool.max(1) {
        let mut rx = bus_handle
            .queue_subscribe(bus::SUBJECT_ALERTS_PROCESSED, bus::GROUP_RESPOND)
            .await?;
        let responder = Arc::clone(&responder);
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
                                log::error!("failed to decode processed alert: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = responder.handle_alert(&alert).await {
                            log::error!("response handling failed for alert {}: {}", alert.id, e);
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
    use crate::model::{ContainerInfo, RuntimeEvent, Severity};
    use crate::store::incidents::SledIncidentStore;
    use crate::tests::fixtures::StubOrchestrator;

    fn alert(response: &str, namespace: &str, pod: &str) -> Alert {
        Alert {
            id: "a1".to_string(),
            timestamp: Utc::now(),
            rule_name: "Shell Spawn in Prod".to_string(),
            severity: Severity::High,
            description: "shell in prod".to_string(),
            event: Some(RuntimeEvent {
                timestamp: Utc::now(),
                cluster_id: "c1".to_string(),
                node_id: "node-1".to_string(),
                event_type: "process_exec".to_string(),
                event_id: "e1".to_string(),
                process: None,
                container: Some(ContainerInfo {
                    namespace: namespace.to_string(),
                    pod: pod.to_string(),
                    ..Default::default()
                }),
                network: None,
            }),
            incident_id: "inc-1".to_string(),
            response: response.to_string(),
            event_ids: Vec::new(),
        }
    }

    fn responder(orchestrator: Arc<StubOrchestrator>, store: Arc<SledIncidentStore>) -> Responder {
        Responder::new(
            orchestrator,
            store,
            ["kube-system".to_string(), "security-system".to_string()],
        )
    }

    async fn single_action(store: &SledIncidentStore) -> ActionLog {
        let mut rows = store.actions_for_incident("inc-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        rows.pop().unwrap()
    }

    #[tokio::test]
    async fn kill_pod_succeeds_and_audits() {
        let orchestrator = Arc::new(StubOrchestrator::default());
        let store = Arc::new(SledIncidentStore::temporary().unwrap());
        let responder = responder(orchestrator.clone(), store.clone());

        responder.handle_alert(&alert("kill_pod", "prod", "p1")).await.unwrap();

        let row = single_action(&store).await;
        assert_eq!(row.action_type, "kill_pod");
        assert_eq!(row.target, "prod/p1");
        assert_eq!(row.status, ActionStatus::Success);
        assert_eq!(
            orchestrator.deleted_pods.lock().unwrap().as_slice(),
            ["prod/p1".to_string()]
        );
    }

    #[tokio::test]
    async fn protected_namespace_blocks_before_the_call() {
        let orchestrator = Arc::new(StubOrchestrator::default());
        let store = Arc::new(SledIncidentStore::temporary().unwrap());
        let responder = responder(orchestrator.clone(), store.clone());

        responder
            .handle_alert(&alert("kill_pod", "kube-system", "coredns-abc"))
            .await
            .unwrap();

        let row = single_action(&store).await;
        assert_eq!(row.status, ActionStatus::Blocked);
        assert!(orchestrator.deleted_pods.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn manual_override_label_skips() {
        let orchestrator = Arc::new(StubOrchestrator::default());
        orchestrator.pod_labels.lock().unwrap().insert(
            "prod/p1".to_string(),
            HashMap::from([("security.response".to_string(), "manual".to_string())]),
        );
        let store = Arc::new(SledIncidentStore::temporary().unwrap());
        let responder = responder(orchestrator.clone(), store.clone());

        responder.handle_alert(&alert("kill_pod", "prod", "p1")).await.unwrap();

        let row = single_action(&store).await;
        assert_eq!(row.status, ActionStatus::Skipped);
        assert!(orchestrator.deleted_pods.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn control_plane_node_is_never_cordoned() {
        let orchestrator = Arc::new(StubOrchestrator::default());
        orchestrator.node_labels.lock().unwrap().insert(
            "node-1".to_string(),
            HashMap::from([(
                "node-role.kubernetes.io/control-plane".to_string(),
                String::new(),
            )]),
        );
        let store = Arc::new(SledIncidentStore::temporary().unwrap());
        let responder = responder(orchestrator.clone(), store.clone());

        responder
            .handle_alert(&alert("isolate_node", "prod", "p1"))
            .await
            .unwrap();

        let row = single_action(&store).await;
        assert_eq!(row.status, ActionStatus::Blocked);
        assert!(orchestrator.cordoned_nodes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_target_fields_fail() {
        let orchestrator = Arc::new(StubOrchestrator::default());
        let store = Arc::new(SledIncidentStore::temporary().unwrap());
        let responder = responder(orchestrator, store.clone());

        responder.handle_alert(&alert("kill_pod", "", "")).await.unwrap();

        let row = single_action(&store).await;
        assert_eq!(row.status, ActionStatus::Failed);
        assert!(row.message.contains("missing"));
    }

    #[tokio::test]
    async fn empty_and_unknown_responses_do_nothing() {
        let orchestrator = Arc::new(StubOrchestrator::default());
        let store = Arc::new(SledIncidentStore::temporary().unwrap());
        let responder = responder(orchestrator, store.clone());

        responder.handle_alert(&alert("", "prod", "p1")).await.unwrap();
        responder
            .handle_alert(&alert("launch_the_fleet", "prod", "p1"))
            .await
            .unwrap();

        assert!(store.actions_for_incident("inc-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn revoke_credentials_deletes_token_secrets() {
        let orchestrator = Arc::new(StubOrchestrator::default());
        let store = Arc::new(SledIncidentStore::temporary().unwrap());
        let responder = responder(orchestrator.clone(), store.clone());

        let mut alert = alert("revoke_credentials", "prod", "p1");
        alert
            .event
            .as_mut()
            .unwrap()
            .container
            .as_mut()
            .unwrap()
            .service_account = "runner".to_string();
        responder.handle_alert(&alert).await.unwrap();

        let row = single_action(&store).await;
        assert_eq!(row.status, ActionStatus::Success);
        assert_eq!(row.target, "prod/runner");
        assert_eq!(
            orchestrator.revoked.lock().unwrap().as_slice(),
            ["prod/runner".to_string()]
        );
    }

    #[tokio::test]
    async fn revoke_credentials_without_a_service_account_fails() {
        let orchestrator = Arc::new(StubOrchestrator::default());
        let store = Arc::new(SledIncidentStore::temporary().unwrap());
        let responder = responder(orchestrator.clone(), store.clone());

        responder
            .handle_alert(&alert("revoke_credentials", "prod", "p1"))
            .await
            .unwrap();

        let row = single_action(&store).await;
        assert_eq!(row.status, ActionStatus::Failed);
        assert!(row.message.contains("missing service account"));
        assert!(orchestrator.revoked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn notify_and_revoke_respect_protected_namespaces() {
        let orchestrator = Arc::new(StubOrchestrator::default());
        let store = Arc::new(SledIncidentStore::temporary().unwrap());
        let responder = responder(orchestrator.clone(), store.clone());

        let mut revoke = alert("revoke_credentials", "kube-system", "p1");
        revoke
            .event
            .as_mut()
            .unwrap()
            .container
            .as_mut()
            .unwrap()
            .service_account = "default".to_string();
        responder.handle_alert(&revoke).await.unwrap();
        responder
            .handle_alert(&alert("notify", "kube-system", "p1"))
            .await
            .unwrap();

        let rows = store.actions_for_incident("inc-1").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.status == ActionStatus::Blocked));
        assert!(orchestrator.revoked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_orchestrator_call_audits_failed() {
        let store = Arc::new(SledIncidentStore::temporary().unwrap());
        let responder = Responder::new(
            Arc::new(OfflineOrchestrator),
            store.clone(),
            ["kube-system".to_string()],
        );

        responder.handle_alert(&alert("kill_pod", "prod", "p1")).await.unwrap();

        let row = single_action(&store).await;
        assert_eq!(row.status, ActionStatus::Failed);
    }
}
