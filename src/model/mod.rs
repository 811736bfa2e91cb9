// src/model/mod.rs
//!
//! Core data model for the detection pipeline
//!
//! Every entity that crosses a stage boundary lives here: runtime events as
//! reported by host agents, detection rules, the alerts they produce, the
//! incidents alerts are grouped into, and the audit rows response actions
//! leave behind. Events travel the bus as JSON; absent sub-documents are
//! absent on the wire, never null, so predicates can test presence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique event identifier, client-supplied
pub type EventId = String;
/// Unique rule identifier
pub type RuleId = String;
/// Unique incident identifier
pub type IncidentId = String;

fn default_timestamp() -> DateTime<Utc> {
    Utc::now()
}

fn default_true() -> bool {
    true
}

/// Severity levels for rules, alerts and incidents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    #[serde(rename = "critical")]
    Critical,
    #[serde(rename = "high")]
    High,
    #[serde(rename = "medium")]
    Medium,
    #[serde(rename = "low")]
    Low,
}

/// A single observation emitted by a host agent.
///
/// Identity fields (`event_id`, `timestamp`, `cluster_id`, `node_id`,
/// `event_type`) are immutable once ingested; enrichment only rewrites the
/// container sub-document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    #[serde(rename = "ts", default = "default_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub event_id: EventId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    #[serde(default)]
    pub pid: i64,
    #[serde(default)]
    pub ppid: i64,
    #[serde(default)]
    pub uid: i64,
    #[serde(default)]
    pub gid: i64,
    #[serde(default)]
    pub exe: String,
    #[serde(default)]
    pub cmdline: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub has_tty: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities_added: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub image_digest: String,
    #[serde(default)]
    pub pod: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub service_account: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    #[serde(default)]
    pub dst_ip: String,
    #[serde(default)]
    pub dst_port: i64,
    #[serde(default)]
    pub proto: String,
    #[serde(default)]
    pub dst_domain: String,
}

/// Declarative detection rule: a named, severity-tagged predicate plus a
/// response tag consumed by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub severity: Severity,
    pub condition: String,
    #[serde(default)]
    pub response: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Produced when a rule predicate holds on an event or a correlation
/// pattern completes. `id` and `timestamp` are assigned when the alert is
/// published, keeping rule evaluation itself pure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub rule_name: String,
    pub severity: Severity,
    #[serde(default)]
    pub description: String,
    pub event: Option<RuntimeEvent>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub incident_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub response: String,
    /// Ids of every event that contributed to a correlated alert, in
    /// pattern order. Empty for single-event alerts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_ids: Vec<EventId>,
}

impl Alert {
    /// Alert candidate for a stateless rule match. Deterministic: identity
    /// fields stay unassigned until publish time.
    pub fn candidate(rule: &Rule, event: &RuntimeEvent) -> Self {
        Self {
            id: String::new(),
            timestamp: event.timestamp,
            rule_name: rule.name.clone(),
            severity: rule.severity,
            description: rule.description.clone(),
            event: Some(event.clone()),
            incident_id: String::new(),
            response: rule.response.clone(),
            event_ids: Vec::new(),
        }
    }
}

/// Incident lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncidentStatus {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "investigating")]
    Investigating,
    #[serde(rename = "contained")]
    Contained,
    #[serde(rename = "resolved")]
    Resolved,
}

impl IncidentStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(IncidentStatus::Open),
            "investigating" => Some(IncidentStatus::Investigating),
            "contained" => Some(IncidentStatus::Contained),
            "resolved" => Some(IncidentStatus::Resolved),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "open",
            IncidentStatus::Investigating => "investigating",
            IncidentStatus::Contained => "contained",
            IncidentStatus::Resolved => "resolved",
        }
    }

    /// Lifecycle moves forward only; any state may jump straight to resolved.
    pub fn allows_transition(&self, to: IncidentStatus) -> bool {
        if to == IncidentStatus::Resolved || *self == to {
            return true;
        }
        matches!(
            (self, to),
            (IncidentStatus::Open, IncidentStatus::Investigating)
                | (IncidentStatus::Open, IncidentStatus::Contained)
                | (IncidentStatus::Investigating, IncidentStatus::Contained)
        )
    }
}

/// A stateful grouping of related alerts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub status: IncidentStatus,
    pub severity: Severity,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub alert_ids: Vec<String>,
    #[serde(rename = "triggering_event_id", default)]
    pub triggering_event: String,
}

/// Terminal and transient states of a response action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "executing")]
    Executing,
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "blocked")]
    Blocked,
    #[serde(rename = "skipped")]
    Skipped,
}

/// Append-only audit row, one per attempted response action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLog {
    pub id: String,
    #[serde(default)]
    pub incident_id: String,
    pub action_type: String,
    pub target: String,
    pub status: ActionStatus,
    #[serde(default)]
    pub message: String,
    pub created_at: DateTime<Utc>,
}
