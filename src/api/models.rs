// src/api/models.rs
// Request/response bodies for the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ActionLog, ActionStatus, Alert, Severity};

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self { status: "ok" }
    }

    pub fn accepted() -> Self {
        Self { status: "accepted" }
    }

    pub fn updated() -> Self {
        Self { status: "updated" }
    }
}

/// Alert listing row; the embedded event is only returned on single fetch.
#[derive(Debug, Clone, Serialize)]
pub struct AlertSummary {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub rule_name: String,
    pub severity: Severity,
    pub description: String,
    pub incident_id: String,
    pub response: String,
}

impl From<&Alert> for AlertSummary {
    fn from(alert: &Alert) -> Self {
        Self {
            id: alert.id.clone(),
            timestamp: alert.timestamp,
            rule_name: alert.rule_name.clone(),
            severity: alert.severity,
            description: alert.description.clone(),
            incident_id: alert.incident_id.clone(),
            response: alert.response.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateIncidentRequest {
    pub status: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncidentsQuery {
    pub status: Option<String>,
}

/// Merged, time-sorted incident history entry
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum TimelineEntry {
    #[serde(rename = "alert")]
    Alert {
        id: String,
        timestamp: DateTime<Utc>,
        rule_name: String,
        severity: Severity,
        description: String,
    },
    #[serde(rename = "action")]
    Action {
        id: String,
        timestamp: DateTime<Utc>,
        action_type: String,
        target: String,
        status: ActionStatus,
        message: String,
    },
}

impl TimelineEntry {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            TimelineEntry::Alert { timestamp, .. } => *timestamp,
            TimelineEntry::Action { timestamp, .. } => *timestamp,
        }
    }

    pub fn from_alert(alert: &Alert) -> Self {
        TimelineEntry::Alert {
            id: alert.id.clone(),
            timestamp: alert.timestamp,
            rule_name: alert.rule_name.clone(),
            severity: alert.severity,
            description: alert.description.clone(),
        }
    }

    pub fn from_action(row: &ActionLog) -> Self {
        TimelineEntry::Action {
            id: row.id.clone(),
            timestamp: row.created_at,
            action_type: row.action_type.clone(),
            target: row.target.clone(),
            status: row.status,
            message: row.message.clone(),
        }
    }
}
