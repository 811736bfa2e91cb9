// src/logging.rs

use log::{LevelFilter, SetLoggerError};
use serde_json::json;
use std::io::Write;
use std::sync::Once;

use crate::model::{ActionStatus, Alert};

/// Initialize the logging system with the specified log level
pub fn init_logging(level: LevelFilter) -> Result<(), SetLoggerError> {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        env_logger::Builder::new()
            .filter_level(level)
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{}] {} - {}",
                    buf.timestamp_millis(),
                    record.level(),
                    record.args()
                )
            })
            .init();
    });

    Ok(())
}

/// Structured record attached to every response-action log line
#[derive(Debug, Clone, serde::Serialize)]
pub struct ResponseRecord<'a> {
    pub action: &'a str,
    pub status: ActionStatus,
    pub target: &'a str,
    pub blocked: bool,
    #[serde(skip_serializing_if = "str::is_empty")]
    pub block_reason: &'a str,
    pub duration_ms: i64,
    #[serde(skip_serializing_if = "str::is_empty")]
    pub incident_id: &'a str,
}

/// Emits single-line JSON security events alongside the plain text log.
///
/// Detections and response outcomes are what operators grep for, so they get
/// a stable machine-readable shape; everything else goes through the normal
/// `log` macros.
#[derive(Debug, Clone)]
pub struct SecurityLogger {
    service: &'static str,
    component: &'static str,
}

impl SecurityLogger {
    pub fn new(service: &'static str, component: &'static str) -> Self {
        Self { service, component }
    }

    pub fn alert(&self, message: &str, alert: &Alert) {
        let record = json!({
            "kind": "alert",
            "service": self.service,
            "component": self.component,
            "message": message,
            "alert_id": alert.id,
            "rule": alert.rule_name,
            "severity": alert.severity,
            "event_id": alert.event.as_ref().map(|e| e.event_id.clone()).unwrap_or_default(),
            "response": alert.response,
        });
        log::warn!("{}", record);
    }

    pub fn response(&self, message: &str, record: &ResponseRecord<'_>) {
        let line = json!({
            "kind": "response",
            "service": self.service,
            "component": self.component,
            "message": message,
            "response": record,
        });
        log::info!("{}", line);
    }
}
