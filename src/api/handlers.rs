// src/api/handlers.rs
// HTTP handlers for event ingress and the incident read API.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::Json;
use std::sync::Arc;

use crate::api::models::*;
use crate::archive::ArchiveWriter;
use crate::bus::{self, MessageBus};
use crate::error::{Result, SentryError};
use crate::model::{IncidentStatus, Incident, RuntimeEvent};
use crate::store::incidents::IncidentStore;

const LIST_LIMIT: usize = 100;

pub struct AppState {
    pub bus: Arc<dyn MessageBus>,
    pub store: Arc<dyn IncidentStore>,
    pub archive: Option<Arc<ArchiveWriter>>,
}

pub async fn health() -> Json<StatusResponse> {
    Json(StatusResponse::ok())
}

/// `POST /v1/events`: validate, republish on the per-source subject, feed
/// the cold archive. The original body bytes travel the bus untouched.
pub async fn ingest_event(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<StatusResponse>> {
    let event: RuntimeEvent = serde_json::from_slice(&body)
        .map_err(|_| SentryError::InvalidInput("invalid json".to_string()))?;

    if event.cluster_id.is_empty() || event.node_id.is_empty() {
        return Err(SentryError::InvalidInput(
            "missing cluster_id or node_id".to_string(),
        ));
    }

    let subject = bus::raw_subject(&event.cluster_id, &event.node_id);
    state
        .bus
        .publish(&subject, body.to_vec())
        .await
        .map_err(|e| SentryError::Api(e.to_string()))?;

    if let Some(archive) = &state.archive {
        if let Err(e) = archive.append(&event.cluster_id, &event.node_id, &body) {
            log::error!("archive append failed for event {}: {}", event.event_id, e);
        }
    }

    log::debug!(
        "event accepted: {} from {}/{}",
        event.event_type,
        event.cluster_id,
        event.node_id
    );
    Ok(Json(StatusResponse::accepted()))
}

pub async fn list_alerts(State(state): State<Arc<AppState>>) -> Result<Json<Vec<AlertSummary>>> {
    let alerts = state.store.list_alerts(LIST_LIMIT).await?;
    Ok(Json(alerts.iter().map(AlertSummary::from).collect()))
}

pub async fn get_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<crate::model::Alert>> {
    match state.store.get_alert(&id).await? {
        Some(alert) => Ok(Json(alert)),
        None => Err(SentryError::NotFound("alert not found".to_string())),
    }
}

pub async fn list_incidents(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IncidentsQuery>,
) -> Result<Json<Vec<Incident>>> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            IncidentStatus::parse(raw)
                .ok_or_else(|| SentryError::InvalidInput("invalid status".to_string()))?,
        ),
    };
    let incidents = state.store.list_incidents(status, LIST_LIMIT).await?;
    Ok(Json(incidents))
}

pub async fn get_incident(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Incident>> {
    match state.store.get_incident(&id).await? {
        Some(incident) => Ok(Json(incident)),
        None => Err(SentryError::NotFound("incident not found".to_string())),
    }
}

pub async fn update_incident(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<UpdateIncidentRequest>,
) -> Result<Json<StatusResponse>> {
    let status = IncidentStatus::parse(&request.status)
        .ok_or_else(|| SentryError::InvalidInput("invalid status".to_string()))?;

    let incident = state
        .store
        .get_incident(&id)
        .await?
        .ok_or_else(|| SentryError::NotFound("incident not found".to_string()))?;

    if !incident.status.allows_transition(status) {
        return Err(SentryError::InvalidInput(format!(
            "cannot transition {} to {}",
            incident.status.as_str(),
            status.as_str()
        )));
    }

    state.store.update_incident_status(&id, status).await?;
    Ok(Json(StatusResponse::updated()))
}

pub async fn get_incident_timeline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<TimelineEntry>>> {
    if state.store.get_incident(&id).await?.is_none() {
        return Err(SentryError::NotFound("incident not found".to_string()));
    }

    let mut entries: Vec<TimelineEntry> = state
        .store
        .alerts_for_incident(&id)
        .await?
        .iter()
        .map(TimelineEntry::from_alert)
        .chain(
            state
                .store
                .actions_for_incident(&id)
                .await?
                .iter()
                .map(TimelineEntry::from_action),
        )
        .collect();
    entries.sort_by_key(|e| e.timestamp());
    Ok(Json(entries))
}
