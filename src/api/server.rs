// src/api/server.rs
// Router construction and the serving loop, plain or mutual TLS.

use axum::routing::{get, patch, post};
use axum::Router;
use http::Method;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

use crate::api::handlers::{self, AppState};
use crate::api::tls;
use crate::config::TlsMaterial;
use crate::error::{Result, SentryError};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/v1/events", post(handlers::ingest_event))
        .route("/v1/alerts", get(handlers::list_alerts))
        .route("/v1/alerts/:id", get(handlers::get_alert))
        .route("/v1/incidents", get(handlers::list_incidents))
        .route("/v1/incidents/:id", get(handlers::get_incident))
        .route("/v1/incidents/:id", patch(handlers::update_incident))
        .route(
            "/v1/incidents/:id/timeline",
            get(handlers::get_incident_timeline),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::PATCH])
                .allow_headers(Any),
        )
        .with_state(state)
}

pub struct ApiServer {
    address: SocketAddr,
    state: Arc<AppState>,
    tls: Option<TlsMaterial>,
}

impl ApiServer {
    pub fn new(address: SocketAddr, state: Arc<AppState>, tls: Option<TlsMaterial>) -> Self {
        Self {
            address,
            state,
            tls,
        }
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let app = router(self.state);

        match &self.tls {
            Some(material) => {
                log::info!("API listening on {} with mutual TLS", self.address);
                let config = tls::build_server_config(material)?;
                tls::serve_mtls(self.address, app, config, shutdown).await
            }
            None => {
                log::info!("API listening on {} without TLS (dev mode)", self.address);
                let listener = tokio::net::TcpListener::bind(self.address)
                    .await
                    .map_err(|e| {
                        SentryError::Api(format!("failed to bind {}: {}", self.address, e))
                    })?;
                let mut shutdown = shutdown;
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown.changed().await;
                    })
                    .await
                    .map_err(|e| SentryError::Api(format!("server error: {}", e)))
            }
        }
    }
}
