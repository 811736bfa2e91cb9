// src/api/tls.rs
// Mutual TLS for the ingress listener: clients must present a certificate
// signed by the configured CA.

use axum::extract::Request;
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tower::Service;

use crate::config::TlsMaterial;
use crate::error::{Result, SentryError};

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| SentryError::Config(format!("open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| SentryError::Config(format!("parse {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(SentryError::Config(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| SentryError::Config(format!("open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| SentryError::Config(format!("parse {}: {}", path.display(), e)))?
        .ok_or_else(|| SentryError::Config(format!("no private key in {}", path.display())))
}

pub fn build_server_config(material: &TlsMaterial) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(&material.cert_file)?;
    let key = load_key(&material.key_file)?;

    let mut roots = RootCertStore::empty();
    for ca_cert in load_certs(&material.ca_file)? {
        roots
            .add(ca_cert)
            .map_err(|e| SentryError::Config(format!("bad CA certificate: {}", e)))?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| SentryError::Config(format!("client verifier: {}", e)))?;

    let mut config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| SentryError::Config(format!("server certificate: {}", e)))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Accept loop terminating TLS per connection. Handshake failures, which
/// include clients without a valid certificate, drop the connection and
/// never reach a handler.
pub async fn serve_mtls(
    address: SocketAddr,
    app: Router,
    config: Arc<ServerConfig>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(config);
    let listener = TcpListener::bind(address)
        .await
        .map_err(|e| SentryError::Api(format!("failed to bind {}: {}", address, e)))?;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::warn!("accept failed: {}", e);
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let tower_service = app.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            log::debug!("TLS handshake with {} failed: {}", peer, e);
                            return;
                        }
                    };
                    let hyper_service =
                        hyper::service::service_fn(move |request: Request<Incoming>| {
                            tower_service.clone().call(request)
                        });
                    if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection_with_upgrades(TokioIo::new(tls_stream), hyper_service)
                        .await
                    {
                        log::debug!("connection from {} ended: {}", peer, e);
                    }
                });
            }
        }
    }
    Ok(())
}
