// src/config.rs
//!
//! Environment-backed configuration for all pipeline stages.
//!
//! Every stage reads the same `Config`; each ignores the parts it does not
//! use so a single process can run any stage subset. Missing variables fall
//! back to development defaults, unparsable values are fatal.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SentryError};

/// Paths to the PEM material for mutual TLS on the ingress listener
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub ca_file: PathBuf,
}

/// Connection settings for the orchestrator API
#[derive(Debug, Clone)]
pub struct KubeSettings {
    pub api_url: String,
    pub token_file: PathBuf,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_port: u16,
    pub store_path: PathBuf,
    pub archive_dir: PathBuf,
    pub rules_dir: Option<PathBuf>,
    pub tls: Option<TlsMaterial>,
    pub kube: Option<KubeSettings>,
    pub protected_namespaces: Vec<String>,
    pub flush_interval: Duration,
    pub drain_interval: Duration,
    pub worker_pool: usize,
    /// Largest correlation window in seconds; also the pod cache grace
    /// interval for late-arriving events
    pub max_window_secs: u64,
    /// Evaluate raw events in addition to enriched ones. Off by default:
    /// with both taps on, the same event is evaluated twice.
    pub detect_tap_raw: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: 8080,
            store_path: PathBuf::from("./data/podsentry"),
            archive_dir: PathBuf::from("./data/archive"),
            rules_dir: None,
            tls: None,
            kube: None,
            protected_namespaces: vec![
                "kube-system".to_string(),
                "security-system".to_string(),
            ],
            flush_interval: Duration::from_secs(60),
            drain_interval: Duration::from_secs(5),
            worker_pool: 8,
            max_window_secs: 300,
            detect_tap_raw: false,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: String) -> Result<T> {
    raw.parse()
        .map_err(|_| SentryError::Config(format!("invalid {}: {}", name, raw)))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(v) = env::var("LISTEN_PORT") {
            config.listen_port = parse_var("LISTEN_PORT", v)?;
        }
        if let Ok(v) = env::var("STORE_PATH") {
            config.store_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("ARCHIVE_DIR") {
            config.archive_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("RULES_DIR") {
            config.rules_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = env::var("PROTECTED_NAMESPACES") {
            config.protected_namespaces = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = env::var("FLUSH_INTERVAL_SECS") {
            config.flush_interval = Duration::from_secs(parse_var("FLUSH_INTERVAL_SECS", v)?);
        }
        if let Ok(v) = env::var("DRAIN_INTERVAL_SECS") {
            config.drain_interval = Duration::from_secs(parse_var("DRAIN_INTERVAL_SECS", v)?);
        }
        if let Ok(v) = env::var("WORKER_POOL") {
            config.worker_pool = parse_var("WORKER_POOL", v)?;
            if config.worker_pool == 0 {
                return Err(SentryError::Config("WORKER_POOL must be positive".to_string()));
            }
        }
        if let Ok(v) = env::var("MAX_WINDOW_SECS") {
            config.max_window_secs = parse_var("MAX_WINDOW_SECS", v)?;
        }
        if let Ok(v) = env::var("DETECT_TAP_RAW") {
            config.detect_tap_raw = matches!(v.as_str(), "1" | "true" | "yes");
        }

        // mTLS only when the full set of material is present
        match (
            env::var("TLS_CERT_FILE"),
            env::var("TLS_KEY_FILE"),
            env::var("TLS_CA_FILE"),
        ) {
            (Ok(cert), Ok(key), Ok(ca)) => {
                config.tls = Some(TlsMaterial {
                    cert_file: PathBuf::from(cert),
                    key_file: PathBuf::from(key),
                    ca_file: PathBuf::from(ca),
                });
            }
            (Err(_), Err(_), Err(_)) => {}
            _ => {
                return Err(SentryError::Config(
                    "TLS_CERT_FILE, TLS_KEY_FILE and TLS_CA_FILE must be set together".to_string(),
                ));
            }
        }

        if let Ok(api_url) = env::var("KUBE_API_URL") {
            let token_file = env::var("KUBE_TOKEN_FILE").unwrap_or_else(|_| {
                "/var/run/secrets/kubernetes.io/serviceaccount/token".to_string()
            });
            config.kube = Some(KubeSettings {
                api_url,
                token_file: PathBuf::from(token_file),
                insecure_skip_verify: matches!(
                    env::var("KUBE_INSECURE_SKIP_VERIFY").as_deref(),
                    Ok("1") | Ok("true")
                ),
            });
        }

        Ok(config)
    }

    pub fn is_protected_namespace(&self, namespace: &str) -> bool {
        self.protected_namespaces.iter().any(|ns| ns == namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_protect_system_namespaces() {
        let config = Config::default();
        assert!(config.is_protected_namespace("kube-system"));
        assert!(config.is_protected_namespace("security-system"));
        assert!(!config.is_protected_namespace("prod"));
    }
}
