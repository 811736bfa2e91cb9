// src/respond/kube.rs
//!
//! Kubernetes REST client: the production `OrchestratorApi` implementation
//! and the polling pod watch that feeds the enricher index.
//!
//! Talks to the API server directly over HTTPS with the service account
//! bearer token. Only the handful of calls the pipeline needs exist here:
//! pod get/delete, node get/patch, and NetworkPolicy creation.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::KubeSettings;
use crate::enrich::{PodRecord, PodSnapshot, PodUpdate, PodWatch};
use crate::error::{Result, SentryError};
use crate::respond::{DeleteOutcome, OrchestratorApi};

const STRATEGIC_MERGE_PATCH: &str = "application/strategic-merge-patch+json";

#[derive(Debug, Deserialize, Default)]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    labels: HashMap<String, String>,
    #[serde(default)]
    annotations: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Default)]
struct PodSpec {
    #[serde(rename = "serviceAccountName", default)]
    service_account_name: String,
}

#[derive(Debug, Deserialize)]
struct ContainerStatus {
    #[serde(rename = "containerID", default)]
    container_id: String,
}

#[derive(Debug, Deserialize, Default)]
struct PodStatus {
    #[serde(rename = "containerStatuses", default)]
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Deserialize)]
struct PodObject {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: PodSpec,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<PodObject>,
}

#[derive(Debug, Deserialize)]
struct NodeObject {
    #[serde(default)]
    metadata: ObjectMeta,
}

const TOKEN_SECRET_TYPE: &str = "kubernetes.io/service-account-token";
const SERVICE_ACCOUNT_ANNOTATION: &str = "kubernetes.io/service-account.name";

#[derive(Debug, Deserialize)]
struct SecretObject {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(rename = "type", default)]
    secret_type: String,
}

#[derive(Debug, Deserialize)]
struct SecretList {
    #[serde(default)]
    items: Vec<SecretObject>,
}

fn api_error(context: &str, err: reqwest::Error) -> SentryError {
    SentryError::Action(format!("{}: {}", context, err))
}

pub struct KubeClient {
    http: reqwest::Client,
    base: String,
}

impl KubeClient {
    pub fn new(settings: &KubeSettings) -> Result<Self> {
        let mut headers = HeaderMap::new();
        match std::fs::read_to_string(&settings.token_file) {
            Ok(token) => {
                let value = format!("Bearer {}", token.trim());
                let value = HeaderValue::from_str(&value)
                    .map_err(|e| SentryError::Config(format!("invalid token: {}", e)))?;
                headers.insert(AUTHORIZATION, value);
            }
            Err(e) => {
                log::warn!(
                    "no service account token at {}: {}",
                    settings.token_file.display(),
                    e
                );
            }
        }

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(10));
        if settings.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder
            .build()
            .map_err(|e| SentryError::Config(format!("http client: {}", e)))?;

        Ok(Self {
            http,
            base: settings.api_url.trim_end_matches('/').to_string(),
        })
    }

    fn pod_url(&self, namespace: &str, pod: &str) -> String {
        format!("{}/api/v1/namespaces/{}/pods/{}", self.base, namespace, pod)
    }

    fn snapshot(pod: PodObject) -> PodSnapshot {
        PodSnapshot {
            container_ids: pod
                .status
                .container_statuses
                .into_iter()
                .map(|s| s.container_id)
                .filter(|id| !id.is_empty())
                .collect(),
            record: PodRecord {
                pod: pod.metadata.name,
                namespace: pod.metadata.namespace,
                service_account: pod.spec.service_account_name,
                labels: pod.metadata.labels,
            },
        }
    }

    pub async fn list_pods(&self) -> Result<Vec<PodSnapshot>> {
        let url = format!("{}/api/v1/pods?limit=5000", self.base);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| api_error("list pods", e))?
            .error_for_status()
            .map_err(|e| api_error("list pods", e))?;
        let list: PodList = response
            .json()
            .await
            .map_err(|e| api_error("decode pod list", e))?;
        Ok(list.items.into_iter().map(Self::snapshot).collect())
    }
}

#[async_trait]
impl OrchestratorApi for KubeClient {
    async fn pod_labels(
        &self,
        namespace: &str,
        pod: &str,
    ) -> Result<Option<HashMap<String, String>>> {
        let response = self
            .http
            .get(self.pod_url(namespace, pod))
            .send()
            .await
            .map_err(|e| api_error("get pod", e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let pod: PodObject = response
            .error_for_status()
            .map_err(|e| api_error("get pod", e))?
            .json()
            .await
            .map_err(|e| api_error("decode pod", e))?;
        Ok(Some(pod.metadata.labels))
    }

    async fn delete_pod(&self, namespace: &str, pod: &str) -> Result<DeleteOutcome> {
        let response = self
            .http
            .delete(self.pod_url(namespace, pod))
            .send()
            .await
            .map_err(|e| api_error("delete pod", e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(DeleteOutcome::NotFound);
        }
        response
            .error_for_status()
            .map_err(|e| api_error("delete pod", e))?;
        Ok(DeleteOutcome::Deleted)
    }

    async fn node_labels(&self, node: &str) -> Result<Option<HashMap<String, String>>> {
        let url = format!("{}/api/v1/nodes/{}", self.base, node);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| api_error("get node", e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let node: NodeObject = response
            .error_for_status()
            .map_err(|e| api_error("get node", e))?
            .json()
            .await
            .map_err(|e| api_error("decode node", e))?;
        Ok(Some(node.metadata.labels))
    }

    async fn cordon_node(&self, node: &str) -> Result<()> {
        let url = format!("{}/api/v1/nodes/{}", self.base, node);
        let patch = json!({ "spec": { "unschedulable": true } });
        self.http
            .patch(&url)
            .header(CONTENT_TYPE, STRATEGIC_MERGE_PATCH)
            .body(patch.to_string())
            .send()
            .await
            .map_err(|e| api_error("cordon node", e))?
            .error_for_status()
            .map_err(|e| api_error("cordon node", e))?;
        Ok(())
    }

    async fn quarantine_namespace(&self, namespace: &str) -> Result<()> {
        let url = format!(
            "{}/apis/networking.k8s.io/v1/namespaces/{}/networkpolicies",
            self.base, namespace
        );
        let policy = json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "NetworkPolicy",
            "metadata": { "name": "podsentry-quarantine", "namespace": namespace },
            "spec": { "podSelector": {}, "policyTypes": ["Ingress", "Egress"] }
        });
        let response = self
            .http
            .post(&url)
            .json(&policy)
            .send()
            .await
            .map_err(|e| api_error("quarantine namespace", e))?;
        // Already quarantined is a success: the policy is absolute.
        if response.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        response
            .error_for_status()
            .map_err(|e| api_error("quarantine namespace", e))?;
        Ok(())
    }

    async fn isolate_pod_network(&self, namespace: &str, pod: &str) -> Result<()> {
        let labels = self
            .pod_labels(namespace, pod)
            .await?
            .ok_or_else(|| SentryError::Action(format!("pod {}/{} not found", namespace, pod)))?;
        if labels.is_empty() {
            // An empty selector would match the whole namespace.
            return Err(SentryError::Action(format!(
                "pod {}/{} has no labels to select on",
                namespace, pod
            )));
        }

        let url = format!(
            "{}/apis/networking.k8s.io/v1/namespaces/{}/networkpolicies",
            self.base, namespace
        );
        let policy = json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "NetworkPolicy",
            "metadata": { "name": format!("podsentry-block-{}", pod), "namespace": namespace },
            "spec": { "podSelector": { "matchLabels": labels }, "policyTypes": ["Ingress", "Egress"] }
        });
        let response = self
            .http
            .post(&url)
            .json(&policy)
            .send()
            .await
            .map_err(|e| api_error("isolate pod network", e))?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        response
            .error_for_status()
            .map_err(|e| api_error("isolate pod network", e))?;
        Ok(())
    }

    async fn revoke_service_account(
        &self,
        namespace: &str,
        service_account: &str,
    ) -> Result<()> {
        let url = format!("{}/api/v1/namespaces/{}/secrets", self.base, namespace);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| api_error("list secrets", e))?
            .error_for_status()
            .map_err(|e| api_error("list secrets", e))?;
        let list: SecretList = response
            .json()
            .await
            .map_err(|e| api_error("decode secret list", e))?;

        let mut revoked = 0usize;
        for secret in list.items {
            if secret.secret_type != TOKEN_SECRET_TYPE {
                continue;
            }
            let owner = secret.metadata.annotations.get(SERVICE_ACCOUNT_ANNOTATION);
            if owner.map(String::as_str) != Some(service_account) {
                continue;
            }
            let url = format!(
                "{}/api/v1/namespaces/{}/secrets/{}",
                self.base, namespace, secret.metadata.name
            );
            let response = self
                .http
                .delete(&url)
                .send()
                .await
                .map_err(|e| api_error("delete secret", e))?;
            // A racing deletion is fine, the token is gone either way.
            if response.status() == StatusCode::NOT_FOUND {
                continue;
            }
            response
                .error_for_status()
                .map_err(|e| api_error("delete secret", e))?;
            revoked += 1;
        }
        log::info!(
            "revoked {} token secrets for {}/{}",
            revoked,
            namespace,
            service_account
        );
        Ok(())
    }
}

/// Poll-based pod watch. Each cycle lists pods, emits upserts for everything
/// seen and deletes for pods that disappeared since the previous cycle.
pub struct KubePodWatch {
    client: Arc<KubeClient>,
    interval: Duration,
    known: Mutex<HashMap<String, PodSnapshot>>,
}

impl KubePodWatch {
    pub fn new(client: Arc<KubeClient>, interval: Duration) -> Self {
        Self {
            client,
            interval,
            known: Mutex::new(HashMap::new()),
        }
    }

    fn pod_key(snapshot: &PodSnapshot) -> String {
        format!("{}/{}", snapshot.record.namespace, snapshot.record.pod)
    }

    fn diff(&self, current: Vec<PodSnapshot>) -> Vec<PodUpdate> {
        let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = HashMap::new();
        let mut updates = Vec::new();

        for snapshot in current {
            let key = Self::pod_key(&snapshot);
            known.remove(&key);
            next.insert(key, snapshot.clone());
            updates.push(PodUpdate::Upsert(snapshot));
        }
        for (_, gone) in known.drain() {
            updates.push(PodUpdate::Delete(gone));
        }
        *known = next;
        updates
    }
}

#[async_trait]
impl PodWatch for KubePodWatch {
    async fn sync(&self) -> Result<Vec<PodSnapshot>> {
        let snapshots = self.client.list_pods().await?;
        let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        *known = snapshots
            .iter()
            .map(|s| (Self::pod_key(s), s.clone()))
            .collect();
        Ok(snapshots)
    }

    async fn next(&self) -> Result<Vec<PodUpdate>> {
        tokio::time::sleep(self.interval).await;
        let current = self.client.list_pods().await?;
        Ok(self.diff(current))
    }
}
