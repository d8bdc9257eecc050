use crate::error::{ControllerError, Result};
use crate::traits::WorkloadApi;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus, Service};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// HTTP client for a Kubernetes-style API server
pub struct ApiClient {
    base_url: String,
    client: Client,
}

/// Failure of a single request, before it is mapped to a resource-specific error
enum RequestError {
    NotFound,
    Other(ControllerError),
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn pod_url(&self, namespace: &str, name: &str) -> String {
        format!(
            "{}/api/v1/namespaces/{}/pods/{}",
            self.base_url, namespace, name
        )
    }

    fn service_url(&self, namespace: &str, name: &str) -> String {
        format!(
            "{}/api/v1/namespaces/{}/services/{}",
            self.base_url, namespace, name
        )
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> std::result::Result<T, RequestError> {
        debug!("GET {}", url);
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RequestError::Other(ControllerError::workload_api(format!("HTTP request failed: {}", e))))?;
        Self::decode(resp, "GET").await
    }

    async fn put_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> std::result::Result<T, RequestError> {
        debug!("PUT {}", url);
        let resp = self
            .client
            .put(url)
            .json(body)
            .send()
            .await
            .map_err(|e| RequestError::Other(ControllerError::workload_api(format!("HTTP request failed: {}", e))))?;
        Self::decode(resp, "PUT").await
    }

    async fn decode<T: DeserializeOwned>(
        resp: reqwest::Response,
        method: &str,
    ) -> std::result::Result<T, RequestError> {
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(RequestError::NotFound);
        }
        if !status.is_success() {
            let url = resp.url().to_string();
            let body = resp.text().await.unwrap_or_default();
            return Err(RequestError::Other(ControllerError::workload_api(format!(
                "{} {} failed with status {}: {}",
                method, url, status, body
            ))));
        }
        resp.json::<T>().await.map_err(|e| {
            RequestError::Other(ControllerError::workload_api(format!(
                "Failed to parse response: {}",
                e
            )))
        })
    }

    /// PUT /api/v1/namespaces/{namespace}/pods/{name}/status
    pub async fn update_pod_status(&self, namespace: &str, name: &str, pod: &Pod) -> Result<Pod> {
        let url = format!("{}/status", self.pod_url(namespace, name));
        self.put_json(&url, pod).await.map_err(|e| match e {
            RequestError::NotFound => ControllerError::pod_not_found(namespace, name),
            RequestError::Other(e) => e,
        })
    }

    /// PUT /api/v1/namespaces/{namespace}/services/{name}
    pub async fn update_service(
        &self,
        namespace: &str,
        name: &str,
        service: &Service,
    ) -> Result<Service> {
        let url = self.service_url(namespace, name);
        self.put_json(&url, service).await.map_err(|e| match e {
            RequestError::NotFound => ControllerError::service_not_found(namespace, name),
            RequestError::Other(e) => e,
        })
    }
}

/// Replace the condition with the same type, or append it
pub(crate) fn upsert_condition(pod: &mut Pod, condition: PodCondition) {
    let conditions = pod
        .status
        .get_or_insert_with(PodStatus::default)
        .conditions
        .get_or_insert_with(Vec::new);
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            // Keep the original transition time when the status did not change
            let unchanged = existing.status == condition.status;
            let transition = existing.last_transition_time.clone();
            *existing = condition;
            if unchanged {
                existing.last_transition_time = transition;
            }
        }
        None => conditions.push(condition),
    }
}

#[async_trait]
impl WorkloadApi for ApiClient {
    /// GET /api/v1/namespaces/{namespace}/pods/{name}
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.get_json(&self.pod_url(namespace, name))
            .await
            .map_err(|e| match e {
                RequestError::NotFound => ControllerError::pod_not_found(namespace, name),
                RequestError::Other(e) => e,
            })
    }

    async fn set_pod_condition(
        &self,
        namespace: &str,
        name: &str,
        condition: PodCondition,
    ) -> Result<()> {
        // Get current pod to preserve the rest of its status
        let mut pod = self.get_pod(namespace, name).await?;
        upsert_condition(&mut pod, condition);
        self.update_pod_status(namespace, name, &pod).await?;
        Ok(())
    }

    /// GET /api/v1/namespaces/{namespace}/services/{name}
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        self.get_json(&self.service_url(namespace, name))
            .await
            .map_err(|e| match e {
                RequestError::NotFound => ControllerError::service_not_found(namespace, name),
                RequestError::Other(e) => e,
            })
    }

    async fn set_service_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let mut service = self.get_service(namespace, name).await?;
        let annotations = service.metadata.annotations.get_or_insert_with(Default::default);
        if annotations.get(key).map(String::as_str) == Some(value) {
            return Ok(());
        }
        annotations.insert(key.to_string(), value.to_string());
        self.update_service(namespace, name, &service).await?;
        Ok(())
    }
}
