// src/core/client.rs

//! The opaque HTTP client every component talks through. Wraps `reqwest`
//! with the configured per-request timeout, bounded retries with
//! exponential back-off for idempotent GETs, and mutual TLS when enabled.

use crate::config::ControllerConfig;
use crate::core::errors::ControllerError;
use crate::core::protocol::{
    ClusterViewPayload, CoordinatorInfoResponse, OfflineRequest, RoleAnnounceRequest,
    TasksResponse, WorkerConfigResponse, WorkerStatusResponse,
};
use crate::core::types::{NodeId, Role};
use async_trait::async_trait;
use std::fs;
use std::time::Duration;
use tracing::{debug, warn};

/// Every control-plane call the controller makes, behind a trait so the
/// prober, switcher, and publisher can be exercised against mocks.
#[async_trait]
pub trait ControlApi: Send + Sync {
    /// `GET /v1/config` on a worker's management endpoint.
    async fn fetch_config(&self, endpoint: &str) -> Result<WorkerConfigResponse, ControllerError>;

    /// `GET /v1/status` on a worker's management endpoint.
    async fn fetch_status(&self, endpoint: &str) -> Result<WorkerStatusResponse, ControllerError>;

    /// `POST /v1/role/prefill` or `/v1/role/decode`. Single attempt; the
    /// Role Switcher owns the announce retry policy.
    async fn announce_role(
        &self,
        endpoint: &str,
        role: Role,
        request: &RoleAnnounceRequest,
    ) -> Result<(), ControllerError>;

    /// `GET /v1/instances/tasks?id=<id>` on a worker.
    async fn fetch_tasks(&self, endpoint: &str, id: NodeId)
    -> Result<TasksResponse, ControllerError>;

    /// `POST /v1/instances/refresh` on a coordinator.
    async fn push_refresh(
        &self,
        endpoint: &str,
        view: &ClusterViewPayload,
    ) -> Result<(), ControllerError>;

    /// `POST /v1/instances/offline` on a coordinator.
    async fn push_offline(
        &self,
        endpoint: &str,
        request: &OfflineRequest,
    ) -> Result<(), ControllerError>;

    /// `GET /v1/coordinator_info` on a coordinator.
    async fn fetch_coordinator_info(
        &self,
        endpoint: &str,
    ) -> Result<CoordinatorInfoResponse, ControllerError>;
}

/// The production `reqwest`-backed client.
pub struct ControlClient {
    http: reqwest::Client,
    scheme: &'static str,
    retries: u32,
}

impl ControlClient {
    /// Builds the client from controller config. Loads the client
    /// identity and private CA when mutual TLS is enabled.
    pub fn new(config: &ControllerConfig) -> Result<Self, ControllerError> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .use_rustls_tls();

        let scheme = if config.tls.enabled {
            let mut identity_pem = fs::read(&config.tls.cert_path).map_err(|e| {
                ControllerError::InvalidConfig(format!(
                    "failed to read tls.cert_path '{}': {e}",
                    config.tls.cert_path
                ))
            })?;
            let key_pem = fs::read(&config.tls.key_path).map_err(|e| {
                ControllerError::InvalidConfig(format!(
                    "failed to read tls.key_path '{}': {e}",
                    config.tls.key_path
                ))
            })?;
            identity_pem.extend_from_slice(&key_pem);
            let identity = reqwest::Identity::from_pem(&identity_pem)
                .map_err(|e| ControllerError::InvalidConfig(format!("invalid TLS identity: {e}")))?;
            let ca_pem = fs::read(&config.tls.ca_path).map_err(|e| {
                ControllerError::InvalidConfig(format!(
                    "failed to read tls.ca_path '{}': {e}",
                    config.tls.ca_path
                ))
            })?;
            let ca = reqwest::Certificate::from_pem(&ca_pem)
                .map_err(|e| ControllerError::InvalidConfig(format!("invalid CA bundle: {e}")))?;
            builder = builder.identity(identity).add_root_certificate(ca);
            "https"
        } else {
            "http"
        };

        let http = builder
            .build()
            .map_err(|e| ControllerError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            scheme,
            retries: config.http_retry_times,
        })
    }

    fn url(&self, endpoint: &str, path: &str) -> String {
        format!("{}://{endpoint}{path}", self.scheme)
    }

    /// Maps a non-success status: 4xx is fatal (the worker answered and
    /// refused), 5xx and transport errors are transient.
    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ControllerError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = format!("status {status}: {body}");
        if status.is_client_error() {
            Err(ControllerError::ProbeFatal(message))
        } else {
            Err(ControllerError::ProbeTransient(message))
        }
    }

    /// GET with bounded retries and exponential back-off on transient
    /// failures. Fatal errors short-circuit.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, ControllerError> {
        let mut last_err = ControllerError::ProbeTransient("no attempt made".into());
        for attempt in 0..=self.retries {
            if attempt > 0 {
                // Jittered exponential back-off so a fleet-wide blip does
                // not resynchronize every retry.
                let backoff = Duration::from_millis(
                    (500u64 << (attempt - 1).min(6)) + rand::random::<u64>() % 250,
                );
                debug!("retrying {url} (attempt {attempt}) after {backoff:?}");
                tokio::time::sleep(backoff).await;
            }
            let result = async {
                let response = self.http.get(url).send().await?;
                let response = Self::check_status(response).await?;
                Ok::<T, ControllerError>(response.json::<T>().await?)
            }
            .await;
            match result {
                Ok(parsed) => return Ok(parsed),
                Err(e) if e.is_transient() => {
                    warn!("transient failure on {url}: {e}");
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// Single-attempt POST with a JSON body; status mapping as above.
    async fn post_json<B: serde::Serialize + Sync>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<(), ControllerError> {
        let response = self.http.post(url).json(body).send().await?;
        Self::check_status(response).await?;
        Ok(())
    }
}

#[async_trait]
impl ControlApi for ControlClient {
    async fn fetch_config(&self, endpoint: &str) -> Result<WorkerConfigResponse, ControllerError> {
        self.get_json(&self.url(endpoint, "/v1/config")).await
    }

    async fn fetch_status(&self, endpoint: &str) -> Result<WorkerStatusResponse, ControllerError> {
        self.get_json(&self.url(endpoint, "/v1/status")).await
    }

    async fn announce_role(
        &self,
        endpoint: &str,
        role: Role,
        request: &RoleAnnounceRequest,
    ) -> Result<(), ControllerError> {
        let path = match role {
            Role::Prefill => "/v1/role/prefill",
            Role::Decode => "/v1/role/decode",
            other => {
                return Err(ControllerError::Internal(format!(
                    "role '{other}' has no announce endpoint"
                )));
            }
        };
        self.post_json(&self.url(endpoint, path), request).await
    }

    async fn fetch_tasks(
        &self,
        endpoint: &str,
        id: NodeId,
    ) -> Result<TasksResponse, ControllerError> {
        let url = format!("{}?id={id}", self.url(endpoint, "/v1/instances/tasks"));
        // Drain polling carries its own cadence; no retry layer here.
        let response = self.http.get(&url).send().await?;
        let response = Self::check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn push_refresh(
        &self,
        endpoint: &str,
        view: &ClusterViewPayload,
    ) -> Result<(), ControllerError> {
        self.post_json(&self.url(endpoint, "/v1/instances/refresh"), view)
            .await
            .map_err(|e| ControllerError::CoordinatorPushFailure(e.to_string()))
    }

    async fn push_offline(
        &self,
        endpoint: &str,
        request: &OfflineRequest,
    ) -> Result<(), ControllerError> {
        self.post_json(&self.url(endpoint, "/v1/instances/offline"), request)
            .await
            .map_err(|e| ControllerError::CoordinatorPushFailure(e.to_string()))
    }

    async fn fetch_coordinator_info(
        &self,
        endpoint: &str,
    ) -> Result<CoordinatorInfoResponse, ControllerError> {
        self.get_json(&self.url(endpoint, "/v1/coordinator_info"))
            .await
    }
}
