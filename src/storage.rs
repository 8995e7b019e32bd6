//! Remote offline-download storage client
//!
//! The storage service fetches a magnet or URL on its side and hands back a
//! plain HTTP link the transfer daemon can pull. Submissions go through the
//! relay so the service sees the relay's address, not ours.

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::relay::RelayRoute;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A job accepted by the storage service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineJob {
    /// Storage-side job id
    pub id: String,
    /// File name chosen by the service
    #[serde(default)]
    pub name: String,
    /// Link the transfer daemon should fetch
    pub download_url: String,
}

/// Progress of a job on the storage side
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OfflineStatus {
    /// Storage-side job id
    pub id: String,
    /// Service-defined phase (`queued`, `running`, `done`, `failed`, ...)
    pub phase: String,
    /// Fraction done, 0.0 to 1.0
    #[serde(default)]
    pub progress: f64,
}

/// Whether a job's file can be handed to the transfer daemon
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// Still fetching on the storage side
    Pending,
    /// File is complete and downloadable
    Ready,
    /// The service gave up on the job
    Failed,
}

impl OfflineStatus {
    /// Classify the service's phase name
    ///
    /// Unknown phases count as pending.
    pub fn readiness(&self) -> Readiness {
        match self.phase.to_ascii_lowercase().as_str() {
            "done" | "complete" | "completed" | "phase_type_complete" => Readiness::Ready,
            "failed" | "error" | "phase_type_error" => Readiness::Failed,
            _ => Readiness::Pending,
        }
    }
}

/// Remote offline-download service
#[async_trait]
pub trait OfflineStorage: Send + Sync {
    /// Submit a magnet or URL
    ///
    /// Fails with [`Error::SubmissionRejected`] when the service refuses the
    /// resource. Callers must not retry that.
    async fn submit(&self, uri: &str, route: &RelayRoute) -> Result<OfflineJob>;

    /// Look up a submitted job
    async fn status(&self, id: &str, route: &RelayRoute) -> Result<OfflineStatus>;
}

/// HTTP JSON client for the storage service
pub struct HttpOfflineStorage {
    base_url: String,
    token: Option<String>,
    timeout: Duration,
    route_through_relay: bool,
    direct: reqwest::Client,
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    url: &'a str,
}

impl HttpOfflineStorage {
    /// Build a client from the storage configuration
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let direct = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
            timeout: config.request_timeout,
            route_through_relay: config.route_through_relay,
            direct,
        })
    }

    fn client(&self, route: &RelayRoute) -> Result<reqwest::Client> {
        if !self.route_through_relay {
            return Ok(self.direct.clone());
        }
        let proxy = reqwest::Proxy::all(format!("http://{}", route.endpoint()))?
            .basic_auth(&route.username, &route.password);
        Ok(reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()?)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Pull a human-readable reason out of an error body
fn rejection_reason(body: &str) -> String {
    #[derive(Deserialize)]
    struct Body {
        #[serde(alias = "message", alias = "detail")]
        error: String,
    }

    serde_json::from_str::<Body>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| body.trim().chars().take(200).collect())
}

#[async_trait]
impl OfflineStorage for HttpOfflineStorage {
    async fn submit(&self, uri: &str, route: &RelayRoute) -> Result<OfflineJob> {
        let request = self
            .client(route)?
            .post(format!("{}/offline", self.base_url))
            .json(&SubmitRequest { url: uri });
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("submission request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            let job: OfflineJob = response
                .json()
                .await
                .map_err(|e| Error::Storage(format!("unexpected submission response: {e}")))?;
            tracing::debug!(job_id = %job.id, name = %job.name, "offline download accepted");
            return Ok(job);
        }

        let body = response.text().await.unwrap_or_default();
        let transient = status.as_u16() == 408 || status.as_u16() == 429;
        if status.is_client_error() && !transient {
            return Err(Error::SubmissionRejected {
                uri: uri.to_string(),
                reason: rejection_reason(&body),
            });
        }
        Err(Error::Storage(format!(
            "submission failed with {}: {}",
            status.as_u16(),
            rejection_reason(&body)
        )))
    }

    async fn status(&self, id: &str, route: &RelayRoute) -> Result<OfflineStatus> {
        let request = self
            .client(route)?
            .get(format!("{}/offline/{}", self.base_url, id));
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("status request failed: {e}")))?;

        match response.status() {
            s if s.is_success() => response
                .json()
                .await
                .map_err(|e| Error::Storage(format!("unexpected status response: {e}"))),
            reqwest::StatusCode::NOT_FOUND => Err(Error::NotFound(format!("offline job {id}"))),
            s => Err(Error::Storage(format!("status lookup failed with {}", s.as_u16()))),
        }
    }
}
