//! Relay compute provider control plane
//!
//! [`RelayProvider`] is the seam the lease manager talks to. [`LinodeProvider`]
//! implements it against the Linode v4 REST API.

use crate::config::RelayConfig;
use crate::error::{Error, RelayError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Everything needed to create one relay instance
#[derive(Clone)]
pub struct InstanceSpec {
    /// Instance label; always starts with the configured label prefix
    pub label: String,
    /// Region
    pub region: String,
    /// Instance plan
    pub instance_type: String,
    /// OS image
    pub image: String,
    /// Root password
    pub root_pass: String,
    /// Base64-encoded cloud-init user data
    pub user_data: String,
}

impl std::fmt::Debug for InstanceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceSpec")
            .field("label", &self.label)
            .field("region", &self.region)
            .field("instance_type", &self.instance_type)
            .field("image", &self.image)
            .finish_non_exhaustive()
    }
}

/// Instance lifecycle as reported by the provider
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Being allocated
    Provisioning,
    /// Booting the image
    Booting,
    /// Up
    Running,
    /// Stopped
    Offline,
    /// Being deleted
    Deleting,
    /// Anything else the provider reports
    Other(String),
}

impl InstanceStatus {
    fn parse(value: &str) -> Self {
        match value {
            "provisioning" => Self::Provisioning,
            "booting" => Self::Booting,
            "running" => Self::Running,
            "offline" => Self::Offline,
            "deleting" => Self::Deleting,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A provider instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderInstance {
    /// Provider-assigned id
    pub id: String,
    /// Label
    pub label: String,
    /// Lifecycle status
    pub status: InstanceStatus,
    /// First public IPv4 address, once assigned
    pub ipv4: Option<String>,
}

impl ProviderInstance {
    /// Running and reachable
    pub fn is_ready(&self) -> bool {
        self.status == InstanceStatus::Running && self.ipv4.is_some()
    }
}

/// Relay compute provider
///
/// All calls are idempotent from the caller's point of view except
/// [`create_instance`](RelayProvider::create_instance). Failures carry the
/// provider's HTTP status so [`crate::retry::with_retry`] can tell transient
/// errors from permanent ones.
#[async_trait]
pub trait RelayProvider: Send + Sync {
    /// Create an instance. Billing starts when this returns.
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<ProviderInstance>;

    /// Look up an instance; `None` if the provider no longer knows it
    async fn get_instance(&self, id: &str) -> Result<Option<ProviderInstance>>;

    /// Delete an instance. Deleting an instance that is already gone succeeds.
    async fn delete_instance(&self, id: &str) -> Result<()>;

    /// Every instance whose label starts with `label_prefix`
    async fn list_instances(&self, label_prefix: &str) -> Result<Vec<ProviderInstance>>;
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    #[serde(rename = "type")]
    instance_type: &'a str,
    region: &'a str,
    image: &'a str,
    label: &'a str,
    root_pass: &'a str,
    booted: bool,
    metadata: Metadata<'a>,
}

#[derive(Serialize)]
struct Metadata<'a> {
    user_data: &'a str,
}

#[derive(Deserialize)]
struct LinodeInstance {
    id: u64,
    label: String,
    status: String,
    #[serde(default)]
    ipv4: Vec<String>,
}

impl From<LinodeInstance> for ProviderInstance {
    fn from(raw: LinodeInstance) -> Self {
        let ipv4 = raw
            .ipv4
            .iter()
            .find(|ip| is_public_ipv4(ip))
            .or_else(|| raw.ipv4.first())
            .cloned();
        ProviderInstance {
            id: raw.id.to_string(),
            label: raw.label,
            status: InstanceStatus::parse(&raw.status),
            ipv4,
        }
    }
}

#[derive(Deserialize)]
struct LinodePage {
    data: Vec<LinodeInstance>,
    #[serde(default = "one")]
    page: u32,
    #[serde(default = "one")]
    pages: u32,
}

fn one() -> u32 {
    1
}

fn is_public_ipv4(ip: &str) -> bool {
    ip.parse::<std::net::Ipv4Addr>()
        .map(|addr| !addr.is_private() && !addr.is_loopback() && !addr.is_link_local())
        .unwrap_or(false)
}

/// Linode v4 API client
pub struct LinodeProvider {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl LinodeProvider {
    /// Build a client from the relay configuration
    pub fn new(config: &RelayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let request = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request.send().await.map_err(|e| {
            Error::Relay(RelayError::Provider {
                status: e.status().map(|s| s.as_u16()),
                message: e.to_string(),
            })
        })?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(Error::Relay(RelayError::Provider {
            status: Some(status),
            message: provider_message(&body),
        }))
    }
}

/// First `reason` from a Linode `{"errors": [...]}` body, or the raw body
fn provider_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct Errors {
        errors: Vec<Reason>,
    }
    #[derive(Deserialize)]
    struct Reason {
        reason: String,
    }

    serde_json::from_str::<Errors>(body)
        .ok()
        .and_then(|e| e.errors.into_iter().next())
        .map(|r| r.reason)
        .unwrap_or_else(|| body.chars().take(200).collect())
}

fn decode_error(e: reqwest::Error) -> Error {
    Error::Relay(RelayError::Provider {
        status: None,
        message: format!("unexpected response: {e}"),
    })
}

#[async_trait]
impl RelayProvider for LinodeProvider {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<ProviderInstance> {
        let body = CreateRequest {
            instance_type: &spec.instance_type,
            region: &spec.region,
            image: &spec.image,
            label: &spec.label,
            root_pass: &spec.root_pass,
            booted: true,
            metadata: Metadata {
                user_data: &spec.user_data,
            },
        };

        let response = self
            .send(
                self.request(reqwest::Method::POST, "/linode/instances")
                    .json(&body),
            )
            .await?;
        let instance: LinodeInstance = response.json().await.map_err(decode_error)?;

        tracing::debug!(instance_id = instance.id, label = %instance.label, "provider instance created");
        Ok(instance.into())
    }

    async fn get_instance(&self, id: &str) -> Result<Option<ProviderInstance>> {
        let path = format!("/linode/instances/{id}");
        match self.send(self.request(reqwest::Method::GET, &path)).await {
            Ok(response) => {
                let instance: LinodeInstance = response.json().await.map_err(decode_error)?;
                Ok(Some(instance.into()))
            }
            Err(Error::Relay(RelayError::Provider {
                status: Some(404), ..
            })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete_instance(&self, id: &str) -> Result<()> {
        let path = format!("/linode/instances/{id}");
        match self.send(self.request(reqwest::Method::DELETE, &path)).await {
            Ok(_) => Ok(()),
            Err(Error::Relay(RelayError::Provider {
                status: Some(404), ..
            })) => {
                tracing::debug!(instance_id = %id, "instance already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list_instances(&self, label_prefix: &str) -> Result<Vec<ProviderInstance>> {
        let mut found = Vec::new();
        let mut page = 1;

        loop {
            let response = self
                .send(
                    self.request(reqwest::Method::GET, "/linode/instances")
                        .query(&[("page", page), ("page_size", 500)]),
                )
                .await?;
            let body: LinodePage = response.json().await.map_err(decode_error)?;

            found.extend(
                body.data
                    .into_iter()
                    .filter(|i| i.label.starts_with(label_prefix))
                    .map(ProviderInstance::from),
            );

            if body.page >= body.pages {
                break;
            }
            page = body.page + 1;
        }

        Ok(found)
    }
}
