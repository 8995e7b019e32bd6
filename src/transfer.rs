//! Transfer daemon client (aria2 JSON-RPC)

use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::relay::RelayRoute;
use crate::types::TransferStats;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::PathBuf;

/// Lifecycle of one transfer as the daemon reports it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferState {
    /// Downloading
    Active,
    /// Queued
    Waiting,
    /// Paused by someone
    Paused,
    /// Finished
    Complete,
    /// Failed inside the daemon
    Error,
    /// Removed from the daemon
    Removed,
    /// The daemon does not know the id
    Missing,
}

impl TransferState {
    fn parse(value: &str) -> Self {
        match value {
            "active" => Self::Active,
            "waiting" => Self::Waiting,
            "paused" => Self::Paused,
            "complete" => Self::Complete,
            "error" => Self::Error,
            "removed" => Self::Removed,
            _ => Self::Missing,
        }
    }
}

/// Progress of one transfer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferStatus {
    /// Daemon-side id (aria2 gid)
    pub id: String,
    /// Lifecycle state
    pub state: TransferState,
    /// Total size, 0 until known
    pub total_bytes: u64,
    /// Bytes on disk
    pub completed_bytes: u64,
    /// Current speed in bytes per second
    pub speed_bps: u64,
    /// Daemon error message for failed transfers
    pub error: Option<String>,
}

impl TransferStatus {
    /// Status for an id the daemon does not know
    pub fn missing(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: TransferState::Missing,
            total_bytes: 0,
            completed_bytes: 0,
            speed_bps: 0,
            error: None,
        }
    }
}

/// Local download daemon
#[async_trait]
pub trait TransferDaemon: Send + Sync {
    /// Queue a download of `url` saved as `name`, routed through the relay
    async fn add_download(&self, url: &str, name: &str, route: &RelayRoute) -> Result<String>;

    /// Status of several transfers in one round trip, in the order asked
    async fn statuses(&self, ids: &[String]) -> Result<Vec<TransferStatus>>;

    /// Daemon-wide statistics
    async fn global_stats(&self) -> Result<TransferStats>;

    /// Stop and forget a transfer; unknown ids succeed
    async fn remove(&self, id: &str) -> Result<()>;
}

/// aria2 JSON-RPC client
pub struct Aria2Client {
    client: reqwest::Client,
    rpc_url: String,
    secret: Option<String>,
    download_dir: PathBuf,
    split: u32,
    max_connection_per_server: u32,
    route_through_relay: bool,
}

#[derive(Deserialize)]
struct RpcFault {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcFault>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Aria2Status {
    gid: String,
    status: String,
    #[serde(default)]
    total_length: String,
    #[serde(default)]
    completed_length: String,
    #[serde(default)]
    download_speed: String,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

impl From<Aria2Status> for TransferStatus {
    fn from(raw: Aria2Status) -> Self {
        let error = match (raw.error_message, raw.error_code) {
            (Some(msg), _) if !msg.is_empty() => Some(msg),
            (_, Some(code)) if code != "0" => Some(format!("aria2 error code {code}")),
            _ => None,
        };
        TransferStatus {
            id: raw.gid,
            state: TransferState::parse(&raw.status),
            total_bytes: raw.total_length.parse().unwrap_or(0),
            completed_bytes: raw.completed_length.parse().unwrap_or(0),
            speed_bps: raw.download_speed.parse().unwrap_or(0),
            error,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Aria2GlobalStat {
    download_speed: String,
    upload_speed: String,
    num_active: String,
    num_waiting: String,
    num_stopped: String,
}

const STATUS_KEYS: [&str; 7] = [
    "gid",
    "status",
    "totalLength",
    "completedLength",
    "downloadSpeed",
    "errorCode",
    "errorMessage",
];

fn is_not_found(fault: &RpcFault) -> bool {
    fault.message.contains("is not found") || fault.message.contains("No such download")
}

impl Aria2Client {
    /// Build a client from the transfer configuration
    pub fn new(config: &TransferConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            rpc_url: config.rpc_url.clone(),
            secret: config.rpc_secret.clone(),
            download_dir: config.download_dir.clone(),
            split: config.split,
            max_connection_per_server: config.max_connection_per_server,
            route_through_relay: config.route_through_relay,
        })
    }

    fn params(&self, rest: Vec<Value>) -> Vec<Value> {
        match &self.secret {
            Some(secret) => std::iter::once(json!(format!("token:{secret}")))
                .chain(rest)
                .collect(),
            None => rest,
        }
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<std::result::Result<Value, RpcFault>> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": "swipe-dl",
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Transfer(format!("{method}: {e}")))?;

        // aria2 answers faults with a non-2xx status and a JSON-RPC error body
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Transfer(format!("{method}: {e}")))?;
        let parsed: RpcResponse = serde_json::from_str(&text).map_err(|_| {
            Error::Transfer(format!(
                "{method}: unexpected response ({}): {}",
                status.as_u16(),
                text.chars().take(200).collect::<String>()
            ))
        })?;

        match (parsed.result, parsed.error) {
            (_, Some(fault)) => Ok(Err(fault)),
            (Some(result), None) => Ok(Ok(result)),
            (None, None) => Err(Error::Transfer(format!("{method}: empty response"))),
        }
    }

    async fn call_ok(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        self.call(method, params).await?.map_err(|fault| {
            Error::Transfer(format!("{method} failed ({}): {}", fault.code, fault.message))
        })
    }
}

#[async_trait]
impl TransferDaemon for Aria2Client {
    async fn add_download(&self, url: &str, name: &str, route: &RelayRoute) -> Result<String> {
        let mut options = serde_json::Map::new();
        options.insert(
            "dir".into(),
            json!(self.download_dir.to_string_lossy().to_string()),
        );
        if !name.is_empty() {
            options.insert("out".into(), json!(name));
        }
        options.insert("split".into(), json!(self.split.to_string()));
        options.insert(
            "max-connection-per-server".into(),
            json!(self.max_connection_per_server.to_string()),
        );
        if self.route_through_relay {
            options.insert("all-proxy".into(), json!(route.proxy_url()));
        }

        let params = self.params(vec![json!([url]), Value::Object(options)]);
        let result = self.call_ok("aria2.addUri", params).await?;
        let gid = result
            .as_str()
            .ok_or_else(|| Error::Transfer(format!("aria2.addUri returned {result}")))?
            .to_string();

        tracing::debug!(gid = %gid, name = %name, "transfer queued");
        Ok(gid)
    }

    async fn statuses(&self, ids: &[String]) -> Result<Vec<TransferStatus>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let calls: Vec<Value> = ids
            .iter()
            .map(|gid| {
                json!({
                    "methodName": "aria2.tellStatus",
                    "params": self.params(vec![json!(gid), json!(STATUS_KEYS)]),
                })
            })
            .collect();
        let result = self.call_ok("system.multicall", vec![json!(calls)]).await?;
        let entries = result
            .as_array()
            .ok_or_else(|| Error::Transfer("system.multicall returned a non-array".into()))?;

        let mut statuses = Vec::with_capacity(ids.len());
        for (gid, entry) in ids.iter().zip(entries) {
            // Each entry is `[status]` on success or a fault struct
            let status = match entry {
                Value::Array(items) => items
                    .first()
                    .cloned()
                    .and_then(|v| serde_json::from_value::<Aria2Status>(v).ok())
                    .map(TransferStatus::from)
                    .unwrap_or_else(|| TransferStatus::missing(gid)),
                _ => TransferStatus::missing(gid),
            };
            statuses.push(status);
        }
        for gid in ids.iter().skip(entries.len()) {
            statuses.push(TransferStatus::missing(gid));
        }
        Ok(statuses)
    }

    async fn global_stats(&self) -> Result<TransferStats> {
        let result = self
            .call_ok("aria2.getGlobalStat", self.params(Vec::new()))
            .await?;
        let raw: Aria2GlobalStat = serde_json::from_value(result)?;
        Ok(TransferStats {
            download_speed: raw.download_speed.parse().unwrap_or(0),
            upload_speed: raw.upload_speed.parse().unwrap_or(0),
            num_active: raw.num_active.parse().unwrap_or(0),
            num_waiting: raw.num_waiting.parse().unwrap_or(0),
            num_stopped: raw.num_stopped.parse().unwrap_or(0),
        })
    }

    async fn remove(&self, id: &str) -> Result<()> {
        match self.call("aria2.remove", self.params(vec![json!(id)])).await? {
            Ok(_) => Ok(()),
            Err(fault) if is_not_found(&fault) => Ok(()),
            // Already stopped: drop the result instead
            Err(_) => {
                match self
                    .call("aria2.removeDownloadResult", self.params(vec![json!(id)]))
                    .await?
                {
                    Ok(_) => Ok(()),
                    Err(fault) if is_not_found(&fault) => Ok(()),
                    Err(fault) => Err(Error::Transfer(format!(
                        "aria2.remove failed ({}): {}",
                        fault.code, fault.message
                    ))),
                }
            }
        }
    }
}
