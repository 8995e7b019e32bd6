//! Configuration types for swipe-dl
//!
//! Every section has serde defaults, so an empty JSON object is a valid
//! configuration for local development. Secrets are read from the file or
//! overlaid from the environment with [`Config::apply_env_overrides`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::Path, path::PathBuf, time::Duration};

/// Main configuration for the orchestrator
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Data storage
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Relay provider and lease lifecycle
    #[serde(default)]
    pub relay: RelayConfig,

    /// Remote offline-download storage service
    #[serde(default)]
    pub storage: StorageConfig,

    /// Local transfer daemon (aria2)
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Download monitor polling and stall handling
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Worker pool and background maintenance
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// REST API
    #[serde(default)]
    pub api: ApiConfig,

    /// Operator settings shared with the ingestion process
    #[serde(default)]
    pub settings: SettingsConfig,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("failed to read {}: {e}", path.display()),
            key: None,
        })?;
        serde_json::from_str(&raw).map_err(|e| Error::Config {
            message: format!("invalid configuration in {}: {e}", path.display()),
            key: None,
        })
    }

    /// Overlay secrets and paths from environment variables
    ///
    /// Recognized: `LINODE_TOKEN`, `STORAGE_API_TOKEN`, `ARIA2_RPC_SECRET`,
    /// `ARIA2_RPC_URL`, `SWIPE_DL_DATABASE`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(token) = lookup("LINODE_TOKEN") {
            self.relay.api_token = Some(token);
        }
        if let Some(token) = lookup("STORAGE_API_TOKEN") {
            self.storage.api_token = Some(token);
        }
        if let Some(secret) = lookup("ARIA2_RPC_SECRET") {
            self.transfer.rpc_secret = Some(secret);
        }
        if let Some(url) = lookup("ARIA2_RPC_URL") {
            self.transfer.rpc_url = url;
        }
        if let Some(path) = lookup("SWIPE_DL_DATABASE") {
            self.persistence.database_path = PathBuf::from(path);
        }
    }

    /// Reject configurations that would make the engine misbehave at runtime
    pub fn validate(&self) -> Result<()> {
        fn invalid(key: &str, message: &str) -> Error {
            Error::Config {
                message: message.to_string(),
                key: Some(key.to_string()),
            }
        }

        if self.relay.label_prefix.is_empty() {
            return Err(invalid(
                "relay.label_prefix",
                "label prefix must not be empty (used to find orphaned instances)",
            ));
        }
        if self.relay.billing_unit.is_zero() {
            return Err(invalid("relay.billing_unit", "billing unit must be non-zero"));
        }
        if self.relay.hourly_rate < 0.0 {
            return Err(invalid("relay.hourly_rate", "hourly rate must not be negative"));
        }
        if self.monitor.poll_interval.is_zero() {
            return Err(invalid("monitor.poll_interval", "poll interval must be non-zero"));
        }
        if self.storage.ready_poll_interval.is_zero() {
            return Err(invalid(
                "storage.ready_poll_interval",
                "ready poll interval must be non-zero",
            ));
        }
        if self.orchestrator.workers == 0 {
            return Err(invalid("orchestrator.workers", "at least one worker is required"));
        }
        for (key, value) in [
            ("relay.api_url", &self.relay.api_url),
            ("storage.api_url", &self.storage.api_url),
            ("transfer.rpc_url", &self.transfer.rpc_url),
            ("relay.probe_url", &self.relay.probe_url),
        ] {
            url::Url::parse(value)
                .map_err(|e| invalid(key, &format!("invalid URL {value}: {e}")))?;
        }
        Ok(())
    }
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Database path (default: "./swipe-dl.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Relay provider and lease configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Provider API base URL (default: Linode v4)
    #[serde(default = "default_relay_api_url")]
    pub api_url: String,

    /// Provider API token
    #[serde(default, skip_serializing)]
    pub api_token: Option<String>,

    /// Region for new instances
    #[serde(default = "default_region")]
    pub region: String,

    /// Instance plan
    #[serde(default = "default_instance_type")]
    pub instance_type: String,

    /// OS image
    #[serde(default = "default_image")]
    pub image: String,

    /// Label prefix; every instance this engine creates carries it
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,

    /// Port the relay proxy listens on
    #[serde(default = "default_relay_port")]
    pub relay_port: u16,

    /// Username for the relay proxy
    #[serde(default = "default_relay_user")]
    pub relay_user: String,

    /// Custom cloud-init template; `{port}`, `{user}` and `{password}` are substituted
    #[serde(default)]
    pub bootstrap_template: Option<String>,

    /// Idle period with zero holders before the relay is destroyed (default: 5 minutes)
    #[serde(default = "default_idle_timeout", with = "duration_serde")]
    pub idle_timeout: Duration,

    /// Upper bound for the instance to report running with an address
    #[serde(default = "default_provision_timeout", with = "duration_serde")]
    pub provision_timeout: Duration,

    /// How often instance status is polled while booting
    #[serde(default = "default_provider_poll_interval", with = "duration_serde")]
    pub provider_poll_interval: Duration,

    /// Endpoint fetched through the relay to confirm it carries traffic
    #[serde(default = "default_probe_url")]
    pub probe_url: String,

    /// Total window for the relay to pass its health probe after boot
    #[serde(default = "default_probe_timeout", with = "duration_serde")]
    pub probe_timeout: Duration,

    /// Delay between health probe attempts
    #[serde(default = "default_probe_interval", with = "duration_serde")]
    pub probe_interval: Duration,

    /// Per-request timeout for provider and probe calls
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// Hourly price of the instance plan, in account currency
    #[serde(default = "default_hourly_rate")]
    pub hourly_rate: f64,

    /// Provider billing granularity (default: 1 minute)
    #[serde(default = "default_billing_unit", with = "duration_serde")]
    pub billing_unit: Duration,

    /// Retry policy for instance deletion
    #[serde(default = "default_destroy_retry")]
    pub destroy_retry: RetryConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            api_url: default_relay_api_url(),
            api_token: None,
            region: default_region(),
            instance_type: default_instance_type(),
            image: default_image(),
            label_prefix: default_label_prefix(),
            relay_port: default_relay_port(),
            relay_user: default_relay_user(),
            bootstrap_template: None,
            idle_timeout: default_idle_timeout(),
            provision_timeout: default_provision_timeout(),
            provider_poll_interval: default_provider_poll_interval(),
            probe_url: default_probe_url(),
            probe_timeout: default_probe_timeout(),
            probe_interval: default_probe_interval(),
            request_timeout: default_request_timeout(),
            hourly_rate: default_hourly_rate(),
            billing_unit: default_billing_unit(),
            destroy_retry: default_destroy_retry(),
        }
    }
}

/// Remote offline-download storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base URL of the storage service API
    #[serde(default = "default_storage_api_url")]
    pub api_url: String,

    /// Bearer token for the storage service
    #[serde(default, skip_serializing)]
    pub api_token: Option<String>,

    /// Route submissions through the relay (default: true)
    #[serde(default = "default_true")]
    pub route_through_relay: bool,

    /// Per-request timeout
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// How long a submitted job may take to become downloadable (default: 30 minutes)
    #[serde(default = "default_ready_timeout", with = "duration_serde")]
    pub ready_timeout: Duration,

    /// Interval between job status lookups while waiting (default: 10 seconds)
    #[serde(default = "default_ready_poll_interval", with = "duration_serde")]
    pub ready_poll_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            api_url: default_storage_api_url(),
            api_token: None,
            route_through_relay: true,
            request_timeout: default_request_timeout(),
            ready_timeout: default_ready_timeout(),
            ready_poll_interval: default_ready_poll_interval(),
        }
    }
}

/// Transfer daemon (aria2 JSON-RPC) configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferConfig {
    /// JSON-RPC endpoint
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    /// RPC secret (sent as `token:<secret>`)
    #[serde(default, skip_serializing)]
    pub rpc_secret: Option<String>,

    /// Directory the daemon writes into
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Segments per download
    #[serde(default = "default_split")]
    pub split: u32,

    /// Connections per server
    #[serde(default = "default_split")]
    pub max_connection_per_server: u32,

    /// Route transfers through the relay (default: true)
    #[serde(default = "default_true")]
    pub route_through_relay: bool,

    /// Per-request timeout
    #[serde(default = "default_rpc_timeout", with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            rpc_secret: None,
            download_dir: default_download_dir(),
            split: default_split(),
            max_connection_per_server: default_split(),
            route_through_relay: true,
            request_timeout: default_rpc_timeout(),
        }
    }
}

/// What to do with a download that stops making progress
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StallPolicy {
    /// Fail the task and release its relay hold
    #[default]
    Fail,
    /// Keep the task downloading and surface the stall to the operator
    Surface,
}

/// Download monitor configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Poll interval (default: 5 seconds)
    #[serde(default = "default_poll_interval", with = "duration_serde")]
    pub poll_interval: Duration,

    /// No-progress period before a download is classified stalled (default: 10 minutes)
    #[serde(default = "default_stall_grace", with = "duration_serde")]
    pub stall_grace: Duration,

    /// Stall handling
    #[serde(default)]
    pub stall_policy: StallPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            stall_grace: default_stall_grace(),
            stall_policy: StallPolicy::default(),
        }
    }
}

/// Orchestrator configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Concurrent confirmation workers (default: 4)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Interval for orphan retries and usage checkpoints (default: 60 seconds)
    #[serde(default = "default_maintenance_interval", with = "duration_serde")]
    pub maintenance_interval: Duration,

    /// Capacity of the event broadcast channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Retry policy for transient offline-submission failures (rejections are never retried)
    #[serde(default = "default_submit_retry")]
    pub submit_retry: RetryConfig,

    /// Upper bound on waiting for in-flight work during shutdown
    #[serde(default = "default_shutdown_timeout", with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            maintenance_interval: default_maintenance_interval(),
            event_buffer: default_event_buffer(),
            submit_retry: default_submit_retry(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// REST API configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address to bind to (default: 127.0.0.1:6790)
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,

    /// Enable CORS for browser access (default: true)
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// Allowed CORS origins (default: ["*"])
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    /// Enable Swagger UI at /swagger-ui (default: true)
    #[serde(default = "default_true")]
    pub swagger_ui: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            cors_enabled: true,
            cors_origins: default_cors_origins(),
            swagger_ui: true,
        }
    }
}

/// Operator settings configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SettingsConfig {
    /// File touched whenever the channel list changes, so the ingestion
    /// process can pick up the new list
    #[serde(default)]
    pub reload_flag_path: Option<PathBuf>,
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./swipe-dl.db")
}

fn default_relay_api_url() -> String {
    "https://api.linode.com/v4".to_string()
}

fn default_region() -> String {
    "ap-northeast".to_string()
}

fn default_instance_type() -> String {
    "g6-nanode-1".to_string()
}

fn default_image() -> String {
    "linode/debian12".to_string()
}

fn default_label_prefix() -> String {
    "swipe-".to_string()
}

fn default_relay_port() -> u16 {
    8888
}

fn default_relay_user() -> String {
    "swipe".to_string()
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_provision_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_provider_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_probe_url() -> String {
    "https://ifconfig.me/ip".to_string()
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(180)
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_hourly_rate() -> f64 {
    0.0075
}

fn default_billing_unit() -> Duration {
    Duration::from_secs(60)
}

fn default_destroy_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 4,
        initial_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(30),
        backoff_multiplier: 2.0,
        jitter: true,
    }
}

fn default_storage_api_url() -> String {
    "http://127.0.0.1:8700/api".to_string()
}

fn default_ready_timeout() -> Duration {
    Duration::from_secs(1800)
}

fn default_ready_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:6800/jsonrpc".to_string()
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_split() -> u32 {
    16
}

fn default_rpc_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_stall_grace() -> Duration {
    Duration::from_secs(600)
}

fn default_workers() -> usize {
    4
}

fn default_maintenance_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_event_buffer() -> usize {
    1024
}

fn default_submit_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(30),
        backoff_multiplier: 2.0,
        jitter: true,
    }
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 6790))
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_object_yields_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();

        assert_eq!(config.relay.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.relay.billing_unit, Duration::from_secs(60));
        assert_eq!(config.relay.label_prefix, "swipe-");
        assert_eq!(config.monitor.stall_policy, StallPolicy::Fail);
        assert_eq!(config.orchestrator.workers, 4);
        assert_eq!(config.transfer.split, 16);
        assert!(config.storage.route_through_relay);
        assert_eq!(config.storage.ready_timeout, Duration::from_secs(1800));
        assert_eq!(config.storage.ready_poll_interval, Duration::from_secs(10));
        config.validate().unwrap();
    }

    #[test]
    fn durations_deserialize_from_seconds() {
        let json = r#"{
            "relay": { "idle_timeout": 90, "billing_unit": 3600 },
            "monitor": { "poll_interval": 2, "stall_grace": 30, "stall_policy": "surface" }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();

        assert_eq!(config.relay.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.relay.billing_unit, Duration::from_secs(3600));
        assert_eq!(config.monitor.poll_interval, Duration::from_secs(2));
        assert_eq!(config.monitor.stall_policy, StallPolicy::Surface);
    }

    #[test]
    fn duration_rejects_string_values() {
        let json = r#"{ "relay": { "idle_timeout": "5m" } }"#;
        assert!(serde_json::from_str::<Config>(json).is_err());
    }

    #[test]
    fn secrets_are_never_serialized() {
        let mut config = Config::default();
        config.relay.api_token = Some("linode-secret".into());
        config.storage.api_token = Some("storage-secret".into());
        config.transfer.rpc_secret = Some("aria-secret".into());

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("linode-secret"));
        assert!(!json.contains("storage-secret"));
        assert!(!json.contains("aria-secret"));
    }

    #[test]
    fn env_overrides_replace_secrets_and_paths() {
        let vars: HashMap<&str, &str> = [
            ("LINODE_TOKEN", "tok"),
            ("ARIA2_RPC_SECRET", "sec"),
            ("ARIA2_RPC_URL", "http://10.0.0.2:6800/jsonrpc"),
            ("SWIPE_DL_DATABASE", "/var/lib/swipe/db.sqlite"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.relay.api_token.as_deref(), Some("tok"));
        assert_eq!(config.transfer.rpc_secret.as_deref(), Some("sec"));
        assert_eq!(config.transfer.rpc_url, "http://10.0.0.2:6800/jsonrpc");
        assert_eq!(
            config.persistence.database_path,
            PathBuf::from("/var/lib/swipe/db.sqlite")
        );
        assert!(config.storage.api_token.is_none());
    }

    #[test]
    fn validate_rejects_empty_label_prefix() {
        let mut config = Config::default();
        config.relay.label_prefix.clear();

        match config.validate() {
            Err(Error::Config { key, .. }) => {
                assert_eq!(key.as_deref(), Some("relay.label_prefix"))
            }
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_zero_billing_unit_and_workers() {
        let mut config = Config::default();
        config.relay.billing_unit = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.orchestrator.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_malformed_urls() {
        let mut config = Config::default();
        config.transfer.rpc_url = "not a url".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_json_file_reads_and_reports_errors() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.json");
        std::fs::write(&good, r#"{ "orchestrator": { "workers": 2 } }"#).unwrap();
        assert_eq!(Config::from_json_file(&good).unwrap().orchestrator.workers, 2);

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ nope").unwrap();
        assert!(matches!(
            Config::from_json_file(&bad),
            Err(Error::Config { .. })
        ));

        assert!(Config::from_json_file(&dir.path().join("missing.json")).is_err());
    }
}
