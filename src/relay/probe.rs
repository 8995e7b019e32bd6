//! Application-level health probe through the relay

use super::RelayRoute;
use crate::config::RelayConfig;
use crate::error::{Error, RelayError, Result};
use crate::types::ProbeReport;
use async_trait::async_trait;
use std::time::{Duration, Instant};

/// Checks that traffic actually passes through a relay
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Fetch a known endpoint through the relay and report the egress address
    async fn probe(&self, route: &RelayRoute) -> Result<ProbeReport>;
}

/// Fetches a URL through the relay's HTTP proxy
pub struct HttpProxyProbe {
    url: String,
    timeout: Duration,
}

impl HttpProxyProbe {
    /// Probe `config.probe_url` with the configured request timeout
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            url: config.probe_url.clone(),
            timeout: config.request_timeout,
        }
    }
}

fn unhealthy(route: &RelayRoute, reason: impl std::fmt::Display) -> Error {
    Error::Relay(RelayError::HealthCheckFailed {
        address: route.endpoint(),
        reason: reason.to_string(),
    })
}

#[async_trait]
impl HealthProbe for HttpProxyProbe {
    async fn probe(&self, route: &RelayRoute) -> Result<ProbeReport> {
        let proxy = reqwest::Proxy::all(format!("http://{}", route.endpoint()))
            .map_err(|e| unhealthy(route, e))?
            .basic_auth(&route.username, &route.password);
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()
            .map_err(|e| unhealthy(route, e))?;

        let started = Instant::now();
        let response = client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| unhealthy(route, e))?;

        if !response.status().is_success() {
            return Err(unhealthy(
                route,
                format!("probe returned {}", response.status()),
            ));
        }

        let body = response.text().await.map_err(|e| unhealthy(route, e))?;
        Ok(ProbeReport {
            egress_ip: body.trim().to_string(),
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }
}
