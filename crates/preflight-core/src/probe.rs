//! Liveness probing of the server's base URL.

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Outcome of a single liveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The server answered, with any status code.
    Reachable { status: u16 },

    /// Connection refused, DNS failure, timeout, ... Routine during startup.
    Unreachable { reason: String },
}

impl ProbeOutcome {
    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeOutcome::Reachable { .. })
    }
}

/// A single liveness check.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self) -> ProbeOutcome;
}

/// Probe that issues `GET <base_url>/`.
pub struct HttpProbe {
    url: String,
    client: reqwest::Client,
}

impl HttpProbe {
    /// Create a probe with the given per-request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("katago-preflight/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .no_proxy()
            .build()?;

        Ok(Self {
            url: format!("{}/", base_url.trim_end_matches('/')),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self) -> ProbeOutcome {
        match self.client.get(&self.url).send().await {
            Ok(response) => ProbeOutcome::Reachable {
                status: response.status().as_u16(),
            },
            Err(e) => {
                let reason = if e.is_timeout() {
                    "timed out".to_string()
                } else if e.is_connect() {
                    "connection failed".to_string()
                } else {
                    e.to_string()
                };
                debug!(url = %self.url, reason = %reason, "Liveness probe failed");
                ProbeOutcome::Unreachable { reason }
            }
        }
    }
}
