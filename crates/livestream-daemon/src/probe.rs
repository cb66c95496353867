//! Single-URL reachability check.
//!
//! A stream is alive when the server answers `200 OK` *and* delivers at least
//! one body byte within the read timeout. The second stage catches servers
//! that accept the connection and send headers but never any audio.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use tokio::time::timeout;
use tracing::debug;

use livestream_proto::config::CheckConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Alive { first_chunk: usize },
    BadStatus(u16),
    EmptyBody,
    Timeout,
    Error(String),
}

impl ProbeOutcome {
    pub fn is_alive(&self) -> bool {
        matches!(self, ProbeOutcome::Alive { .. })
    }
}

pub struct HealthProbe {
    client: Client,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl HealthProbe {
    pub fn new(config: &CheckConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .redirect(reqwest::redirect::Policy::limited(10))
            .user_agent(concat!("livestream/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
        })
    }

    pub async fn probe(&self, url: &str) -> bool {
        self.check(url).await.is_alive()
    }

    pub async fn check(&self, url: &str) -> ProbeOutcome {
        let outcome = self.check_inner(url).await;
        match &outcome {
            ProbeOutcome::Alive { first_chunk } => {
                debug!("probe: {} alive, first chunk {} bytes", url, first_chunk)
            }
            other => debug!("probe: {} failed: {:?}", url, other),
        }
        outcome
    }

    async fn check_inner(&self, url: &str) -> ProbeOutcome {
        // Connecting is bounded by the client; the headers get their own
        // read budget on top.
        let header_budget = self.connect_timeout + self.read_timeout;
        let mut resp = match timeout(header_budget, self.client.get(url).send()).await {
            Err(_) => return ProbeOutcome::Timeout,
            Ok(Err(e)) => return classify(e),
            Ok(Ok(r)) => r,
        };

        if resp.status() != StatusCode::OK {
            return ProbeOutcome::BadStatus(resp.status().as_u16());
        }

        let first_chunk = timeout(self.read_timeout, async {
            loop {
                match resp.chunk().await {
                    Ok(Some(bytes)) if bytes.is_empty() => continue,
                    Ok(Some(bytes)) => return Ok(Some(bytes.len())),
                    Ok(None) => return Ok(None),
                    Err(e) => return Err(e),
                }
            }
        })
        .await;

        match first_chunk {
            Err(_) => ProbeOutcome::Timeout,
            Ok(Ok(Some(n))) => ProbeOutcome::Alive { first_chunk: n },
            Ok(Ok(None)) => ProbeOutcome::EmptyBody,
            Ok(Err(e)) => classify(e),
        }
    }
}

fn classify(e: reqwest::Error) -> ProbeOutcome {
    if e.is_timeout() {
        ProbeOutcome::Timeout
    } else {
        ProbeOutcome::Error(e.to_string())
    }
}
