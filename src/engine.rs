use std::time::Duration;

use reqwest::{blocking::Client, header::CONTENT_TYPE, StatusCode};

use crate::{config::EngineConfig, error::BridgeError};

/// The engine's local HTTP endpoint. Blocking, so callers on the async
/// runtime go through `spawn_blocking`.
pub trait EngineTransport: Send + Sync {
    /// True when the engine answers a plain GET with 200.
    fn probe(&self) -> bool;
    /// Posts an XML body and returns the raw response text.
    fn post(&self, body: Vec<u8>) -> Result<String, BridgeError>;
}

pub struct HttpEngine {
    url: String,
    client: Client,
    probe_timeout: Duration,
    request_timeout: Duration,
}

impl HttpEngine {
    pub fn new(config: &EngineConfig) -> Result<Self, BridgeError> {
        let client = Client::builder()
            .build()
            .map_err(|e| BridgeError::Transport(e.to_string()))?;
        Ok(Self {
            url: config.url.clone(),
            client,
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }
}

impl EngineTransport for HttpEngine {
    fn probe(&self) -> bool {
        match self.client.get(&self.url).timeout(self.probe_timeout).send() {
            Ok(resp) => resp.status() == StatusCode::OK,
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "Engine probe failed");
                false
            }
        }
    }

    fn post(&self, body: Vec<u8>) -> Result<String, BridgeError> {
        let resp = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "text/xml")
            .timeout(self.request_timeout)
            .body(body)
            .send()
            .map_err(|e| BridgeError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BridgeError::Transport(format!("engine answered HTTP {}", status)));
        }
        resp.text().map_err(|e| BridgeError::Transport(e.to_string()))
    }
}
