//! Blocking HTTP implementations of the delivery and config-fetch seams.
//!
//! Both clients carry their own timeout. They block, so async callers run
//! them through `spawn_blocking`.

use crate::error::{AgentError, Result};
use crate::flush::{DeliveryTransport, FlushBatch};
use crate::remote::ConfigSource;
use log::debug;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use std::time::Duration;

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AgentError::Transport(format!("http client build failed: {}", e)))
}

fn require_endpoint(endpoint: String) -> Result<String> {
    if endpoint.trim().is_empty() {
        return Err(AgentError::Transport("endpoint must not be empty".to_string()));
    }
    Ok(endpoint)
}

/// Posts gzipped event batches to the collection server.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            endpoint: require_endpoint(endpoint.into())?,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl DeliveryTransport for HttpTransport {
    fn deliver(&self, batch: &FlushBatch) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, "gzip")
            .body(batch.body.clone())
            .send()
            .map_err(|e| AgentError::Transport(format!("upload failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Transport(format!(
                "upload returned status {}",
                status
            )));
        }
        debug!("uploaded {} events, status {}", batch.len(), status);
        Ok(())
    }
}

/// Fetches remote config documents. Sends the cached version as `v`;
/// `304 Not Modified` maps to `Ok(None)`.
#[derive(Debug, Clone)]
pub struct HttpConfigSource {
    client: Client,
    endpoint: String,
}

impl HttpConfigSource {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            endpoint: require_endpoint(endpoint.into())?,
        })
    }
}

impl ConfigSource for HttpConfigSource {
    fn fetch(&self, current_version: Option<&str>) -> Result<Option<String>> {
        let mut request = self.client.get(&self.endpoint);
        if let Some(version) = current_version {
            request = request.query(&[("v", version)]);
        }

        let response = request
            .send()
            .map_err(|e| AgentError::ConfigFetch(format!("request failed: {}", e)))?;

        match response.status() {
            StatusCode::NOT_MODIFIED => Ok(None),
            status if status.is_success() => {
                let body = response
                    .text()
                    .map_err(|e| AgentError::ConfigFetch(format!("read failed: {}", e)))?;
                Ok(Some(body))
            }
            status => Err(AgentError::ConfigFetch(format!(
                "config endpoint returned status {}",
                status
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_endpoints_rejected() {
        let timeout = Duration::from_secs(1);
        assert!(HttpTransport::new("  ", timeout).is_err());
        assert!(HttpConfigSource::new("", timeout).is_err());
    }

    #[test]
    fn test_unreachable_server_is_transport_error() {
        let transport =
            HttpTransport::new("http://127.0.0.1:9/collect", Duration::from_millis(200)).unwrap();
        let batch = FlushBatch::new(vec![serde_json::json!({"event": "A"})], 1).unwrap();
        assert!(matches!(
            transport.deliver(&batch),
            Err(AgentError::Transport(_))
        ));

        let source =
            HttpConfigSource::new("http://127.0.0.1:9/config", Duration::from_millis(200)).unwrap();
        assert!(matches!(
            source.fetch(Some("3")),
            Err(AgentError::ConfigFetch(_))
        ));
    }
}
