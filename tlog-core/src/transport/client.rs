//! HTTP transport for the collection endpoint

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use crate::config::CollectorConfig;
use crate::error::{Error, Result};

use super::{SendOutcome, Transport, BEACON_MAX_BYTES};

/// Beacons get a short deadline; nobody waits for them.
const BEACON_TIMEOUT_SECS: u64 = 5;

/// reqwest-backed [`Transport`]
pub struct HttpTransport {
    endpoint: String,
    headers: HeaderMap,
    http_client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport from configuration
    ///
    /// Returns an error if the endpoint is missing or a header value is invalid.
    pub fn new(config: &CollectorConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| Error::Config("collector.endpoint is required".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(api_key) = &config.api_key {
            let auth_value = format!("Bearer {}", api_key);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value)
                    .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?,
            );
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers.clone())
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            endpoint,
            headers,
            http_client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, body: String) -> SendOutcome {
        let response = match self.http_client.post(&self.endpoint).body(body).send().await {
            Ok(response) => response,
            Err(e) => {
                let reason = if e.is_timeout() {
                    "request timed out".to_string()
                } else {
                    format!("HTTP request failed: {}", e)
                };
                return SendOutcome::TransientFailure { reason };
            }
        };

        SendOutcome::from_status(response.status().as_u16())
    }

    fn send_beacon(&self, body: String) -> bool {
        if body.len() > BEACON_MAX_BYTES {
            return false;
        }

        let endpoint = self.endpoint.clone();
        let headers = self.headers.clone();

        // The blocking client owns its own runtime, so it must not run on a
        // tokio worker; a detached thread also outlives a dropped runtime.
        std::thread::Builder::new()
            .name("tlog-beacon".to_string())
            .spawn(move || {
                let client = match reqwest::blocking::Client::builder()
                    .timeout(Duration::from_secs(BEACON_TIMEOUT_SECS))
                    .default_headers(headers)
                    .build()
                {
                    Ok(client) => client,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to build beacon client");
                        return;
                    }
                };

                match client.post(&endpoint).body(body).send() {
                    Ok(response) if response.status().is_success() => {}
                    Ok(response) => {
                        tracing::debug!(status = %response.status(), "Beacon rejected by endpoint");
                    }
                    Err(e) => tracing::debug!(error = %e, "Beacon delivery failed"),
                }
            })
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_requires_endpoint() {
        let config = CollectorConfig::default();
        assert!(HttpTransport::new(&config).is_err());
    }

    #[test]
    fn test_transport_with_valid_config() {
        let config = CollectorConfig {
            endpoint: Some("https://collect.example.com/events".to_string()),
            api_key: Some("key_test".to_string()),
            ..Default::default()
        };
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(transport.endpoint(), "https://collect.example.com/events");
    }

    #[test]
    fn test_invalid_api_key_is_config_error() {
        let config = CollectorConfig {
            endpoint: Some("https://collect.example.com/events".to_string()),
            api_key: Some("bad\nkey".to_string()),
            ..Default::default()
        };
        assert!(matches!(HttpTransport::new(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_oversized_beacon_is_refused() {
        let config = CollectorConfig {
            endpoint: Some("http://127.0.0.1:9/events".to_string()),
            ..Default::default()
        };
        let transport = HttpTransport::new(&config).unwrap();
        assert!(!transport.send_beacon("x".repeat(BEACON_MAX_BYTES + 1)));
    }
}
