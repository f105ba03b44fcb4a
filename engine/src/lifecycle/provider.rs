//! Scaling control plane clients
//!
//! An [`EndpointProvider`] starts, stops and probes the compute behind one
//! endpoint. The HTTP provider speaks a minimal control protocol:
//!
//! - `POST {control_url}/wake`  request scale-up
//! - `POST {control_url}/sleep` request scale-down
//! - `GET  {control_url}/health` 2xx once the model server is ready

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::time::Duration;

use sdk::errors::EngineError;

use crate::retry::is_retryable_status;
use crate::secrets::{scrub, SecretString};

/// Timeout for individual control plane requests
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors reported by a provider
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Worth retrying (connect failure, 5xx, 429)
    #[error("provider temporarily unavailable: {0}")]
    Transient(String),

    /// Definitive refusal (bad credentials, unknown deployment, quota)
    #[error("provider rejected request: {0}")]
    Rejected(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

impl From<ProviderError> for EngineError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Transient(msg) => EngineError::transient(scrub(&msg)),
            ProviderError::Rejected(msg) => EngineError::permanent(scrub(&msg)),
        }
    }
}

/// Trait for the compute provider behind one endpoint
#[async_trait]
pub trait EndpointProvider: Send + Sync {
    /// Provider identity (e.g. "modal", "runpod", "http")
    fn name(&self) -> &str;

    /// Ask the provider to bring compute up
    async fn scale_up(&self) -> Result<(), ProviderError>;

    /// Ask the provider to release compute
    async fn scale_down(&self) -> Result<(), ProviderError>;

    /// Whether the model server answers and can take generation calls
    async fn is_ready(&self) -> Result<bool, ProviderError>;
}

/// Provider driven through an HTTP control plane
pub struct HttpEndpointProvider {
    name: String,
    control_url: String,
    client: Client,
    api_key: Option<SecretString>,
}

impl HttpEndpointProvider {
    pub fn new(
        name: impl Into<String>,
        control_url: impl Into<String>,
        api_key: Option<SecretString>,
    ) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(CONTROL_TIMEOUT)
            .build()
            .map_err(|e| EngineError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            name: name.into(),
            control_url: control_url.into().trim_end_matches('/').to_string(),
            client,
            api_key,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(reqwest::header::AUTHORIZATION, key.bearer()),
            None => request,
        }
    }

    async fn command(&self, action: &str) -> Result<(), ProviderError> {
        let url = format!("{}/{}", self.control_url, action);
        let response = self
            .authorize(self.client.post(&url))
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("{} {}: {}", action, url, e)))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(provider = %self.name, action, "Control request acknowledged");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let msg = format!("{} returned HTTP {}: {}", action, status.as_u16(), body.trim());
        if is_retryable_status(status) {
            Err(ProviderError::Transient(msg))
        } else {
            Err(ProviderError::Rejected(msg))
        }
    }
}

#[async_trait]
impl EndpointProvider for HttpEndpointProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scale_up(&self) -> Result<(), ProviderError> {
        self.command("wake").await
    }

    async fn scale_down(&self) -> Result<(), ProviderError> {
        self.command("sleep").await
    }

    async fn is_ready(&self) -> Result<bool, ProviderError> {
        let url = format!("{}/health", self.control_url);
        let response = match self.authorize(self.client.get(&url)).send().await {
            Ok(response) => response,
            // Nothing listening yet while the container cold-starts
            Err(_) => return Ok(false),
        };

        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ProviderError::Rejected(
                format!("health probe returned HTTP {}", response.status().as_u16()),
            )),
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_mapping() {
        let e: EngineError = ProviderError::Transient("503".into()).into();
        assert!(e.is_retryable());
        let e: EngineError = ProviderError::Rejected("quota exceeded".into()).into();
        assert!(!e.is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_control_plane_is_not_ready() {
        let provider = HttpEndpointProvider::new("http", "http://127.0.0.1:9/", None).unwrap();
        assert_eq!(provider.control_url, "http://127.0.0.1:9");
        assert!(!provider.is_ready().await.unwrap());
        assert!(provider.scale_up().await.unwrap_err().is_transient());
    }
}
