//! HTTP generation client
//!
//! `POST {base_url}/v1/harmony/generate` with
//! `{model, messages, tools, settings}`; the endpoint answers
//! `{"message": {...}}` with one assistant message.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use sdk::errors::EngineError;
use sdk::harmony::{GenerationSettings, Message, Role, ToolSpec};

use super::validate::{
    check_tool_correlation, check_unique_tool_call_ids, validate_message, validate_settings,
    validate_tools,
};
use super::{HarmonyError, ModelClient, Result};
use crate::config::{Config, EndpointConfig, RetryConfig};
use crate::retry::{is_retryable_status, retry_with_backoff};
use crate::secrets::{scrub, SecretCache, SecretString};

/// Timeout for `/health` probes
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on error body text kept in an error message
const MAX_ERROR_BODY: usize = 512;

/// Where and how to reach one endpoint's model server
#[derive(Debug, Clone)]
pub struct EndpointTarget {
    pub base_url: String,
    pub model: String,
    pub request_timeout: Duration,
    pub api_key: Option<SecretString>,
}

impl EndpointTarget {
    pub fn from_config(config: &EndpointConfig, api_key: Option<SecretString>) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            request_timeout: config.request_timeout(),
            api_key,
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(reqwest::header::AUTHORIZATION, key.bearer()),
            None => request,
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    tools: &'a [ToolSpec],
    settings: &'a GenerationSettings,
}

/// Harmony client over HTTP
pub struct HarmonyClient {
    client: Client,
    endpoints: HashMap<String, EndpointTarget>,
    retry: RetryConfig,
}

impl HarmonyClient {
    /// Create a client with no endpoints registered
    pub fn new(retry: RetryConfig) -> std::result::Result<Self, EngineError> {
        let client = Client::builder()
            .build()
            .map_err(|e| EngineError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoints: HashMap::new(),
            retry,
        })
    }

    /// Register an endpoint under `key`
    pub fn with_endpoint(mut self, key: impl Into<String>, target: EndpointTarget) -> Self {
        self.endpoints.insert(key.into(), target);
        self
    }

    /// Build a client for every configured endpoint, resolving credentials.
    pub fn from_config(config: &Config, secrets: &SecretCache) -> std::result::Result<Self, EngineError> {
        let mut client = Self::new(config.retry.clone())?;
        for endpoint in &config.endpoints {
            let api_key = secrets.get_opt(endpoint.api_key_env.as_deref())?;
            client = client.with_endpoint(
                endpoint.key.clone(),
                EndpointTarget::from_config(endpoint, api_key),
            );
        }
        Ok(client)
    }

    fn target(&self, key: &str) -> Result<&EndpointTarget> {
        self.endpoints
            .get(key)
            .ok_or_else(|| HarmonyError::UnknownEndpoint(key.to_string()))
    }

    /// Generate the next assistant message.
    ///
    /// Inputs are validated before any network call. Transient failures are
    /// retried with backoff; the reply must be a valid assistant message.
    pub async fn generate_message(
        &self,
        endpoint_key: &str,
        conversation: &[Message],
        tools: &[ToolSpec],
        settings: &GenerationSettings,
    ) -> Result<Message> {
        let target = self.target(endpoint_key)?;

        if conversation.is_empty() {
            return Err(HarmonyError::Validation(
                "conversation must not be empty".to_string(),
            ));
        }
        check_tool_correlation(conversation)?;
        validate_tools(tools)?;

        let mut effective = settings.clone();
        if effective.model.is_empty() {
            effective.model = target.model.clone();
        }
        validate_settings(&effective)?;

        let request = GenerateRequest {
            model: &effective.model,
            messages: conversation,
            tools,
            settings: &effective,
        };

        tracing::debug!(
            endpoint = endpoint_key,
            model = %effective.model,
            messages = conversation.len(),
            tools = tools.len(),
            "Harmony generate request"
        );

        let start = Instant::now();
        let message = retry_with_backoff(
            &self.retry,
            "harmony.generate",
            |_| self.generate_once(target, &request),
            HarmonyError::is_transient,
        )
        .await?;

        tracing::info!(
            endpoint = endpoint_key,
            elapsed_ms = start.elapsed().as_millis() as u64,
            tool_calls = message.tool_calls().len(),
            "Harmony reply received"
        );

        Ok(message)
    }

    async fn generate_once(
        &self,
        target: &EndpointTarget,
        request: &GenerateRequest<'_>,
    ) -> Result<Message> {
        let url = format!("{}/v1/harmony/generate", target.base_url);

        let response = target
            .authorize(self.client.post(&url))
            .timeout(target.request_timeout)
            .json(request)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body = scrub(&truncate(&body, MAX_ERROR_BODY));
            return Err(if is_retryable_status(status) {
                HarmonyError::Transient(format!("HTTP {}: {}", status.as_u16(), body))
            } else {
                HarmonyError::Rejected {
                    status: status.as_u16(),
                    body,
                }
            });
        }

        let value: serde_json::Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                HarmonyError::Timeout
            } else {
                HarmonyError::Parse(format!("reply is not JSON: {}", e))
            }
        })?;

        let message_value = value
            .get("message")
            .ok_or_else(|| HarmonyError::Parse("reply has no 'message' field".to_string()))?;

        let message = validate_message(message_value).map_err(|e| match e {
            HarmonyError::Validation(msg) => HarmonyError::Parse(msg),
            other => other,
        })?;

        if message.role != Role::Assistant {
            return Err(HarmonyError::Parse(format!(
                "reply role is '{}', expected 'assistant'",
                message.role
            )));
        }
        check_unique_tool_call_ids(&message)?;

        Ok(message)
    }

    /// `GET {base_url}/health`; any 2xx counts as available.
    pub async fn probe(&self, endpoint_key: &str) -> Result<bool> {
        let target = self.target(endpoint_key)?;
        let url = format!("{}/health", target.base_url);

        let available = match target
            .authorize(self.client.get(&url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(endpoint = endpoint_key, "Health probe failed: {}", e);
                false
            }
        };

        Ok(available)
    }
}

#[async_trait]
impl ModelClient for HarmonyClient {
    async fn generate(
        &self,
        endpoint_key: &str,
        conversation: &[Message],
        tools: &[ToolSpec],
        settings: &GenerationSettings,
    ) -> std::result::Result<Message, EngineError> {
        Ok(self
            .generate_message(endpoint_key, conversation, tools, settings)
            .await?)
    }

    async fn is_model_available(&self, endpoint_key: &str) -> bool {
        self.probe(endpoint_key).await.unwrap_or(false)
    }
}

fn map_send_error(e: reqwest::Error) -> HarmonyError {
    if e.is_timeout() {
        HarmonyError::Timeout
    } else {
        HarmonyError::Transient(scrub(&e.to_string()))
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
