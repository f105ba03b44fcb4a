//! HTTP tool backend client
//!
//! - `GET  {base_url}/tools`  -> `{"tools": [ToolSpec, ...]}`
//! - `POST {base_url}/call`   `{name, arguments, id}` -> `{success, tool_call_id, result | error}`
//! - `GET  {base_url}/health` -> any 2xx

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use sdk::backend::{BackendError, ToolBackend};
use sdk::errors::EngineError;
use sdk::harmony::{ToolCall, ToolSpec};
use sdk::types::{ToolExecutionResponse, ToolFailureKind};

use crate::secrets::{scrub, SecretString};

#[derive(Deserialize)]
struct ToolList {
    tools: Vec<ToolSpec>,
}

#[derive(Serialize)]
struct CallRequest<'a> {
    name: &'a str,
    arguments: &'a Map<String, Value>,
    id: &'a str,
}

/// Tool backend reached over HTTP
pub struct HttpToolBackend {
    id: String,
    base_url: String,
    client: Client,
    api_key: Option<SecretString>,
}

impl HttpToolBackend {
    /// The per-call timeout is enforced by the tool orchestrator, not here.
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<SecretString>,
    ) -> Result<Self, EngineError> {
        let client = Client::builder()
            .build()
            .map_err(|e| EngineError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            id: id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
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

    fn map_send_error(&self, e: reqwest::Error) -> BackendError {
        if e.is_timeout() {
            BackendError::Timeout
        } else {
            BackendError::Unreachable(format!("{}: {}", self.base_url, scrub(&e.to_string())))
        }
    }
}

#[async_trait]
impl ToolBackend for HttpToolBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>, BackendError> {
        let url = format!("{}/tools", self.base_url);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(match status {
                StatusCode::BAD_GATEWAY
                | StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::GATEWAY_TIMEOUT => {
                    BackendError::Unreachable(format!("tool list returned HTTP {}", status.as_u16()))
                }
                _ => BackendError::Protocol(format!("tool list returned HTTP {}", status.as_u16())),
            });
        }

        let list: ToolList = response
            .json()
            .await
            .map_err(|e| BackendError::Protocol(format!("invalid tool list: {}", e)))?;

        Ok(list.tools)
    }

    async fn call_tool(&self, call: &ToolCall) -> Result<Value, BackendError> {
        let url = format!("{}/call", self.base_url);
        let request = CallRequest {
            name: &call.name,
            arguments: &call.arguments,
            id: &call.id,
        };

        let response = self
            .authorize(self.client.post(&url))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = scrub(response.text().await.unwrap_or_default().trim());
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                    BackendError::InvalidRequest(body)
                }
                StatusCode::BAD_GATEWAY
                | StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::GATEWAY_TIMEOUT => {
                    BackendError::Unreachable(format!("HTTP {}: {}", status.as_u16(), body))
                }
                _ => BackendError::Application(format!("HTTP {}: {}", status.as_u16(), body)),
            });
        }

        let reply: ToolExecutionResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Protocol(format!("invalid tool response: {}", e)))?;

        if reply.tool_call_id != call.id {
            return Err(BackendError::Protocol(format!(
                "response answers '{}', expected '{}'",
                reply.tool_call_id, call.id
            )));
        }

        match (reply.success, reply.error) {
            (true, _) => Ok(reply.result.unwrap_or(Value::Null)),
            (false, Some(failure)) if failure.kind == ToolFailureKind::Validation => {
                Err(BackendError::InvalidRequest(failure.message))
            }
            (false, Some(failure)) => Err(BackendError::Application(failure.message)),
            (false, None) => Err(BackendError::Application(
                "tool reported failure without an error".to_string(),
            )),
        }
    }

    async fn health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.authorize(self.client.get(&url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
