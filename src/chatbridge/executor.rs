//! Tool execution: one authenticated HTTP call per model tool-use request.
//!
//! The executor is stateless — every piece of per-session context (credential
//! store, descriptor table, HTTP client) arrives at construction and is shared
//! behind `Arc`. Failures never abort the turn: they are folded into an error
//! tool result so the model can react.
//!
//! Fan-out over several tool_use blocks of one assistant turn runs
//! concurrently up to `max_tool_calls_per_turn`; results are returned in
//! request order regardless of completion order — the pairing invariant in
//! the conversation manager depends on that ordering.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::Value;

use crate::chatbridge::catalog::{ParamLocation, ToolCatalog, ToolDescriptor};
use crate::chatbridge::config::BridgeConfig;
use crate::chatbridge::credentials::CredentialStore;
use crate::chatbridge::invoker::ToolCallRequest;
use crate::chatbridge::retry::RetryPolicy;

/// Outcome of one tool invocation, ready for insertion into history.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    /// Pairing reference copied from the originating tool_use block.
    pub tool_use_id: String,
    pub name: String,
    /// Textual result body; JSON bodies are re-serialized compactly.
    pub content: String,
    pub is_error: bool,
    /// HTTP status of the final attempt, when a response was received.
    pub status: Option<u16>,
}

impl ToolOutcome {
    fn error(call: &ToolCallRequest, message: impl Into<String>) -> Self {
        Self {
            tool_use_id: call.id.clone(),
            name: call.name.clone(),
            content: message.into(),
            is_error: true,
            status: None,
        }
    }
}

/// Capability to execute tool invocations.
///
/// The orchestrator talks to this seam; [`HttpToolExecutor`] is the production
/// implementation.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Execute a single invocation. Never fails — errors become error outcomes.
    async fn execute(&self, call: &ToolCallRequest) -> ToolOutcome;

    /// Execute a batch, returning outcomes in request order.
    async fn execute_many(&self, calls: &[ToolCallRequest], concurrency: usize) -> Vec<ToolOutcome> {
        // buffered() preserves input order while running up to `concurrency`
        // calls at once. The futures are collected eagerly so the stream
        // isn't built from a generic closure with an unresolvable HRTB.
        let futures: Vec<_> = calls.iter().map(|call| self.execute(call)).collect();
        stream::iter(futures).buffered(concurrency.max(1)).collect().await
    }
}

/// Executes tool calls as HTTP requests against the target API.
pub struct HttpToolExecutor {
    catalog: Arc<ToolCatalog>,
    credentials: Arc<CredentialStore>,
    http: reqwest::Client,
    config: Arc<BridgeConfig>,
    retry: RetryPolicy,
}

/// Pure request-building output, separable for testing.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestParts {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl HttpToolExecutor {
    pub fn new(
        catalog: Arc<ToolCatalog>,
        credentials: Arc<CredentialStore>,
        http: reqwest::Client,
        config: Arc<BridgeConfig>,
    ) -> Self {
        Self {
            catalog,
            credentials,
            http,
            retry: RetryPolicy::from_config(&config),
            config,
        }
    }

    /// Route arguments into path substitutions, query parameters, and the JSON
    /// body per the descriptor's parameter schema.
    pub fn build_request_parts(
        base_url: &str,
        descriptor: &ToolDescriptor,
        arguments: &Value,
    ) -> Result<RequestParts, String> {
        let args: HashMap<&str, &Value> = match arguments {
            Value::Object(map) => map.iter().map(|(k, v)| (k.as_str(), v)).collect(),
            Value::Null => HashMap::new(),
            _ => return Err("arguments must be a JSON object".to_string()),
        };

        let mut path = descriptor.path.clone();
        let mut query = Vec::new();
        let mut body_fields = serde_json::Map::new();
        let method_takes_body = matches!(descriptor.method.as_str(), "POST" | "PUT" | "PATCH");

        for (name, value) in &args {
            let placeholder = format!("{{{}}}", name);
            let location = descriptor
                .parameters
                .iter()
                .find(|p| p.name == **name)
                .map(|p| p.location)
                .unwrap_or_else(|| {
                    // Arguments absent from the schema route by position in the
                    // path template, then by method.
                    if path.contains(&placeholder) {
                        ParamLocation::Path
                    } else if method_takes_body {
                        ParamLocation::Body
                    } else {
                        ParamLocation::Query
                    }
                });

            match location {
                ParamLocation::Path => {
                    let encoded = urlencoding::encode(&scalar_to_string(value)).into_owned();
                    path = path.replace(&placeholder, &encoded);
                }
                ParamLocation::Query => {
                    query.push((name.to_string(), scalar_to_string(value)));
                }
                ParamLocation::Body => {
                    body_fields.insert(name.to_string(), (*value).clone());
                }
            }
        }

        if path.contains('{') {
            return Err(format!("unresolved path parameters in {}", path));
        }

        query.sort();
        Ok(RequestParts {
            url: format!("{}{}", base_url.trim_end_matches('/'), path),
            query,
            body: (!body_fields.is_empty() && method_takes_body)
                .then_some(Value::Object(body_fields)),
        })
    }

    async fn execute_http(&self, call: &ToolCallRequest, descriptor: &ToolDescriptor) -> ToolOutcome {
        let parts = match Self::build_request_parts(self.catalog.base_url(), descriptor, &call.arguments)
        {
            Ok(parts) => parts,
            Err(msg) => return ToolOutcome::error(call, msg),
        };

        let method: reqwest::Method = match descriptor.method.parse() {
            Ok(m) => m,
            Err(_) => {
                return ToolOutcome::error(
                    call,
                    format!("unsupported HTTP method: {}", descriptor.method),
                )
            }
        };

        let mut oauth2_retried = false;
        let mut attempt = 0u32;

        loop {
            let mut headers = HashMap::new();
            headers.insert("Content-Type".to_string(), "application/json".to_string());
            headers.insert("User-Agent".to_string(), "chatbridge/internal".to_string());

            if self.config.enable_tool_auth {
                if let Err(e) = self
                    .credentials
                    .apply(&mut headers, descriptor.auth_hint.as_ref(), &self.http)
                    .await
                {
                    // AuthAcquisitionFailed is retriable; bad credentials are not.
                    if attempt < self.retry.max_retries as u32
                        && matches!(
                            e,
                            crate::chatbridge::credentials::CredentialError::AuthAcquisitionFailed(_)
                        )
                    {
                        let delay = self.retry.delay_for(attempt);
                        log::warn!("auth acquisition failed, retrying in {:?}: {}", delay, e);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return ToolOutcome::error(call, format!("Authentication failed: {}", e));
                }
            }

            let mut request = self
                .http
                .request(method.clone(), &parts.url)
                .timeout(self.config.timeout);
            if !parts.query.is_empty() {
                request = request.query(&parts.query);
            }
            for (name, value) in &headers {
                request = request.header(name, value);
            }
            if let Some(body) = &parts.body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();

                    // 401 on an OAuth2 credential invalidates the cached token
                    // and retries exactly once.
                    if status == 401
                        && !oauth2_retried
                        && self.credentials.auth_type().await == "oauth2_client_credentials"
                    {
                        log::info!("401 on OAuth2 call, refreshing token and retrying once");
                        self.credentials.invalidate_token().await;
                        oauth2_retried = true;
                        continue;
                    }

                    if retryable_status(status) && attempt < self.retry.max_retries as u32 {
                        let delay = self.retry.delay_for(attempt);
                        log::warn!(
                            "tool {} returned HTTP {}, retrying in {:?}",
                            call.name,
                            status,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return finish_response(call, status, body);
                }
                Err(e) => {
                    let retryable = e.is_timeout() || e.is_connect();
                    if retryable && attempt < self.retry.max_retries as u32 {
                        let delay = self.retry.delay_for(attempt);
                        log::warn!("tool {} transport error, retrying in {:?}: {}", call.name, delay, e);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    let kind = if e.is_timeout() { "Request timeout" } else { "Request failed" };
                    return ToolOutcome::error(call, format!("{}: {}", kind, e));
                }
            }
        }
    }
}

#[async_trait]
impl ToolInvoker for HttpToolExecutor {
    async fn execute(&self, call: &ToolCallRequest) -> ToolOutcome {
        let Some(descriptor) = self.catalog.get(&call.name) else {
            log::warn!("unknown tool requested: {}", call.name);
            return ToolOutcome::error(call, format!("unknown tool: {}", call.name));
        };

        if let Err(diagnostic) = descriptor.validate_args(&call.arguments) {
            log::warn!("invalid arguments for {}: {}", call.name, diagnostic);
            return ToolOutcome::error(call, format!("Invalid arguments: {}", diagnostic));
        }

        log::debug!("executing tool call {} ({})", call.name, call.id);
        self.execute_http(call, descriptor).await
    }
}

/// Retryable HTTP statuses: upstream hiccups, not client mistakes.
fn retryable_status(status: u16) -> bool {
    matches!(status, 429 | 502 | 503 | 504)
}

/// Decode the response body: compact re-serialization for JSON, verbatim text
/// otherwise; non-2xx statuses are prefixed into the content.
fn finish_response(call: &ToolCallRequest, status: u16, body: String) -> ToolOutcome {
    let content = match serde_json::from_str::<Value>(&body) {
        Ok(value) => value.to_string(),
        Err(_) => body,
    };

    if (200..300).contains(&status) {
        ToolOutcome {
            tool_use_id: call.id.clone(),
            name: call.name.clone(),
            content,
            is_error: false,
            status: Some(status),
        }
    } else {
        ToolOutcome {
            tool_use_id: call.id.clone(),
            name: call.name.clone(),
            content: format!("HTTP {}: {}", status, content),
            is_error: true,
            status: Some(status),
        }
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
