//! JSON frame protocol spoken over the bidirectional client channel.
//!
//! Client → server: `auth`, `logout`, `chat`, `ping`, plus the `history` and
//! `clear` conveniences. Unknown or malformed frames never kill the
//! connection — they come back as non-fatal `error` frames.
//!
//! Server → client frames all carry an RFC 3339 `timestamp`.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chatbridge::credentials::{Credentials, DEFAULT_API_KEY_HEADER};

/// RFC 3339 timestamp for outbound frames.
pub fn now_ts() -> String {
    Utc::now().to_rfc3339()
}

/// Payload of an `auth` frame before credential mapping.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthRequest {
    pub auth_type: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_header: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub custom_headers: Option<HashMap<String, String>>,
}

impl AuthRequest {
    /// Map the frame payload onto a [`Credentials`] variant.
    ///
    /// Missing type-specific fields produce a message suitable for an
    /// `auth_failed` reply.
    pub fn into_credentials(self) -> Result<Credentials, String> {
        match self.auth_type.as_str() {
            "bearer_token" => {
                let token = self.token.filter(|t| !t.is_empty());
                token
                    .map(|token| Credentials::BearerToken { token })
                    .ok_or_else(|| "Bearer token required".to_string())
            }
            "basic_auth" => match (self.username, self.password) {
                (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                    Ok(Credentials::BasicAuth { username, password })
                }
                _ => Err("Username and password required for basic auth".to_string()),
            },
            "api_key" => {
                let key = self.api_key.filter(|k| !k.is_empty());
                key.map(|key| Credentials::ApiKey {
                    key,
                    header_name: self
                        .api_key_header
                        .unwrap_or_else(|| DEFAULT_API_KEY_HEADER.to_string()),
                })
                .ok_or_else(|| "API key required".to_string())
            }
            "oauth2" | "oauth2_client_credentials" => {
                match (self.client_id, self.client_secret, self.token_url) {
                    (Some(client_id), Some(client_secret), Some(token_url))
                        if !client_id.is_empty()
                            && !client_secret.is_empty()
                            && !token_url.is_empty() =>
                    {
                        Ok(Credentials::OAuth2ClientCredentials {
                            client_id,
                            client_secret,
                            token_url,
                            scope: self.scope,
                        })
                    }
                    _ => Err(
                        "client_id, client_secret, and token_url required for OAuth2".to_string()
                    ),
                }
            }
            "custom" => {
                let headers = self.custom_headers.unwrap_or_default();
                if headers.is_empty() {
                    Err("custom_headers required for custom auth".to_string())
                } else {
                    Ok(Credentials::Custom { headers })
                }
            }
            other => Err(format!("Unknown auth type: {}", other)),
        }
    }
}

/// Inbound frame, dispatched by the orchestrator.
#[derive(Debug, Clone)]
pub enum ClientFrame {
    Auth(AuthRequest),
    Logout,
    Chat { message: String },
    Ping,
    History,
    Clear,
}

/// Why an inbound frame could not be dispatched.
#[derive(Debug, Clone)]
pub enum FrameError {
    Malformed(String),
    UnknownType(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Malformed(msg) => write!(f, "Invalid JSON: {}", msg),
            FrameError::UnknownType(t) => write!(f, "Unknown message type: {}", t),
        }
    }
}

impl ClientFrame {
    /// Parse one raw text frame.
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| FrameError::Malformed(e.to_string()))?;

        let frame_type = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("chat")
            .to_string();

        match frame_type.as_str() {
            "auth" => serde_json::from_value::<AuthRequest>(value)
                .map(ClientFrame::Auth)
                .map_err(|e| FrameError::Malformed(e.to_string())),
            "logout" => Ok(ClientFrame::Logout),
            "chat" => {
                let message = value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(ClientFrame::Chat { message })
            }
            "ping" => Ok(ClientFrame::Ping),
            "history" => Ok(ClientFrame::History),
            "clear" => Ok(ClientFrame::Clear),
            other => Err(FrameError::UnknownType(other.to_string())),
        }
    }
}

/// Outbound frame.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ConnectionEstablished {
        session_id: String,
        message: String,
        timestamp: String,
    },
    AuthConfigured {
        auth_type: String,
        message: String,
        timestamp: String,
    },
    AuthFailed {
        message: String,
        timestamp: String,
    },
    LogoutSuccess {
        message: String,
        timestamp: String,
    },
    Typing {
        typing: bool,
        message: String,
        timestamp: String,
    },
    AiResponse {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_results: Option<Value>,
        timestamp: String,
    },
    Pong {
        timestamp: String,
    },
    Error {
        message: String,
        timestamp: String,
    },
    History {
        messages: Value,
        timestamp: String,
    },
    HistoryCleared {
        message: String,
        timestamp: String,
    },
}

impl ServerFrame {
    pub fn connection_established(session_id: &str) -> Self {
        ServerFrame::ConnectionEstablished {
            session_id: session_id.to_string(),
            message: "Connected to AI assistant".to_string(),
            timestamp: now_ts(),
        }
    }

    pub fn auth_configured(auth_type: &str) -> Self {
        ServerFrame::AuthConfigured {
            auth_type: auth_type.to_string(),
            message: format!("Authentication configured: {}", auth_type),
            timestamp: now_ts(),
        }
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        ServerFrame::AuthFailed {
            message: message.into(),
            timestamp: now_ts(),
        }
    }

    pub fn logout_success() -> Self {
        ServerFrame::LogoutSuccess {
            message: "Successfully logged out".to_string(),
            timestamp: now_ts(),
        }
    }

    pub fn typing(active: bool, message: impl Into<String>) -> Self {
        ServerFrame::Typing {
            typing: active,
            message: message.into(),
            timestamp: now_ts(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
            timestamp: now_ts(),
        }
    }

    pub fn pong() -> Self {
        ServerFrame::Pong { timestamp: now_ts() }
    }

    /// Serialize for the wire.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            "{\"type\":\"error\",\"message\":\"frame serialization failed\"}".to_string()
        })
    }
}
