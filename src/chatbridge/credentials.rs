//! Per-session credential storage and authentication header application.
//!
//! The [`CredentialStore`] owns one [`Credentials`] variant per session and mints
//! request headers for the tool executor. OAuth2 client-credentials tokens are
//! cached inside the store with a `0.9 × expires_in` lifetime and refreshed under
//! a dedicated per-session lock, so at most one token fetch is ever in flight
//! for a given credential slot.
//!
//! Header rules per variant:
//!
//! - `BearerToken` / `BasicAuth` overwrite `Authorization`
//! - `ApiKey` writes its configured header name (default `X-API-Key`; the
//!   credential's own header name takes precedence over any tool auth hint)
//! - `OAuth2ClientCredentials` ensures a valid cached access token, then acts
//!   as Bearer
//! - `Custom` adds each custom header without replacing existing entries

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::{Mutex, RwLock};

use crate::chatbridge::config::BridgeConfig;

/// Default header name for API-key authentication.
pub const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";

/// Errors produced by credential ingestion and header application.
#[derive(Debug, Clone)]
pub enum CredentialError {
    /// The variant's required fields are missing/empty, or the type is not
    /// in the configured allow-list.
    BadCredentials(String),
    /// OAuth2 token acquisition failed (network or malformed token response).
    /// Retriable by the caller.
    AuthAcquisitionFailed(String),
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialError::BadCredentials(msg) => write!(f, "bad credentials: {}", msg),
            CredentialError::AuthAcquisitionFailed(msg) => {
                write!(f, "auth acquisition failed: {}", msg)
            }
        }
    }
}

impl Error for CredentialError {}

/// Tagged credential variant held by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    None,
    BearerToken {
        token: String,
    },
    BasicAuth {
        username: String,
        password: String,
    },
    ApiKey {
        key: String,
        header_name: String,
    },
    OAuth2ClientCredentials {
        client_id: String,
        client_secret: String,
        token_url: String,
        scope: Option<String>,
    },
    Custom {
        headers: HashMap<String, String>,
    },
}

impl Credentials {
    /// Wire name of the variant, as used by the `auth` frame and the allow-list.
    pub fn auth_type(&self) -> &'static str {
        match self {
            Credentials::None => "none",
            Credentials::BearerToken { .. } => "bearer_token",
            Credentials::BasicAuth { .. } => "basic_auth",
            Credentials::ApiKey { .. } => "api_key",
            Credentials::OAuth2ClientCredentials { .. } => "oauth2_client_credentials",
            Credentials::Custom { .. } => "custom",
        }
    }

    /// Check the variant's required fields are non-empty.
    pub fn validate(&self) -> Result<(), CredentialError> {
        let missing = |what: &str| {
            Err(CredentialError::BadCredentials(format!(
                "{} required for {}",
                what,
                self.auth_type()
            )))
        };
        match self {
            Credentials::None => Ok(()),
            Credentials::BearerToken { token } if token.is_empty() => missing("token"),
            Credentials::BearerToken { .. } => Ok(()),
            Credentials::BasicAuth { username, password }
                if username.is_empty() || password.is_empty() =>
            {
                missing("username and password")
            }
            Credentials::BasicAuth { .. } => Ok(()),
            Credentials::ApiKey { key, .. } if key.is_empty() => missing("api_key"),
            Credentials::ApiKey { .. } => Ok(()),
            Credentials::OAuth2ClientCredentials {
                client_id,
                client_secret,
                token_url,
                ..
            } if client_id.is_empty() || client_secret.is_empty() || token_url.is_empty() => {
                missing("client_id, client_secret and token_url")
            }
            Credentials::OAuth2ClientCredentials { .. } => Ok(()),
            Credentials::Custom { headers } if headers.is_empty() => missing("custom_headers"),
            Credentials::Custom { .. } => Ok(()),
        }
    }
}

/// Per-tool authentication hints compiled from OpenAPI `x-*` extensions.
#[derive(Debug, Clone, Default)]
pub struct AuthHint {
    pub auth_type: Option<String>,
    pub bearer_header: Option<String>,
    pub api_key_header: Option<String>,
    pub oauth2_token_url: Option<String>,
    pub oauth2_scope: Option<String>,
    pub custom_headers: HashMap<String, String>,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Holds a session's credentials and applies them to outbound request headers.
///
/// Shared as `Arc<CredentialStore>` between the session and the tool executor.
/// `set`/`clear` run under the session gate in the orchestrator; the OAuth2
/// token cache has its own lock so a refresh never blocks unrelated sessions
/// and never runs twice concurrently for the same slot.
pub struct CredentialStore {
    credentials: RwLock<Credentials>,
    token_cache: Mutex<Option<CachedToken>>,
    allowed_types: Vec<String>,
    fallback_token_ttl: Duration,
}

impl CredentialStore {
    /// Create an empty store honoring the configured auth-type allow-list.
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            credentials: RwLock::new(Credentials::None),
            token_cache: Mutex::new(None),
            allowed_types: config.supported_auth_types.clone(),
            fallback_token_ttl: config.auth_token_cache_ttl,
        }
    }

    /// Validate and store new credentials, clearing any cached OAuth2 token.
    pub async fn set(&self, credentials: Credentials) -> Result<(), CredentialError> {
        if credentials != Credentials::None
            && !self
                .allowed_types
                .iter()
                .any(|t| t == credentials.auth_type())
        {
            return Err(CredentialError::BadCredentials(format!(
                "auth type {} is not enabled",
                credentials.auth_type()
            )));
        }
        credentials.validate()?;

        *self.token_cache.lock().await = None;
        *self.credentials.write().await = credentials;
        Ok(())
    }

    /// Zero the credential slot and the token cache.
    pub async fn clear(&self) {
        *self.token_cache.lock().await = None;
        *self.credentials.write().await = Credentials::None;
    }

    /// Wire name of the current variant.
    pub async fn auth_type(&self) -> &'static str {
        self.credentials.read().await.auth_type()
    }

    /// True when a non-`None` variant is stored.
    pub async fn is_configured(&self) -> bool {
        !matches!(&*self.credentials.read().await, Credentials::None)
    }

    /// Drop the cached OAuth2 access token so the next `apply` refreshes it.
    ///
    /// Called by the tool executor after a 401 on an OAuth2-authenticated call.
    pub async fn invalidate_token(&self) {
        *self.token_cache.lock().await = None;
    }

    /// Add the authentication header(s) for the current variant to `headers`.
    ///
    /// Bearer/Basic/OAuth2 overwrite `Authorization`; ApiKey writes its header
    /// name; Custom inserts each entry only where no header of that name exists.
    /// The `hint` can supply an API-key header name or OAuth2 token URL/scope
    /// when the credential leaves them unset.
    pub async fn apply(
        &self,
        headers: &mut HashMap<String, String>,
        hint: Option<&AuthHint>,
        http: &reqwest::Client,
    ) -> Result<(), CredentialError> {
        let credentials = self.credentials.read().await.clone();
        match credentials {
            Credentials::None => Ok(()),
            Credentials::BearerToken { token } => {
                let header = hint
                    .and_then(|h| h.bearer_header.as_deref())
                    .unwrap_or("Authorization");
                headers.insert(header.to_string(), format!("Bearer {}", token));
                Ok(())
            }
            Credentials::BasicAuth { username, password } => {
                let encoded = BASE64.encode(format!("{}:{}", username, password));
                headers.insert("Authorization".to_string(), format!("Basic {}", encoded));
                Ok(())
            }
            Credentials::ApiKey { key, header_name } => {
                // The credential's own header name wins over the tool hint.
                let header = if header_name != DEFAULT_API_KEY_HEADER {
                    header_name
                } else {
                    hint.and_then(|h| h.api_key_header.clone())
                        .unwrap_or(header_name)
                };
                headers.insert(header, key);
                Ok(())
            }
            Credentials::OAuth2ClientCredentials {
                client_id,
                client_secret,
                token_url,
                scope,
            } => {
                let token_url = hint
                    .and_then(|h| h.oauth2_token_url.clone())
                    .unwrap_or(token_url);
                let scope = scope.or_else(|| hint.and_then(|h| h.oauth2_scope.clone()));
                let token = self
                    .oauth2_access_token(&client_id, &client_secret, &token_url, scope.as_deref(), http)
                    .await?;
                headers.insert("Authorization".to_string(), format!("Bearer {}", token));
                Ok(())
            }
            Credentials::Custom { headers: custom } => {
                for (name, value) in custom {
                    headers.entry(name).or_insert(value);
                }
                if let Some(hint) = hint {
                    for (name, value) in &hint.custom_headers {
                        headers.entry(name.clone()).or_insert_with(|| value.clone());
                    }
                }
                Ok(())
            }
        }
    }

    /// Return a valid access token, fetching one if the cache is empty or stale.
    ///
    /// Serialized on the token-cache lock: concurrent callers wait for the first
    /// fetch and then reuse its result instead of issuing their own.
    async fn oauth2_access_token(
        &self,
        client_id: &str,
        client_secret: &str,
        token_url: &str,
        scope: Option<&str>,
        http: &reqwest::Client,
    ) -> Result<String, CredentialError> {
        let mut cache = self.token_cache.lock().await;

        if let Some(cached) = cache.as_ref() {
            if Instant::now() < cached.expires_at {
                log::debug!("reusing cached OAuth2 token");
                return Ok(cached.access_token.clone());
            }
        }

        let mut form = vec![("grant_type", "client_credentials")];
        if let Some(scope) = scope {
            form.push(("scope", scope));
        }

        log::debug!("requesting OAuth2 token from {}", token_url);
        let response = http
            .post(token_url)
            .basic_auth(client_id, Some(client_secret))
            .form(&form)
            .send()
            .await
            .map_err(|e| CredentialError::AuthAcquisitionFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CredentialError::AuthAcquisitionFailed(format!(
                "token endpoint returned HTTP {}",
                response.status().as_u16()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CredentialError::AuthAcquisitionFailed(e.to_string()))?;

        let access_token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                CredentialError::AuthAcquisitionFailed(
                    "no access_token in token response".to_string(),
                )
            })?
            .to_string();

        let expires_in = body
            .get("expires_in")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs)
            .unwrap_or(self.fallback_token_ttl);

        // Refresh at 90% of the advertised lifetime.
        let lifetime = expires_in.mul_f64(0.9);
        *cache = Some(CachedToken {
            access_token: access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });

        log::debug!("OAuth2 token obtained, expires in {:?}", expires_in);
        Ok(access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CredentialStore {
        CredentialStore::new(&BridgeConfig::default())
    }

    #[tokio::test]
    async fn rejects_empty_required_fields() {
        let s = store();
        let err = s
            .set(Credentials::BearerToken { token: "".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::BadCredentials(_)));

        let err = s
            .set(Credentials::OAuth2ClientCredentials {
                client_id: "id".into(),
                client_secret: "".into(),
                token_url: "https://auth".into(),
                scope: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::BadCredentials(_)));
    }

    #[tokio::test]
    async fn rejects_disallowed_type() {
        let mut config = BridgeConfig::default();
        config.supported_auth_types = vec!["bearer_token".into()];
        let s = CredentialStore::new(&config);

        let err = s
            .set(Credentials::ApiKey {
                key: "k".into(),
                header_name: DEFAULT_API_KEY_HEADER.into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::BadCredentials(_)));
    }

    #[tokio::test]
    async fn basic_auth_encodes_user_pass() {
        let s = store();
        s.set(Credentials::BasicAuth {
            username: "user".into(),
            password: "pass".into(),
        })
        .await
        .unwrap();

        let mut headers = HashMap::new();
        s.apply(&mut headers, None, &reqwest::Client::new())
            .await
            .unwrap();
        assert_eq!(
            headers.get("Authorization").map(String::as_str),
            Some("Basic dXNlcjpwYXNz")
        );
    }

    #[tokio::test]
    async fn api_key_credential_header_beats_hint() {
        let s = store();
        s.set(Credentials::ApiKey {
            key: "secret".into(),
            header_name: "X-Custom-Key".into(),
        })
        .await
        .unwrap();

        let hint = AuthHint {
            api_key_header: Some("X-Hint-Key".into()),
            ..AuthHint::default()
        };
        let mut headers = HashMap::new();
        s.apply(&mut headers, Some(&hint), &reqwest::Client::new())
            .await
            .unwrap();
        assert_eq!(headers.get("X-Custom-Key").map(String::as_str), Some("secret"));
        assert!(!headers.contains_key("X-Hint-Key"));
    }

    #[tokio::test]
    async fn api_key_hint_used_when_credential_has_default() {
        let s = store();
        s.set(Credentials::ApiKey {
            key: "secret".into(),
            header_name: DEFAULT_API_KEY_HEADER.into(),
        })
        .await
        .unwrap();

        let hint = AuthHint {
            api_key_header: Some("X-Hint-Key".into()),
            ..AuthHint::default()
        };
        let mut headers = HashMap::new();
        s.apply(&mut headers, Some(&hint), &reqwest::Client::new())
            .await
            .unwrap();
        assert_eq!(headers.get("X-Hint-Key").map(String::as_str), Some("secret"));
    }

    #[tokio::test]
    async fn custom_headers_do_not_replace_existing() {
        let s = store();
        let mut custom = HashMap::new();
        custom.insert("X-Team".to_string(), "bridge".to_string());
        custom.insert("Content-Type".to_string(), "text/plain".to_string());
        s.set(Credentials::Custom { headers: custom }).await.unwrap();

        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        s.apply(&mut headers, None, &reqwest::Client::new())
            .await
            .unwrap();

        assert_eq!(headers.get("X-Team").map(String::as_str), Some("bridge"));
        // caller's header survives
        assert_eq!(
            headers.get("Content-Type").map(String::as_str),
            Some("application/json")
        );
    }

    #[tokio::test]
    async fn clear_zeroes_everything() {
        let s = store();
        s.set(Credentials::BearerToken { token: "T".into() })
            .await
            .unwrap();
        assert!(s.is_configured().await);

        s.clear().await;
        assert!(!s.is_configured().await);

        let mut headers = HashMap::new();
        s.apply(&mut headers, None, &reqwest::Client::new())
            .await
            .unwrap();
        assert!(headers.is_empty());
    }
}
