//! Configuration for chatbridge.
//!
//! Provides the [`BridgeConfig`] struct: a single immutable configuration value
//! constructed at startup and handed to every component as `Arc<BridgeConfig>`.
//! Users construct it manually or from `CHATBRIDGE_*` environment variables —
//! no file parsing dependencies are required.
//!
//! # Example
//!
//! ```rust
//! use chatbridge::BridgeConfig;
//!
//! // Use the defaults
//! let config = BridgeConfig::default();
//! assert_eq!(config.max_tool_calls_per_turn, 5);
//!
//! // Or pick up CHATBRIDGE_* environment overrides
//! let config = BridgeConfig::from_env();
//! ```

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// How a session responds to a `chat` frame that arrives while a turn is already
/// in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyPolicy {
    /// Reject the frame with a `busy` error; the client retries.
    Reject,
    /// Serialize the frame behind the current turn.
    Queue,
}

/// Eviction strategy applied when conversation history exceeds its budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationStrategy {
    /// Drop oldest messages first.
    Truncate,
    /// Retain the system prompt plus the most recent N messages.
    SlidingWindow,
    /// Drop tool traffic from older exchanges first, then window.
    SmartPrune,
}

impl FromStr for ConversationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "truncate" => Ok(Self::Truncate),
            "sliding_window" => Ok(Self::SlidingWindow),
            "smart_prune" => Ok(Self::SmartPrune),
            other => Err(format!("unknown conversation strategy: {}", other)),
        }
    }
}

/// Global, immutable configuration for a bridge instance.
///
/// Constructed once at startup; every component receives a shared reference.
/// Char counts are used wherever the underlying model limits are token-based —
/// the externally supplied [`context_limit_chars`](BridgeConfig::context_limit_chars)
/// scalar stands in for per-model context-window discovery.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Model identifier forwarded to the model-invocation service.
    pub model_id: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Maximum tokens the model may generate per reply.
    pub max_tokens: u32,
    /// Stop sequences forwarded with every invocation.
    pub stop_sequences: Vec<String>,
    /// System prompt injected when history carries none.
    pub system_prompt: String,

    /// Total tool calls permitted across all nested rounds of one user turn.
    pub max_tool_calls: usize,
    /// Concurrent outbound tool calls for a single assistant turn.
    pub max_tool_calls_per_turn: usize,
    /// Deadline for any single outbound operation (HTTP tool call, token fetch).
    pub timeout: Duration,
    /// Wall-clock budget for one complete user turn including all tool rounds.
    pub turn_deadline: Duration,

    /// Message-count budget for conversation history.
    pub max_conversation_messages: usize,
    /// Eviction strategy once the budget is exceeded.
    pub conversation_strategy: ConversationStrategy,
    /// Keep the leading system message through eviction.
    pub preserve_system_message: bool,
    /// Serialized-size budget for one snapshot handed to the model.
    pub context_limit_chars: usize,

    /// Whether oversized plain messages are split into continuation chunks.
    pub enable_message_chunking: bool,
    /// Per-message size above which chunking applies.
    pub max_message_size: usize,
    /// Target size of each chunk.
    pub chunk_size: usize,

    /// Tier-1 threshold: the most recent tool results of the current turn.
    pub tool_result_new_response_threshold: usize,
    /// Tier-1 target size after truncation.
    pub tool_result_new_response_target: usize,
    /// Tier-2 threshold: tool results from earlier turns.
    pub tool_result_history_threshold: usize,
    /// Tier-2 target size after truncation.
    pub tool_result_history_target: usize,

    /// Whether tool calls carry per-session authentication at all.
    pub enable_tool_auth: bool,
    /// Reject `chat` frames until credentials are configured.
    pub require_tool_auth: bool,
    /// Credential variants accepted by the `auth` frame.
    pub supported_auth_types: Vec<String>,
    /// Fallback OAuth2 token lifetime when the token endpoint omits `expires_in`.
    pub auth_token_cache_ttl: Duration,

    /// Idle expiry for sessions.
    pub session_timeout: Duration,
    /// Hard cap on concurrently live sessions.
    pub max_sessions: usize,
    /// Behavior for `chat` frames during `Processing`.
    pub busy_policy: BusyPolicy,

    /// OpenAPI path prefixes exposed as tools (empty = all non-excluded).
    pub allowed_paths: Vec<String>,
    /// OpenAPI path prefixes never exposed as tools.
    pub excluded_paths: Vec<String>,
    /// Base URL override for outbound tool calls; falls back to `servers[0].url`.
    pub api_base_url: Option<String>,

    /// Bounded retry count for transient failures (model and tool calls).
    pub max_retries: usize,
    /// Base delay of the exponential backoff schedule.
    pub retry_base_delay: Duration,
    /// Upper bound on any single backoff delay.
    pub retry_cap: Duration,
    /// Token-bucket capacity of the per-session model-invocation rate gate.
    pub rate_bucket_capacity: u32,
    /// Interval over which one bucket token is refilled.
    pub rate_refill_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            model_id: "anthropic.claude-3-5-sonnet-20241022-v2:0".to_string(),
            temperature: 0.7,
            max_tokens: 4096,
            stop_sequences: Vec::new(),
            system_prompt: "You are a helpful assistant with access to API tools. \
                            Use the available tools to answer the user's questions, \
                            then reply with a concise natural-language summary."
                .to_string(),

            max_tool_calls: 10,
            max_tool_calls_per_turn: 5,
            timeout: Duration::from_secs(30),
            turn_deadline: Duration::from_secs(300),

            max_conversation_messages: 100,
            conversation_strategy: ConversationStrategy::SlidingWindow,
            preserve_system_message: true,
            context_limit_chars: 600_000,

            enable_message_chunking: true,
            max_message_size: 100_000,
            chunk_size: 50_000,

            tool_result_new_response_threshold: 500_000,
            tool_result_new_response_target: 425_000,
            tool_result_history_threshold: 50_000,
            tool_result_history_target: 42_500,

            enable_tool_auth: true,
            require_tool_auth: false,
            supported_auth_types: vec![
                "bearer_token".to_string(),
                "basic_auth".to_string(),
                "api_key".to_string(),
                "oauth2_client_credentials".to_string(),
                "custom".to_string(),
            ],
            auth_token_cache_ttl: Duration::from_secs(3600),

            session_timeout: Duration::from_secs(1800),
            max_sessions: 1000,
            busy_policy: BusyPolicy::Reject,

            allowed_paths: Vec::new(),
            excluded_paths: vec![
                "/docs".to_string(),
                "/openapi.json".to_string(),
                "/redoc".to_string(),
                "/chat".to_string(),
            ],
            api_base_url: None,

            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_cap: Duration::from_secs(60),
            rate_bucket_capacity: 5,
            rate_refill_interval: Duration::from_secs(2),
        }
    }
}

impl BridgeConfig {
    /// Build a configuration from defaults plus `CHATBRIDGE_*` environment overrides.
    ///
    /// Unparseable values are ignored with a warning rather than failing startup.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_string("CHATBRIDGE_MODEL_ID") {
            cfg.model_id = v;
        }
        if let Some(v) = env_parse::<f32>("CHATBRIDGE_TEMPERATURE") {
            cfg.temperature = v;
        }
        if let Some(v) = env_parse::<u32>("CHATBRIDGE_MAX_TOKENS") {
            cfg.max_tokens = v;
        }
        if let Some(v) = env_string("CHATBRIDGE_SYSTEM_PROMPT") {
            cfg.system_prompt = v;
        }
        if let Some(v) = env_list("CHATBRIDGE_STOP_SEQUENCES") {
            cfg.stop_sequences = v;
        }
        if let Some(v) = env_parse::<usize>("CHATBRIDGE_MAX_TOOL_CALLS") {
            cfg.max_tool_calls = v;
        }
        if let Some(v) = env_parse::<usize>("CHATBRIDGE_MAX_TOOL_CALLS_PER_TURN") {
            cfg.max_tool_calls_per_turn = v;
        }
        if let Some(v) = env_parse::<u64>("CHATBRIDGE_TIMEOUT") {
            cfg.timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("CHATBRIDGE_TURN_DEADLINE") {
            cfg.turn_deadline = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<usize>("CHATBRIDGE_MAX_CONVERSATION_MESSAGES") {
            cfg.max_conversation_messages = v;
        }
        if let Some(v) = env_parse::<ConversationStrategy>("CHATBRIDGE_CONVERSATION_STRATEGY") {
            cfg.conversation_strategy = v;
        }
        if let Some(v) = env_parse::<usize>("CHATBRIDGE_CONTEXT_LIMIT_CHARS") {
            cfg.context_limit_chars = v;
        }
        if let Some(v) = env_parse::<bool>("CHATBRIDGE_ENABLE_MESSAGE_CHUNKING") {
            cfg.enable_message_chunking = v;
        }
        if let Some(v) = env_parse::<usize>("CHATBRIDGE_MAX_MESSAGE_SIZE") {
            cfg.max_message_size = v;
        }
        if let Some(v) = env_parse::<usize>("CHATBRIDGE_CHUNK_SIZE") {
            cfg.chunk_size = v;
        }
        if let Some(v) = env_parse::<usize>("CHATBRIDGE_TOOL_RESULT_NEW_RESPONSE_THRESHOLD") {
            cfg.tool_result_new_response_threshold = v;
        }
        if let Some(v) = env_parse::<usize>("CHATBRIDGE_TOOL_RESULT_NEW_RESPONSE_TARGET") {
            cfg.tool_result_new_response_target = v;
        }
        if let Some(v) = env_parse::<usize>("CHATBRIDGE_TOOL_RESULT_HISTORY_THRESHOLD") {
            cfg.tool_result_history_threshold = v;
        }
        if let Some(v) = env_parse::<usize>("CHATBRIDGE_TOOL_RESULT_HISTORY_TARGET") {
            cfg.tool_result_history_target = v;
        }
        if let Some(v) = env_parse::<bool>("CHATBRIDGE_ENABLE_TOOL_AUTH") {
            cfg.enable_tool_auth = v;
        }
        if let Some(v) = env_parse::<bool>("CHATBRIDGE_REQUIRE_TOOL_AUTH") {
            cfg.require_tool_auth = v;
        }
        if let Some(v) = env_list("CHATBRIDGE_SUPPORTED_AUTH_TYPES") {
            cfg.supported_auth_types = v;
        }
        if let Some(v) = env_parse::<u64>("CHATBRIDGE_AUTH_TOKEN_CACHE_TTL") {
            cfg.auth_token_cache_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("CHATBRIDGE_SESSION_TIMEOUT") {
            cfg.session_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<usize>("CHATBRIDGE_MAX_SESSIONS") {
            cfg.max_sessions = v;
        }
        if let Some(v) = env_string("CHATBRIDGE_BUSY_POLICY") {
            match v.as_str() {
                "reject" => cfg.busy_policy = BusyPolicy::Reject,
                "queue" => cfg.busy_policy = BusyPolicy::Queue,
                other => log::warn!("ignoring unknown busy_policy {:?}", other),
            }
        }
        if let Some(v) = env_list("CHATBRIDGE_ALLOWED_PATHS") {
            cfg.allowed_paths = v;
        }
        if let Some(v) = env_list("CHATBRIDGE_EXCLUDED_PATHS") {
            cfg.excluded_paths = v;
        }
        if let Some(v) = env_string("CHATBRIDGE_API_BASE_URL") {
            cfg.api_base_url = Some(v);
        }
        if let Some(v) = env_parse::<usize>("CHATBRIDGE_MAX_RETRIES") {
            cfg.max_retries = v;
        }
        if let Some(v) = env_parse::<u64>("CHATBRIDGE_RETRY_BASE_DELAY_MS") {
            cfg.retry_base_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("CHATBRIDGE_RETRY_CAP_SECS") {
            cfg.retry_cap = Duration::from_secs(v);
        }

        cfg
    }

    /// True when `auth_type` is accepted by the `auth` frame.
    pub fn auth_type_supported(&self, auth_type: &str) -> bool {
        self.supported_auth_types.iter().any(|t| t == auth_type)
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("ignoring unparseable {}={:?}", key, raw);
            None
        }
    }
}

fn env_list(key: &str) -> Option<Vec<String>> {
    env_string(key).map(|raw| {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let cfg = BridgeConfig::default();
        assert!(cfg.tool_result_new_response_target < cfg.tool_result_new_response_threshold);
        assert!(cfg.tool_result_history_target < cfg.tool_result_history_threshold);
        assert!(cfg.auth_type_supported("bearer_token"));
        assert!(!cfg.auth_type_supported("kerberos"));
    }

    #[test]
    fn strategy_parses() {
        assert_eq!(
            "smart_prune".parse::<ConversationStrategy>().unwrap(),
            ConversationStrategy::SmartPrune
        );
        assert!("nope".parse::<ConversationStrategy>().is_err());
    }
}
