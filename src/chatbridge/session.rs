//! Session state and the process-wide session table.
//!
//! A [`Session`] owns everything scoped to one client connection: credential
//! slot, conversation history, model-family tag, rate gate, and the
//! serializing gate all mutations go through. The [`SessionTable`] maps opaque
//! session ids to live sessions behind a lock-free map; a background reaper
//! removes idle sessions after `session_timeout`.
//!
//! Locking discipline: the session gate protects the session's mutable fields
//! and is never held across I/O — callers take a snapshot, release, await,
//! and re-acquire to commit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::chatbridge::adapters::ModelFamily;
use crate::chatbridge::config::BridgeConfig;
use crate::chatbridge::credentials::CredentialStore;
use crate::chatbridge::message::{ChatMessage, Role};
use crate::chatbridge::rate::TokenBucket;

/// Mutable per-session state, guarded by the session gate.
#[derive(Debug, Default)]
pub struct SessionInner {
    pub history: Vec<ChatMessage>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Per-connection state.
pub struct Session {
    /// Opaque, unguessable session token.
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub family: ModelFamily,
    pub credentials: Arc<CredentialStore>,
    /// Per-session model-invocation rate gate.
    pub rate: TokenBucket,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            family: ModelFamily::from_model_id(&config.model_id),
            credentials: Arc::new(CredentialStore::new(config)),
            rate: TokenBucket::new(config.rate_bucket_capacity, config.rate_refill_interval),
            inner: Mutex::new(SessionInner {
                history: Vec::new(),
                last_activity: Some(Utc::now()),
            }),
        }
    }

    /// Append one message under the gate, bumping the activity clock.
    pub async fn append(&self, message: ChatMessage) {
        let mut inner = self.inner.lock().await;
        inner.history.push(message);
        inner.last_activity = Some(Utc::now());
    }

    /// Append a batch under one gate acquisition.
    pub async fn append_all(&self, messages: Vec<ChatMessage>) {
        let mut inner = self.inner.lock().await;
        inner.history.extend(messages);
        inner.last_activity = Some(Utc::now());
    }

    /// Clone the full history (snapshot basis; the gate is not held after).
    pub async fn history(&self) -> Vec<ChatMessage> {
        self.inner.lock().await.history.clone()
    }

    /// Message count.
    pub async fn message_count(&self) -> usize {
        self.inner.lock().await.history.len()
    }

    /// Reset history, keeping a leading system message when present.
    pub async fn clear_history(&self) {
        let mut inner = self.inner.lock().await;
        let system = inner
            .history
            .first()
            .filter(|m| m.role == Role::System)
            .cloned();
        inner.history.clear();
        if let Some(system) = system {
            inner.history.push(system);
        }
        inner.last_activity = Some(Utc::now());
    }

    /// Re-enforce the conversation budgets on the stored history.
    ///
    /// Pure CPU work under the gate; no I/O happens while it is held.
    pub async fn trim_to_budget(&self, manager: &crate::chatbridge::conversation::ConversationManager) {
        let mut inner = self.inner.lock().await;
        if manager.over_budget(&inner.history) {
            let taken = std::mem::take(&mut inner.history);
            inner.history = manager.manage(taken);
        }
    }

    /// Mark activity without mutating history.
    pub async fn touch(&self) {
        self.inner.lock().await.last_activity = Some(Utc::now());
    }

    /// True when no activity was seen for `timeout`.
    pub async fn is_expired(&self, timeout: Duration) -> bool {
        let inner = self.inner.lock().await;
        match inner.last_activity {
            Some(last) => {
                let idle = Utc::now().signed_duration_since(last);
                idle.num_seconds() >= 0 && idle.num_seconds() as u64 >= timeout.as_secs()
            }
            None => true,
        }
    }
}

/// Counters surfaced by [`SessionTable::statistics`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionStatistics {
    pub active_sessions: usize,
    pub total_sessions_created: usize,
    pub total_messages_processed: usize,
    pub max_sessions: usize,
}

/// Process-wide map of live sessions.
///
/// The map itself is a lightweight concurrent structure used only for
/// insert/lookup/remove; all per-session state stays behind each session's
/// own gate.
pub struct SessionTable {
    sessions: DashMap<String, Arc<Session>>,
    config: Arc<BridgeConfig>,
    created: AtomicUsize,
    messages: AtomicUsize,
}

impl SessionTable {
    pub fn new(config: Arc<BridgeConfig>) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
            created: AtomicUsize::new(0),
            messages: AtomicUsize::new(0),
        }
    }

    /// Create and register a session; evicts the oldest sessions when at
    /// capacity.
    pub async fn create(&self) -> Arc<Session> {
        if self.sessions.len() >= self.config.max_sessions {
            self.evict_oldest(10);
        }

        let session = Arc::new(Session::new(&self.config));
        self.sessions.insert(session.id.clone(), session.clone());
        self.created.fetch_add(1, Ordering::Relaxed);
        log::info!("created session {}", session.id);
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.clone())
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.remove(id).map(|(_, s)| s);
        if removed.is_some() {
            log::info!("removed session {}", id);
        }
        removed
    }

    /// Count one processed message for statistics.
    pub fn count_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn statistics(&self) -> SessionStatistics {
        SessionStatistics {
            active_sessions: self.sessions.len(),
            total_sessions_created: self.created.load(Ordering::Relaxed),
            total_messages_processed: self.messages.load(Ordering::Relaxed),
            max_sessions: self.config.max_sessions,
        }
    }

    /// Drop sessions idle past `session_timeout`; returns how many went.
    pub async fn reap_expired(&self) -> usize {
        let timeout = self.config.session_timeout;
        // Snapshot the map first: map guards are not held across awaits.
        let candidates: Vec<(String, Arc<Session>)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut expired = Vec::new();
        for (id, session) in candidates {
            if session.is_expired(timeout).await {
                expired.push(id);
            }
        }
        let count = expired.len();
        for id in expired {
            self.remove(&id);
        }
        if count > 0 {
            log::info!("reaped {} expired sessions", count);
        }
        count
    }

    fn evict_oldest(&self, count: usize) {
        let mut ids: Vec<(String, DateTime<Utc>)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().created_at))
            .collect();
        ids.sort_by_key(|(_, created)| *created);
        for (id, _) in ids.into_iter().take(count) {
            self.remove(&id);
        }
    }

    /// Spawn the periodic reaper task. The handle is dropped by callers that
    /// want it to run for the process lifetime.
    pub fn spawn_reaper(table: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                table.reap_expired().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(max_sessions: usize, timeout: Duration) -> SessionTable {
        let mut config = BridgeConfig::default();
        config.max_sessions = max_sessions;
        config.session_timeout = timeout;
        SessionTable::new(Arc::new(config))
    }

    #[tokio::test]
    async fn create_lookup_remove() {
        let table = table(10, Duration::from_secs(60));
        let session = table.create().await;
        assert!(table.get(&session.id).is_some());
        assert_eq!(table.statistics().active_sessions, 1);

        table.remove(&session.id);
        assert!(table.get(&session.id).is_none());
        assert_eq!(table.statistics().active_sessions, 0);
        assert_eq!(table.statistics().total_sessions_created, 1);
    }

    #[tokio::test]
    async fn session_ids_are_unguessable_uuids() {
        let table = table(10, Duration::from_secs(60));
        let a = table.create().await;
        let b = table.create().await;
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.len(), 36);
    }

    #[tokio::test]
    async fn capacity_evicts_oldest() {
        let table = table(3, Duration::from_secs(60));
        for _ in 0..3 {
            table.create().await;
        }
        assert_eq!(table.statistics().active_sessions, 3);
        // At capacity: next create evicts oldest sessions first.
        table.create().await;
        assert!(table.statistics().active_sessions <= 3);
    }

    #[tokio::test]
    async fn clear_history_keeps_system() {
        let table = table(10, Duration::from_secs(60));
        let session = table.create().await;
        session.append(ChatMessage::system("sys")).await;
        session.append(ChatMessage::user("hi")).await;
        session.append(ChatMessage::assistant("hello")).await;

        session.clear_history().await;
        let history = session.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::System);
    }

    #[tokio::test]
    async fn expiry_by_idle_time() {
        let table = table(10, Duration::from_secs(0));
        let session = table.create().await;
        // zero timeout: immediately expired
        assert!(session.is_expired(Duration::from_secs(0)).await);
        assert_eq!(table.reap_expired().await, 1);
        assert!(table.get(&session.id).is_none());
    }
}
