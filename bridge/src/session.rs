//! Session identity and persistence around a turn.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;

use crate::error::Result;
use crate::events::BridgeEvent;
use crate::events::EventSink;
use crate::registry::ProcessRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSession {
    pub id: String,
    pub cwd: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<StoredMessage>,
}

impl StoredSession {
    fn new(id: &str, cwd: Option<&Path>) -> Self {
        Self {
            id: id.to_string(),
            cwd: cwd.map(Path::to_path_buf),
            created_at: Utc::now(),
            messages: Vec::new(),
        }
    }

    fn push(&mut self, role: MessageRole, content: &str) {
        self.messages.push(StoredMessage {
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
        });
    }
}

/// Conversation history owned outside the bridge. Appending to an unknown
/// session creates it.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, session_id: &str, cwd: &Path) -> Result<()>;
    async fn add_message(&self, session_id: &str, role: MessageRole, content: &str)
    -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, StoredSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn session(&self, session_id: &str) -> Option<StoredSession> {
        self.sessions.lock().await.get(session_id).cloned()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(&self, session_id: &str, cwd: &Path) -> Result<()> {
        self.sessions
            .lock()
            .await
            .entry(session_id.to_string())
            .or_insert_with(|| StoredSession::new(session_id, Some(cwd)));
        Ok(())
    }

    async fn add_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<()> {
        self.sessions
            .lock()
            .await
            .entry(session_id.to_string())
            .or_insert_with(|| StoredSession::new(session_id, None))
            .push(role, content);
        Ok(())
    }
}

/// One pretty-printed JSON document per session.
#[derive(Debug)]
pub struct JsonSessionStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        let file_stem: String = session_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{file_stem}.json"))
    }

    pub async fn load(&self, session_id: &str) -> Result<Option<StoredSession>> {
        let path = self.path_for(session_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let session = serde_json::from_slice(&bytes).map_err(std::io::Error::other)?;
                Ok(Some(session))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save(&self, session: &StoredSession) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec_pretty(session).map_err(std::io::Error::other)?;
        tokio::fs::write(self.path_for(&session.id), json).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for JsonSessionStore {
    async fn create_session(&self, session_id: &str, cwd: &Path) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self.load(session_id).await?.is_some() {
            return Ok(());
        }
        self.save(&StoredSession::new(session_id, Some(cwd))).await
    }

    async fn add_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut session = self
            .load(session_id)
            .await?
            .unwrap_or_else(|| StoredSession::new(session_id, None));
        session.push(role, content);
        self.save(&session).await
    }
}

/// Identity settled for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTicket {
    pub session_id: String,
    pub is_new_session: bool,
}

/// Binds a turn to a session: mints ids, persists both sides of the
/// exchange and announces lifecycle events.
#[derive(Clone)]
pub struct SessionBridge {
    store: Arc<dyn SessionStore>,
    events: EventSink,
}

impl SessionBridge {
    pub fn new(store: Arc<dyn SessionStore>, events: EventSink) -> Self {
        Self { store, events }
    }

    /// Settles the session identity for a turn whose process is registered
    /// under `provisional_key`. Must run before any output is forwarded.
    pub async fn begin(
        &self,
        requested: Option<&str>,
        cwd: &Path,
        prompt: &str,
        registry: &ProcessRegistry,
        provisional_key: &str,
    ) -> SessionTicket {
        if let Some(session_id) = requested {
            self.persist(session_id, MessageRole::User, prompt).await;
            return SessionTicket {
                session_id: session_id.to_string(),
                is_new_session: false,
            };
        }

        let session_id = mint_session_id();
        if let Err(err) = self.store.create_session(&session_id, cwd).await {
            warn!(session_id, "failed to create session: {err}");
        }
        self.persist(&session_id, MessageRole::User, prompt).await;
        if !registry.rekey(provisional_key, &session_id) {
            debug!(provisional_key, "process record gone before rekey");
        }
        self.events
            .send(BridgeEvent::SessionCreated {
                session_id: session_id.clone(),
            })
            .await;
        SessionTicket {
            session_id,
            is_new_session: true,
        }
    }

    /// Stores the assembled answer; empty answers are not persisted.
    pub async fn persist_response(&self, ticket: &SessionTicket, response: &str) {
        self.persist(&ticket.session_id, MessageRole::Assistant, response)
            .await;
    }

    pub async fn complete(&self, ticket: &SessionTicket, exit_code: Option<i32>) {
        self.events
            .send(BridgeEvent::Complete {
                exit_code,
                is_new_session: ticket.is_new_session,
            })
            .await;
    }

    async fn persist(&self, session_id: &str, role: MessageRole, content: &str) {
        if content.is_empty() {
            return;
        }
        if let Err(err) = self.store.add_message(session_id, role, content).await {
            warn!(session_id, ?role, "failed to persist message: {err}");
        }
    }
}

pub(crate) fn unix_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn mint_session_id() -> String {
    format!("codex_{}", unix_millis())
}
