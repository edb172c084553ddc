use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Result, ScanError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_id: Option<String>,
}

/// Conversation about a single scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub scan_id: String,
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new(scan_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            scan_id: scan_id.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn add_user_message(&mut self, content: impl Into<String>) -> &ChatMessage {
        self.push(MessageRole::User, content.into())
    }

    pub fn add_assistant_message(&mut self, content: impl Into<String>) -> &ChatMessage {
        self.push(MessageRole::Assistant, content.into())
    }

    /// The last `n` messages, oldest first
    pub fn last_messages(&self, n: usize) -> &[ChatMessage] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    fn push(&mut self, role: MessageRole, content: String) -> &ChatMessage {
        let now = Utc::now();
        self.messages.push(ChatMessage {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            timestamp: now,
            scan_id: Some(self.scan_id.clone()),
        });
        self.updated_at = now;
        &self.messages[self.messages.len() - 1]
    }
}

/// Trait for storing and retrieving chat sessions
#[async_trait]
pub trait ChatSessionStorage: Send + Sync {
    async fn save(&self, session: ChatSession) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<ChatSession>>;
    async fn get_by_scan(&self, scan_id: &str) -> Result<Option<ChatSession>>;
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Existing session for `scan_id`, or a freshly saved one.
pub async fn open_for_scan(storage: &dyn ChatSessionStorage, scan_id: &str) -> Result<ChatSession> {
    if let Some(session) = storage.get_by_scan(scan_id).await? {
        return Ok(session);
    }
    let session = ChatSession::new(scan_id);
    storage.save(session.clone()).await?;
    Ok(session)
}

/// Append a user message to the session of `scan_id` and persist it.
pub async fn post_user_message(
    storage: &dyn ChatSessionStorage,
    scan_id: &str,
    content: &str,
) -> Result<ChatSession> {
    let mut session = storage
        .get_by_scan(scan_id)
        .await?
        .ok_or_else(|| ScanError::ChatSessionNotFound(scan_id.to_string()))?;
    session.add_user_message(content);
    storage.save(session.clone()).await?;
    Ok(session)
}

/// In-memory implementation of ChatSessionStorage
pub struct InMemoryChatSessionStorage {
    sessions: Arc<DashMap<String, ChatSession>>,
    by_scan: Arc<DashMap<String, String>>,
}

impl InMemoryChatSessionStorage {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            by_scan: Arc::new(DashMap::new()),
        }
    }
}

impl Default for InMemoryChatSessionStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatSessionStorage for InMemoryChatSessionStorage {
    async fn save(&self, session: ChatSession) -> Result<()> {
        self.by_scan
            .insert(session.scan_id.clone(), session.id.clone());
        self.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ChatSession>> {
        Ok(self.sessions.get(id).map(|entry| entry.clone()))
    }

    async fn get_by_scan(&self, scan_id: &str) -> Result<Option<ChatSession>> {
        let Some(id) = self.by_scan.get(scan_id).map(|entry| entry.clone()) else {
            return Ok(None);
        };
        self.get(&id).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        if let Some((_, session)) = self.sessions.remove(id) {
            self.by_scan.remove(&session.scan_id);
        }
        Ok(())
    }
}
