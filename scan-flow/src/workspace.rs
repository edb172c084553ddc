use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::{
    analysis::AnalysisService,
    chat::{ChatSessionStorage, InMemoryChatSessionStorage},
    coordinator::SelectionCoordinator,
    error::Result,
    ingest::{IngestionController, IngestionOptions},
    store::ScanStore,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

impl Theme {
    pub fn toggled(self) -> Self {
        match self {
            Theme::Light => Theme::Dark,
            Theme::Dark => Theme::Light,
        }
    }
}

impl FromStr for Theme {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "light" => Ok(Theme::Light),
            "dark" => Ok(Theme::Dark),
            other => Err(format!("Unknown theme: {}", other)),
        }
    }
}

/// Presentation settings scoped to one workspace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    pub theme: Theme,
}

/// Limits applied to every new workspace
#[derive(Debug, Clone, Default)]
pub struct WorkspaceLimits {
    pub max_batch_files: Option<usize>,
    pub max_scans: Option<usize>,
}

/// Everything one browser session works with: its scans, the controller that
/// fills them, the selection/chat state, its chat sessions and the user's
/// preferences. Chat sessions are keyed by scan id, which is only unique
/// within one workspace, so each workspace owns its own chat storage.
#[derive(Clone)]
pub struct Workspace {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub controller: IngestionController,
    pub coordinator: Arc<Mutex<SelectionCoordinator>>,
    pub chats: Arc<dyn ChatSessionStorage>,
    preferences: Arc<RwLock<Preferences>>,
    last_seen_ms: Arc<AtomicI64>,
}

impl Workspace {
    pub fn new(
        service: Arc<dyn AnalysisService>,
        limits: &WorkspaceLimits,
        preferences: Preferences,
    ) -> Self {
        let store = ScanStore::with_limits(limits.max_scans, 256);
        let controller = IngestionController::with_options(
            service,
            store.clone(),
            IngestionOptions {
                max_batch_files: limits.max_batch_files,
            },
        );

        let created_at = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at,
            controller,
            coordinator: Arc::new(Mutex::new(SelectionCoordinator::new(store))),
            chats: Arc::new(InMemoryChatSessionStorage::new()),
            preferences: Arc::new(RwLock::new(preferences)),
            last_seen_ms: Arc::new(AtomicI64::new(created_at.timestamp_millis())),
        }
    }

    /// Mark the workspace as used now.
    pub fn touch(&self) {
        self.last_seen_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_seen_ms.load(Ordering::Relaxed))
            .unwrap_or(self.created_at)
    }

    /// Idle since `cutoff` and not analysing anything.
    pub fn is_idle_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_seen() <= cutoff && !self.controller.is_analyzing()
    }

    pub fn store(&self) -> &ScanStore {
        self.controller.store()
    }

    pub async fn preferences(&self) -> Preferences {
        *self.preferences.read().await
    }

    pub async fn set_theme(&self, theme: Theme) {
        self.preferences.write().await.theme = theme;
    }
}

/// Trait for storing and retrieving workspaces
#[async_trait]
pub trait WorkspaceStorage: Send + Sync {
    async fn save(&self, workspace: Workspace) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<Workspace>>;
    async fn delete(&self, id: &str) -> Result<()>;
    /// Remove every workspace idle since `cutoff`, returning their ids.
    async fn remove_idle(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>>;
}

/// In-memory implementation of WorkspaceStorage
pub struct InMemoryWorkspaceStorage {
    workspaces: Arc<DashMap<String, Workspace>>,
}

impl InMemoryWorkspaceStorage {
    pub fn new() -> Self {
        Self {
            workspaces: Arc::new(DashMap::new()),
        }
    }
}

impl Default for InMemoryWorkspaceStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkspaceStorage for InMemoryWorkspaceStorage {
    async fn save(&self, workspace: Workspace) -> Result<()> {
        self.workspaces.insert(workspace.id.clone(), workspace);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Workspace>> {
        Ok(self.workspaces.get(id).map(|entry| entry.clone()))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.workspaces.remove(id);
        Ok(())
    }

    async fn remove_idle(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let candidates: Vec<String> = self
            .workspaces
            .iter()
            .filter(|entry| entry.is_idle_since(cutoff))
            .map(|entry| entry.key().clone())
            .collect();

        // re-checked under the shard lock; a request may have touched it since
        Ok(candidates
            .into_iter()
            .filter_map(|id| {
                self.workspaces
                    .remove_if(&id, |_, workspace| workspace.is_idle_since(cutoff))
                    .map(|(id, _)| id)
            })
            .collect())
    }
}
