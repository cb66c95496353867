use crate::protocol::CoreState;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// Settings that outlive a daemon run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistentState {
    #[serde(default)]
    pub last_file: Option<PathBuf>,
}

/// Holds the latest published [`CoreState`] for readers (HTTP handlers,
/// tests). Only the core writes to it, and only through [`publish`].
///
/// [`publish`]: StateManager::publish
pub struct StateManager {
    state: Arc<RwLock<CoreState>>,
    state_file: PathBuf,
}

impl StateManager {
    pub fn new(state_file: PathBuf) -> Self {
        Self {
            state: Arc::new(RwLock::new(CoreState::default())),
            state_file,
        }
    }

    pub async fn get_state(&self) -> CoreState {
        self.state.read().await.clone()
    }

    /// Replace the snapshot, bumping `rev`. Returns the new revision.
    pub async fn publish(&self, mut next: CoreState) -> u64 {
        let mut state = self.state.write().await;
        next.rev = state.rev + 1;
        *state = next;
        state.rev
    }

    pub fn load_persistent(&self) -> PersistentState {
        Self::read_persistent(&self.state_file)
    }

    pub async fn save_persistent(&self, persistent: &PersistentState) -> anyhow::Result<()> {
        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(persistent)?;
        tokio::fs::write(&self.state_file, json).await?;
        Ok(())
    }

    fn read_persistent(state_file: &Path) -> PersistentState {
        let content = match std::fs::read_to_string(state_file) {
            Ok(c) => c,
            Err(_) => return PersistentState::default(),
        };
        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("state: ignoring unreadable {:?}: {}", state_file, e);
            PersistentState::default()
        })
    }
}
