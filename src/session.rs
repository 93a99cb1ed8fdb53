use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::context::{ConversationState, StateHook};
use crate::error::AgentError;

/// Identifies one conversation: a user within a world.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub user_id: String,
    pub world_id: String,
}

impl ConversationKey {
    pub fn new(user_id: impl Into<String>, world_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            world_id: world_id.into(),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.world_id)
    }
}

/// Key-value persistence for serialized conversation state.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get(&self, key: &ConversationKey) -> Result<Option<Value>, AgentError>;

    async fn set(&self, key: &ConversationKey, value: Value) -> Result<(), AgentError>;

    async fn delete(&self, key: &ConversationKey) -> Result<(), AgentError>;
}

#[async_trait]
impl<S: ConversationStore + ?Sized> ConversationStore for Arc<S> {
    async fn get(&self, key: &ConversationKey) -> Result<Option<Value>, AgentError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &ConversationKey, value: Value) -> Result<(), AgentError> {
        (**self).set(key, value).await
    }

    async fn delete(&self, key: &ConversationKey) -> Result<(), AgentError> {
        (**self).delete(key).await
    }
}

// --- InMemoryStore ---

/// Process-local store. Contents vanish with the process.
#[derive(Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<ConversationKey, Value>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn get(&self, key: &ConversationKey) -> Result<Option<Value>, AgentError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &ConversationKey, value: Value) -> Result<(), AgentError> {
        self.entries.lock().await.insert(key.clone(), value);
        Ok(())
    }

    async fn delete(&self, key: &ConversationKey) -> Result<(), AgentError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

// --- FileStore ---

/// Saves each conversation as `<dir>/<user>/<world>.json`.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &ConversationKey) -> PathBuf {
        self.dir
            .join(path_component(&key.user_id))
            .join(format!("{}.json", path_component(&key.world_id)))
    }
}

/// Ids come from outside; keep them to one safe path segment.
fn path_component(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".into()
    } else {
        cleaned
    }
}

#[async_trait]
impl ConversationStore for FileStore {
    async fn get(&self, key: &ConversationKey) -> Result<Option<Value>, AgentError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(json) => {
                let value = serde_json::from_str(&json)
                    .map_err(|e| AgentError::Session(e.to_string()))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AgentError::Session(e.to_string())),
        }
    }

    async fn set(&self, key: &ConversationKey, value: Value) -> Result<(), AgentError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AgentError::Session(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(&value)
            .map_err(|e| AgentError::Session(e.to_string()))?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| AgentError::Session(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &ConversationKey) -> Result<(), AgentError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AgentError::Session(e.to_string())),
        }
    }
}

// --- Background persistence ---

/// Build a state-change hook that persists every snapshot to `store`.
///
/// The hook only clones the state into a channel; a spawned task performs
/// the writes in order. Snapshots that queue up while a write is in flight
/// are collapsed to the newest one. The task ends once the hook is dropped.
pub fn spawn_persister(
    store: Arc<dyn ConversationStore>,
    key: ConversationKey,
) -> (StateHook, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ConversationState>();

    let handle = tokio::spawn(async move {
        while let Some(mut state) = rx.recv().await {
            while let Ok(newer) = rx.try_recv() {
                state = newer;
            }
            let value = match serde_json::to_value(&state) {
                Ok(v) => v,
                Err(e) => {
                    warn!(conversation = %key, error = %e, "failed to serialize conversation");
                    continue;
                }
            };
            if let Err(e) = store.set(&key, value).await {
                warn!(conversation = %key, error = %e, "failed to persist conversation");
            }
        }
        debug!(conversation = %key, "persister stopped");
    });

    let hook: StateHook = Box::new(move |state: &ConversationState| {
        let _ = tx.send(state.clone());
    });
    (hook, handle)
}
