//! Persistence of subscriber configuration and the search specs they reference.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::StoreError;
use crate::model::{SearchSpec, SearchSpecId, SubscriberConfig, SubscriberId};

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn upsert_search_spec(&self, spec: &SearchSpec) -> Result<(), StoreError>;
    async fn load_search_specs(&self) -> Result<Vec<SearchSpec>, StoreError>;
    async fn save_subscriber(&self, config: &SubscriberConfig) -> Result<(), StoreError>;
    async fn load_subscribers(&self) -> Result<Vec<SubscriberConfig>, StoreError>;
    async fn delete_subscriber(&self, id: &SubscriberId) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct State {
    #[serde(default)]
    search_specs: BTreeMap<SearchSpecId, SearchSpec>,
    #[serde(default)]
    subscribers: BTreeMap<SubscriberId, SubscriberConfig>,
}

#[derive(Default)]
pub struct MemoryConfigStore {
    state: Mutex<State>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn upsert_search_spec(&self, spec: &SearchSpec) -> Result<(), StoreError> {
        self.with_state(|s| {
            s.search_specs.insert(spec.id.clone(), spec.clone());
        });
        Ok(())
    }

    async fn load_search_specs(&self) -> Result<Vec<SearchSpec>, StoreError> {
        Ok(self.with_state(|s| s.search_specs.values().cloned().collect()))
    }

    async fn save_subscriber(&self, config: &SubscriberConfig) -> Result<(), StoreError> {
        self.with_state(|s| {
            s.subscribers.insert(config.id.clone(), config.clone());
        });
        Ok(())
    }

    async fn load_subscribers(&self) -> Result<Vec<SubscriberConfig>, StoreError> {
        Ok(self.with_state(|s| s.subscribers.values().cloned().collect()))
    }

    async fn delete_subscriber(&self, id: &SubscriberId) -> Result<(), StoreError> {
        self.with_state(|s| {
            s.subscribers.remove(id);
        });
        Ok(())
    }
}

/// Whole-state JSON file, rewritten through a temp file on every change.
pub struct JsonFileConfigStore {
    path: PathBuf,
    state: tokio::sync::Mutex<State>,
}

impl JsonFileConfigStore {
    /// Opens `path`, starting empty when the file does not exist yet.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let state = match fs::read_to_string(&path).await {
            Ok(s) => serde_json::from_str(&s)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => State::default(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), "opened config store");
        Ok(Self {
            path,
            state: tokio::sync::Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_state(&self, state: &State) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(state)?).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for JsonFileConfigStore {
    async fn upsert_search_spec(&self, spec: &SearchSpec) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.search_specs.contains_key(&spec.id) {
            return Ok(());
        }
        state.search_specs.insert(spec.id.clone(), spec.clone());
        self.write_state(&state).await
    }

    async fn load_search_specs(&self) -> Result<Vec<SearchSpec>, StoreError> {
        Ok(self.state.lock().await.search_specs.values().cloned().collect())
    }

    async fn save_subscriber(&self, config: &SubscriberConfig) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.subscribers.insert(config.id.clone(), config.clone());
        self.write_state(&state).await
    }

    async fn load_subscribers(&self) -> Result<Vec<SubscriberConfig>, StoreError> {
        Ok(self.state.lock().await.subscribers.values().cloned().collect())
    }

    async fn delete_subscriber(&self, id: &SubscriberId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.subscribers.remove(id).is_none() {
            return Ok(());
        }
        self.write_state(&state).await
    }
}
