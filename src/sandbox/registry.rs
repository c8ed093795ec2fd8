use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::contract::Sandbox;

/// Lookup table mapping a stable run id to the live adapter instance.
///
/// Constructed once per process and passed by reference to anything that
/// needs lookup; there is no ambient global. Adapters insert themselves on
/// construction and remove themselves on `stop()`. Inserting an id that is
/// already present silently overwrites the entry; id uniqueness is
/// guaranteed upstream by the run identifier, so a collision means the
/// caller replaced the adapter on purpose (e.g. resume).
#[derive(Clone, Default)]
pub struct SandboxRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn Sandbox>>>>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: &str, sandbox: Arc<dyn Sandbox>) {
        let mut map = self.inner.write().await;
        if map.insert(id.to_string(), sandbox).is_some() {
            tracing::debug!(id, "registry entry overwritten");
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn Sandbox>> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn remove(&self, id: &str) {
        self.inner.write().await.remove(id);
    }

    /// Test/reset use only.
    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
