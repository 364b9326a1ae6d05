//! 이름으로 찾는 인덱스 레지스트리

use crate::error::{CdcError, Result};
use crate::sink::{DocumentIndex, IndexConfig, IndexSink};
use crate::store::{JsonStoreExt, KeyValueStore, INDEX_CONFIG_BUCKET};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Default)]
pub struct IndexRegistry {
    indices: RwLock<HashMap<String, Arc<dyn IndexSink>>>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        IndexRegistry::default()
    }

    /// 같은 이름이 이미 있으면 에러
    pub fn register(&self, name: &str, sink: Arc<dyn IndexSink>) -> Result<()> {
        let mut indices = self.indices.write();
        if indices.contains_key(name) {
            return Err(CdcError::InvalidConfig(format!(
                "index {} is already registered",
                name
            )));
        }
        indices.insert(name.to_string(), sink);
        Ok(())
    }

    pub fn index_by_name(&self, name: &str) -> Result<Arc<dyn IndexSink>> {
        self.indices
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CdcError::NotFound(format!("index {}", name)))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indices.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// 저장된 인덱스 설정마다 `DocumentIndex`를 만들어 등록하고 등록된 수를 반환
    pub fn load_from_store(&self, store: Arc<dyn KeyValueStore>) -> Result<usize> {
        let configs: Vec<IndexConfig> = store.find_json("", 0, INDEX_CONFIG_BUCKET)?;
        let mut loaded = 0;
        for config in configs {
            let name = config.index.clone();
            let index = Arc::new(DocumentIndex::new(config, store.clone()));
            match self.register(&name, index) {
                Ok(()) => loaded += 1,
                Err(e) => warn!(index = %name, error = %e, "Skipping index config"),
            }
        }
        info!(loaded, "Index registry loaded");
        Ok(loaded)
    }

    pub async fn close_all(&self) {
        let indices: Vec<Arc<dyn IndexSink>> = self.indices.write().drain().map(|(_, v)| v).collect();
        for index in indices {
            if let Err(e) = index.close().await {
                warn!(index = %index.name(), error = %e, "Failed to close index");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DiskStore;

    fn store() -> (tempfile::TempDir, Arc<dyn KeyValueStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn KeyValueStore> = Arc::new(DiskStore::open(dir.path()).unwrap());
        (dir, store)
    }

    fn config(name: &str) -> IndexConfig {
        IndexConfig {
            index: name.to_string(),
            id_field: "id".to_string(),
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let (_dir, store) = store();
        let registry = IndexRegistry::new();
        registry
            .register("orders", Arc::new(DocumentIndex::new(config("orders"), store.clone())))
            .unwrap();

        assert_eq!(registry.index_by_name("orders").unwrap().name(), "orders");
        assert!(matches!(registry.index_by_name("missing"), Err(CdcError::NotFound(_))));

        let duplicate = registry.register("orders", Arc::new(DocumentIndex::new(config("orders"), store)));
        assert!(matches!(duplicate, Err(CdcError::InvalidConfig(_))));
    }

    #[test]
    fn test_load_from_store() {
        let (_dir, store) = store();
        store.put_json("orders", &config("orders"), INDEX_CONFIG_BUCKET).unwrap();
        store.put_json("users", &config("users"), INDEX_CONFIG_BUCKET).unwrap();

        let registry = IndexRegistry::new();
        assert_eq!(registry.load_from_store(store).unwrap(), 2);
        assert_eq!(registry.names(), vec!["orders", "users"]);
    }

    #[tokio::test]
    async fn test_close_all_empties_registry() {
        let (_dir, store) = store();
        let registry = IndexRegistry::new();
        registry
            .register("orders", Arc::new(DocumentIndex::new(config("orders"), store)))
            .unwrap();
        registry.close_all().await;
        assert!(registry.names().is_empty());
    }
}
