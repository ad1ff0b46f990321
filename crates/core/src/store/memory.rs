//! In-process [`ConfigStore`] for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ConfigStore, StoredObject};
use crate::errors::StoreError;

/// Objects held in memory. Writes to names marked with
/// [`reject_writes`](Self::reject_writes) fail with an API error.
#[derive(Debug, Default)]
pub struct MemoryStore {
    namespace: String,
    objects: RwLock<BTreeMap<String, StoredObject>>,
    rejected: RwLock<BTreeSet<String>>,
}

impl MemoryStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Seed an object.
    pub async fn insert(&self, name: &str, data: BTreeMap<String, String>) {
        self.objects.write().await.insert(
            name.to_string(),
            StoredObject {
                name: name.to_string(),
                data,
            },
        );
    }

    /// Make every later create/replace of `name` fail.
    pub async fn reject_writes(&self, name: &str) {
        self.rejected.write().await.insert(name.to_string());
    }

    /// Names of all stored objects.
    pub async fn names(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }

    async fn check_writable(&self, name: &str) -> Result<(), StoreError> {
        if self.rejected.read().await.contains(name) {
            return Err(StoreError::ApiError {
                name: name.to_string(),
                status: 403,
                body: "writes rejected".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get_object(&self, name: &str) -> Result<Option<StoredObject>, StoreError> {
        Ok(self.objects.read().await.get(name).cloned())
    }

    async fn create_object(
        &self,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        self.check_writable(name).await?;
        let mut objects = self.objects.write().await;
        if objects.contains_key(name) {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }
        objects.insert(
            name.to_string(),
            StoredObject {
                name: name.to_string(),
                data: data.clone(),
            },
        );
        Ok(())
    }

    async fn replace_object(
        &self,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        self.check_writable(name).await?;
        let mut objects = self.objects.write().await;
        match objects.get_mut(name) {
            Some(object) => {
                object.data = data.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(name.to_string())),
        }
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_twice_fails() {
        let store = MemoryStore::new("ns");
        let data = BTreeMap::from([("k".to_string(), "v".to_string())]);
        store.create_object("a", &data).await.unwrap();
        let err = store.create_object("a", &data).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_replace_missing_fails() {
        let store = MemoryStore::new("ns");
        let err = store.replace_object("a", &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rejected_writes() {
        let store = MemoryStore::new("ns");
        store.reject_writes("a").await;
        let err = store.create_object("a", &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::ApiError { status: 403, .. }));
        assert!(store.names().await.is_empty());
    }
}
