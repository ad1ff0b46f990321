//! External key-value store the projections are published to.
//!
//! The engine only needs get / create / replace on named objects in one
//! namespace. [`reconcile`] composes them into a full-overwrite upsert.

pub mod kube;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::errors::StoreError;

pub use kube::KubeConfigMapStore;
pub use memory::MemoryStore;

/// A stored object as the engine sees it: its name and data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub name: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// Client for one namespace of the external store.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Fetch `name`, or `None` if it does not exist.
    async fn get_object(&self, name: &str) -> Result<Option<StoredObject>, StoreError>;

    /// Create `name`. Fails if it already exists.
    async fn create_object(
        &self,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<(), StoreError>;

    /// Replace `name` wholesale with `data`.
    async fn replace_object(
        &self,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<(), StoreError>;

    /// Namespace label for logs.
    fn namespace(&self) -> &str;
}

/// What [`reconcile`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    Create,
    Update,
}

impl fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
        }
    }
}

/// Publish `data` under `name`: create when absent, otherwise replace the
/// whole object so keys missing from `data` disappear.
pub async fn reconcile(
    store: &dyn ConfigStore,
    name: &str,
    data: &BTreeMap<String, String>,
) -> Result<ReconcileAction, StoreError> {
    let action = match store.get_object(name).await? {
        None => ReconcileAction::Create,
        Some(_) => ReconcileAction::Update,
    };
    let result = match action {
        ReconcileAction::Create => store.create_object(name, data).await,
        ReconcileAction::Update => store.replace_object(name, data).await,
    };
    match result {
        Ok(()) => {
            info!(
                action = %action,
                name,
                namespace = store.namespace(),
                keys = data.len(),
                "ConfigMap sync successful"
            );
            Ok(action)
        }
        Err(e) => {
            error!(
                action = %action,
                name,
                namespace = store.namespace(),
                error = %e,
                "failed to sync ConfigMap"
            );
            Err(e)
        }
    }
}
