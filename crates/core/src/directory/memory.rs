//! In-process [`Directory`] serving canned search results.
//!
//! Results are keyed by entry kind and the exact filter string. Every search
//! is recorded so callers can assert which queries a pass issued.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{Directory, DirectoryConnector, RawEntry};
use crate::attr_map::EntryKind;
use crate::errors::DirectoryError;

/// A search issued against a [`MemoryDirectory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedSearch {
    pub kind: EntryKind,
    pub base_dn: String,
    pub filter: String,
    pub attributes: Vec<String>,
}

#[derive(Debug, Default)]
struct Inner {
    results: HashMap<(EntryKind, String), Vec<RawEntry>>,
    failing: BTreeSet<String>,
    unreachable: bool,
    searches: Vec<RecordedSearch>,
    connects: usize,
    closes: usize,
}

/// Cloneable handle; clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Serve `entries` for searches of `kind` with exactly `filter`.
    pub fn set_results(&self, kind: EntryKind, filter: &str, entries: Vec<RawEntry>) {
        self.lock().results.insert((kind, filter.to_string()), entries);
    }

    /// Make every search with `filter` fail.
    pub fn fail_filter(&self, filter: &str) {
        self.lock().failing.insert(filter.to_string());
    }

    /// Make [`DirectoryConnector::connect`] fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    pub fn searches(&self) -> Vec<RecordedSearch> {
        self.lock().searches.clone()
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn closes(&self) -> usize {
        self.lock().closes
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn search(
        &self,
        kind: EntryKind,
        base_dn: &str,
        filter: &str,
        attributes: &[String],
    ) -> Result<Vec<RawEntry>, DirectoryError> {
        let mut inner = self.lock();
        inner.searches.push(RecordedSearch {
            kind,
            base_dn: base_dn.to_string(),
            filter: filter.to_string(),
            attributes: attributes.to_vec(),
        });
        if inner.failing.contains(filter) {
            return Err(DirectoryError::SearchFailed {
                kind: kind.to_string(),
                base_dn: base_dn.to_string(),
                detail: format!("filter {filter} rejected"),
            });
        }
        Ok(inner
            .results
            .get(&(kind, filter.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn close(&self) {
        self.lock().closes += 1;
    }
}

#[async_trait]
impl DirectoryConnector for MemoryDirectory {
    async fn connect(&self) -> Result<Arc<dyn Directory>, DirectoryError> {
        let mut inner = self.lock();
        if inner.unreachable {
            return Err(DirectoryError::ConnectFailed {
                url: "memory://".into(),
                detail: "directory marked unreachable".into(),
            });
        }
        inner.connects += 1;
        Ok(Arc::new(self.clone()))
    }
}
