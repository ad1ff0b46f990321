//! Immutable, role-resolved captures of one directory search.

use std::collections::BTreeMap;

use crate::attr_map::{AttributeMap, EntryKind};
use crate::directory::RawEntry;

/// One directory object with its values keyed by logical role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryEntry {
    dn: String,
    values: BTreeMap<String, Vec<String>>,
    membership: Vec<String>,
}

impl DirectoryEntry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            ..Default::default()
        }
    }

    /// Builder-style single-valued role setter.
    pub fn with(mut self, role: &str, value: impl Into<String>) -> Self {
        self.values.insert(role.to_string(), vec![value.into()]);
        self
    }

    /// Builder-style membership setter (group DNs, member DNs or member names
    /// depending on the scheme).
    pub fn with_membership<I, S>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.membership = members.into_iter().map(Into::into).collect();
        self
    }

    pub fn dn(&self) -> &str {
        &self.dn
    }

    /// The DN folded for case-insensitive comparison.
    pub fn dn_key(&self) -> String {
        dn_key(&self.dn)
    }

    /// First value for `role`, or `""` when absent.
    pub fn value(&self, role: &str) -> &str {
        self.values
            .get(role)
            .and_then(|v| v.first())
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn values(&self, role: &str) -> &[String] {
        self.values.get(role).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn membership(&self) -> &[String] {
        &self.membership
    }
}

/// Fold a DN for comparison. Directories match DNs case-insensitively.
pub fn dn_key(dn: &str) -> String {
    dn.to_lowercase()
}

/// Ordered entries from one user or group search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectorySnapshot {
    kind: EntryKind,
    entries: Vec<DirectoryEntry>,
}

impl DirectorySnapshot {
    pub fn new(kind: EntryKind, entries: Vec<DirectoryEntry>) -> Self {
        Self { kind, entries }
    }

    /// An empty snapshot, used when no enabled projection reads this side.
    pub fn empty(kind: EntryKind) -> Self {
        Self::new(kind, Vec::new())
    }

    /// Resolve raw search results into role-keyed entries. Only `roles` are
    /// extracted; `membership_attr` (if any) fills the membership list.
    pub fn from_raw(
        kind: EntryKind,
        raw: Vec<RawEntry>,
        attr_map: &AttributeMap,
        roles: &[String],
        membership_attr: Option<&str>,
    ) -> Self {
        let entries = raw
            .into_iter()
            .map(|raw| {
                let values = roles
                    .iter()
                    .filter_map(|role| {
                        let attr = attr_map.get(role)?;
                        let values = raw.values(attr);
                        (!values.is_empty()).then(|| (role.clone(), values.to_vec()))
                    })
                    .collect();
                let membership = membership_attr
                    .map(|attr| raw.values(attr).to_vec())
                    .unwrap_or_default();
                DirectoryEntry {
                    dn: raw.dn,
                    values,
                    membership,
                }
            })
            .collect();
        Self { kind, entries }
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn entries(&self) -> &[DirectoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
