//! Directory access.
//!
//! The engine only needs one primitive from the directory: a subtree search
//! returning entries with their attributes. [`Directory`] is that seam;
//! [`ldap::LdapDirectory`] is the production implementation and
//! [`memory::MemoryDirectory`] serves canned results.

pub mod ldap;
pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::attr_map::{AttributeMap, EntryKind};
use crate::errors::DirectoryError;
use crate::identity::{DirectorySnapshot, MemberScheme};

pub use self::ldap::{LdapConnector, LdapDirectory};
pub use self::memory::MemoryDirectory;

/// One entry as returned by the directory, before role resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEntry {
    pub dn: String,
    pub attrs: HashMap<String, Vec<String>>,
}

impl RawEntry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attrs: HashMap::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with<I, S>(mut self, attr: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attrs
            .insert(attr.to_string(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Values of `attr`, matching the attribute name case-insensitively.
    pub fn values(&self, attr: &str) -> &[String] {
        if let Some(values) = self.attrs.get(attr) {
            return values;
        }
        self.attrs
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(attr))
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }
}

/// A connected directory able to run searches.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Subtree search under `base_dn` returning `attributes` for each match.
    async fn search(
        &self,
        kind: EntryKind,
        base_dn: &str,
        filter: &str,
        attributes: &[String],
    ) -> Result<Vec<RawEntry>, DirectoryError>;

    /// Release the connection. Errors are logged, not returned.
    async fn close(&self) {}
}

/// Opens one [`Directory`] connection per pass.
#[async_trait]
pub trait DirectoryConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Directory>, DirectoryError>;
}

/// Where and what to search for one side (users or groups) of a pass.
#[derive(Debug, Clone)]
pub struct SearchScope {
    pub kind: EntryKind,
    pub base_dn: String,
    pub attr_map: AttributeMap,
    /// Roles required by the enabled projections on this side.
    pub roles: Vec<String>,
    /// Membership attribute read on this side under the active scheme.
    pub membership_attr: Option<&'static str>,
}

impl SearchScope {
    pub fn new(
        kind: EntryKind,
        base_dn: impl Into<String>,
        attr_map: AttributeMap,
        roles: Vec<String>,
        scheme: MemberScheme,
    ) -> Self {
        Self {
            kind,
            base_dn: base_dn.into(),
            attr_map,
            roles,
            membership_attr: scheme.membership_attribute_for(kind),
        }
    }

    /// Directory attributes to request: mapped roles plus the membership
    /// attribute, without duplicates.
    pub fn attributes(&self) -> Vec<String> {
        let mut attrs = self.attr_map.attributes_for(&self.roles);
        if let Some(member) = self.membership_attr {
            attrs.push(member.to_string());
        }
        let mut seen = Vec::with_capacity(attrs.len());
        attrs.retain(|a| {
            let lower = a.to_ascii_lowercase();
            if seen.contains(&lower) {
                false
            } else {
                seen.push(lower);
                true
            }
        });
        attrs
    }

    /// True when no enabled projection reads this side.
    pub fn is_unused(&self) -> bool {
        self.roles.is_empty()
    }

    /// Run the search with `filter` and capture the result as a snapshot.
    pub async fn fetch(
        &self,
        directory: &dyn Directory,
        filter: &str,
    ) -> Result<DirectorySnapshot, DirectoryError> {
        debug!(
            kind = %self.kind,
            base_dn = %self.base_dn,
            filter,
            "running search"
        );
        let raw = directory
            .search(self.kind, &self.base_dn, filter, &self.attributes())
            .await?;
        debug!(kind = %self.kind, count = raw.len(), "search results");
        Ok(DirectorySnapshot::from_raw(
            self.kind,
            raw,
            &self.attr_map,
            &self.roles,
            self.membership_attr,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr_map::{DEFAULT_GROUP_ATTR_MAP, DEFAULT_USER_ATTR_MAP};

    #[test]
    fn test_raw_values_case_insensitive() {
        let entry = RawEntry::new("cn=a,dc=test").with("memberUid", ["x", "y"]);
        assert_eq!(entry.values("memberuid"), ["x", "y"]);
        assert_eq!(entry.values("MEMBERUID").len(), 2);
        assert!(entry.values("member").is_empty());
    }

    #[test]
    fn test_user_attributes_include_member_of() {
        let scope = SearchScope::new(
            EntryKind::User,
            "ou=People,dc=test",
            AttributeMap::parse(DEFAULT_USER_ATTR_MAP),
            vec!["name".into(), "gid".into()],
            MemberScheme::MemberOf,
        );
        assert_eq!(scope.attributes(), ["uid", "gidNumber", "memberOf"]);
    }

    #[test]
    fn test_group_attributes_follow_scheme() {
        let roles = vec!["name".to_string(), "gid".to_string()];
        let map = AttributeMap::parse(DEFAULT_GROUP_ATTR_MAP);
        let member = SearchScope::new(
            EntryKind::Group,
            "ou=Groups,dc=test",
            map.clone(),
            roles.clone(),
            MemberScheme::Member,
        );
        assert_eq!(member.attributes(), ["cn", "gidNumber", "member"]);

        let member_of = SearchScope::new(
            EntryKind::Group,
            "ou=Groups,dc=test",
            map,
            roles,
            MemberScheme::MemberOf,
        );
        assert_eq!(member_of.attributes(), ["cn", "gidNumber"]);
    }

    #[test]
    fn test_duplicate_attributes_collapse() {
        let scope = SearchScope::new(
            EntryKind::User,
            "ou=People,dc=test",
            AttributeMap::parse("name=uid,uid=UID"),
            vec!["name".into(), "uid".into()],
            MemberScheme::Member,
        );
        assert_eq!(scope.attributes(), ["uid"]);
    }
}
