//! Logical attribute roles and their mapping onto directory schema names.
//!
//! Projections speak in roles (`name`, `uid`, `gid`); the directory speaks in
//! schema attributes (`uid`, `uidNumber`, `cn`, ...). An [`AttributeMap`] is
//! parsed from `role=attr` pairs separated by commas.

use std::collections::BTreeMap;
use std::fmt;

use crate::errors::ConfigError;

/// Role holding an entry's logical name.
pub const ROLE_NAME: &str = "name";
/// Role holding a user's numeric uid.
pub const ROLE_UID: &str = "uid";
/// Role holding a numeric gid (primary gid for users, own gid for groups).
pub const ROLE_GID: &str = "gid";

/// Default user map: `name=uid,uid=uidNumber,gid=gidNumber`.
pub const DEFAULT_USER_ATTR_MAP: &str = "name=uid,uid=uidNumber,gid=gidNumber";
/// Default group map: `name=cn,gid=gidNumber`.
pub const DEFAULT_GROUP_ATTR_MAP: &str = "name=cn,gid=gidNumber";

/// Which kind of directory entry an attribute or snapshot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    User,
    Group,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Group => write!(f, "group"),
        }
    }
}

/// Mapping from logical role to directory attribute name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeMap {
    roles: BTreeMap<String, String>,
}

impl AttributeMap {
    /// Parse `role=attr,role=attr`. Pairs without `=` are skipped.
    pub fn parse(raw: &str) -> Self {
        Self {
            roles: parse_pairs(raw),
        }
    }

    /// The directory attribute name for `role`, if mapped to a non-empty name.
    pub fn get(&self, role: &str) -> Option<&str> {
        self.roles
            .get(role)
            .map(String::as_str)
            .filter(|attr| !attr.is_empty())
    }

    /// Like [`get`](Self::get) but reports an unmapped role as an error.
    pub fn resolve(&self, kind: EntryKind, role: &str) -> Result<&str, ConfigError> {
        self.get(role).ok_or_else(|| ConfigError::MissingAttribute {
            side: kind.to_string(),
            role: role.to_string(),
        })
    }

    /// Check that every role in `required` resolves.
    pub fn validate(&self, kind: EntryKind, required: &[String]) -> Vec<ConfigError> {
        required
            .iter()
            .filter_map(|role| self.resolve(kind, role).err())
            .collect()
    }

    /// Directory attribute names for `roles`, skipping unmapped ones.
    pub fn attributes_for(&self, roles: &[String]) -> Vec<String> {
        roles
            .iter()
            .filter_map(|role| self.get(role))
            .map(str::to_string)
            .collect()
    }

    pub fn roles(&self) -> impl Iterator<Item = (&str, &str)> {
        self.roles.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Split `key=value,key=value` into a map. Later keys overwrite earlier ones.
pub fn parse_pairs(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
