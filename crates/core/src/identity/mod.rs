//! Identity graph resolution.
//!
//! Directory results are captured as immutable [`DirectorySnapshot`]s and
//! the [`resolver`] turns a user snapshot plus a group snapshot into the
//! canonical per-user group membership list, whichever of the three
//! membership encodings the directory uses.

pub mod resolver;
pub mod snapshot;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::attr_map::EntryKind;

pub use resolver::{resolve_identity_graph, Group, IdentityGraph};
pub use snapshot::{DirectoryEntry, DirectorySnapshot};

/// How group membership is encoded in the directory.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MemberScheme {
    /// Users list the DNs of the groups they belong to.
    #[default]
    MemberOf,
    /// Groups list the DNs of their members.
    Member,
    /// Groups list their members' names directly.
    MemberUid,
}

impl MemberScheme {
    /// The directory attribute carrying membership, and which side it lives on.
    pub fn membership_attribute(&self) -> (EntryKind, &'static str) {
        match self {
            Self::MemberOf => (EntryKind::User, "memberOf"),
            Self::Member => (EntryKind::Group, "member"),
            Self::MemberUid => (EntryKind::Group, "memberUid"),
        }
    }

    /// Membership attribute to request for `kind`, if this scheme reads it.
    pub fn membership_attribute_for(&self, kind: EntryKind) -> Option<&'static str> {
        let (side, attr) = self.membership_attribute();
        (side == kind).then_some(attr)
    }
}

impl fmt::Display for MemberScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemberOf => write!(f, "memberof"),
            Self::Member => write!(f, "member"),
            Self::MemberUid => write!(f, "memberuid"),
        }
    }
}
