//! Builds the identity graph: every user's ordered, deduplicated groups.
//!
//! Resolution steps:
//! 1. Index user and group DNs (case-folded) to logical names.
//! 2. Index group gid <-> group name. Later groups win on collisions.
//! 3. Under `member`/`memberuid`, walk each group's members and accumulate
//!    the group under each member's raw name.
//! 4. For each user, take the scheme's membership (group DNs for `memberof`,
//!    the accumulated list otherwise), deduplicate it, and prepend the
//!    primary group (user gid -> group name) when not already present.
//! 5. Attach each group's numeric gid. A non-numeric gid aborts resolution.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, error, warn};

use super::snapshot::{dn_key, DirectorySnapshot};
use super::MemberScheme;
use crate::attr_map::{ROLE_GID, ROLE_NAME};
use crate::errors::ResolveError;

/// A group a user belongs to. `gid` is 0 when the directory exposed no gid
/// for that group name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Group {
    pub name: String,
    pub gid: i64,
}

impl Group {
    pub fn new(name: impl Into<String>, gid: i64) -> Self {
        Self {
            name: name.into(),
            gid,
        }
    }
}

/// User key (prefix + name) to that user's groups, primary group first.
pub type IdentityGraph = BTreeMap<String, Vec<Group>>;

/// Resolve `users` and `groups` into an [`IdentityGraph`] under `scheme`.
///
/// Every user in `users` gets an entry, possibly with an empty group list.
pub fn resolve_identity_graph(
    users: &DirectorySnapshot,
    groups: &DirectorySnapshot,
    scheme: MemberScheme,
    user_prefix: &str,
) -> Result<IdentityGraph, ResolveError> {
    let user_dns: HashMap<String, &str> = users
        .entries()
        .iter()
        .map(|e| (e.dn_key(), e.value(ROLE_NAME)))
        .collect();
    let group_dns: HashMap<String, &str> = groups
        .entries()
        .iter()
        .map(|e| (e.dn_key(), e.value(ROLE_NAME)))
        .collect();

    let mut gid_to_group: HashMap<&str, &str> = HashMap::new();
    let mut group_to_gid: HashMap<&str, &str> = HashMap::new();
    let mut pending: HashMap<&str, Vec<&str>> = HashMap::new();

    for entry in groups.entries() {
        let name = entry.value(ROLE_NAME);
        let gid = entry.value(ROLE_GID);
        if let Some(previous) = gid_to_group.insert(gid, name) {
            if previous != name {
                warn!(
                    gid,
                    previous,
                    group = name,
                    "gid shared by several groups, last one wins"
                );
            }
        }
        group_to_gid.insert(name, gid);

        let members: Vec<&str> = match scheme {
            MemberScheme::Member => entry
                .membership()
                .iter()
                .filter_map(|dn| user_dns.get(&dn_key(dn)).copied())
                .collect(),
            MemberScheme::MemberUid => entry.membership().iter().map(String::as_str).collect(),
            MemberScheme::MemberOf => Vec::new(),
        };
        for member in members {
            pending.entry(member).or_default().push(name);
        }
    }

    let mut graph = IdentityGraph::new();
    for entry in users.entries() {
        let name = entry.value(ROLE_NAME);
        let user_gid = entry.value(ROLE_GID);

        let primary = if user_gid.is_empty() {
            None
        } else {
            gid_to_group.get(user_gid).copied().filter(|g| !g.is_empty())
        };

        let scheme_groups: Vec<&str> = match scheme {
            MemberScheme::MemberOf => entry
                .membership()
                .iter()
                .filter_map(|dn| group_dns.get(&dn_key(dn)).copied())
                .collect(),
            MemberScheme::Member | MemberScheme::MemberUid => {
                pending.get(name).cloned().unwrap_or_default()
            }
        };

        let mut names = dedup(scheme_groups);
        if let Some(primary) = primary {
            if !names.contains(&primary) {
                names.insert(0, primary);
            }
        }

        let resolved = names
            .into_iter()
            .map(|group| Ok(Group::new(group, parse_gid(group, group_to_gid.get(group))?)))
            .collect::<Result<Vec<_>, ResolveError>>()?;

        graph.insert(format!("{user_prefix}{name}"), resolved);
    }

    debug!(
        scheme = %scheme,
        users = graph.len(),
        groups = groups.len(),
        "identity graph resolved"
    );
    Ok(graph)
}

/// Drop repeated names, keeping the first occurrence.
fn dedup(names: Vec<&str>) -> Vec<&str> {
    let mut seen = HashSet::with_capacity(names.len());
    names.into_iter().filter(|n| seen.insert(*n)).collect()
}

fn parse_gid(group: &str, gid: Option<&&str>) -> Result<i64, ResolveError> {
    match gid.copied() {
        None | Some("") => Ok(0),
        Some(value) => value.parse::<i64>().map_err(|e| {
            error!(group, gid = value, error = %e, "unable to parse gid to integer");
            ResolveError::InvalidGid {
                group: group.to_string(),
                value: value.to_string(),
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr_map::EntryKind;
    use crate::identity::DirectoryEntry;

    const PEOPLE: &str = "ou=People,dc=test";
    const GROUPS: &str = "ou=Groups,dc=test";

    fn user(name: &str, gid: &str, member_of: &[&str]) -> DirectoryEntry {
        DirectoryEntry::new(format!("uid={name},{PEOPLE}"))
            .with(ROLE_NAME, name)
            .with(ROLE_GID, gid)
            .with_membership(member_of.iter().map(|g| format!("cn={g},{GROUPS}")))
    }

    fn group(name: &str, gid: &str, members: Vec<String>) -> DirectoryEntry {
        DirectoryEntry::new(format!("cn={name},{GROUPS}"))
            .with(ROLE_NAME, name)
            .with(ROLE_GID, gid)
            .with_membership(members)
    }

    fn user_dn(name: &str) -> String {
        format!("uid={name},{PEOPLE}")
    }

    fn names(graph: &IdentityGraph, key: &str) -> Vec<String> {
        graph[key].iter().map(|g| g.name.clone()).collect()
    }

    fn users(entries: Vec<DirectoryEntry>) -> DirectorySnapshot {
        DirectorySnapshot::new(EntryKind::User, entries)
    }

    fn groups(entries: Vec<DirectoryEntry>) -> DirectorySnapshot {
        DirectorySnapshot::new(EntryKind::Group, entries)
    }

    #[test]
    fn test_member_scheme_with_primary_injection() {
        let users = users(vec![user("u1", "1000", &[]), user("u2", "1000", &[])]);
        let groups = groups(vec![
            group("g1000", "1000", vec![user_dn("u1")]),
            group("g1001", "1001", vec!["u2".into()]),
        ]);

        let graph = resolve_identity_graph(&users, &groups, MemberScheme::Member, "").unwrap();
        assert_eq!(graph["u1"], vec![Group::new("g1000", 1000)]);
        // "u2" is a bare name, not a DN, so `member` cannot resolve it.
        assert_eq!(graph["u2"], vec![Group::new("g1000", 1000)]);
    }

    #[test]
    fn test_member_of_scheme() {
        let users = users(vec![
            user("alice", "1000", &["staff", "admins"]),
            user("bob", "1001", &["admins"]),
        ]);
        let groups = groups(vec![
            group("staff", "1000", vec![]),
            group("admins", "1001", vec![]),
        ]);

        let graph = resolve_identity_graph(&users, &groups, MemberScheme::MemberOf, "").unwrap();
        assert_eq!(names(&graph, "alice"), ["staff", "admins"]);
        assert_eq!(names(&graph, "bob"), ["admins"]);
    }

    #[test]
    fn test_member_uid_scheme() {
        let users = users(vec![
            user("alice", "1000", &[]),
            user("bob", "1000", &[]),
            user("carol", "1001", &[]),
        ]);
        let groups = groups(vec![
            group("staff", "1000", vec!["alice".into()]),
            group("admins", "1001", vec!["bob".into(), "carol".into()]),
        ]);

        let graph = resolve_identity_graph(&users, &groups, MemberScheme::MemberUid, "").unwrap();
        assert_eq!(names(&graph, "alice"), ["staff"]);
        assert_eq!(names(&graph, "bob"), ["staff", "admins"]);
        assert_eq!(names(&graph, "carol"), ["admins"]);
    }

    #[test]
    fn test_scheme_selects_the_side_read() {
        // Same data; only the side named by the scheme contributes.
        let users = users(vec![user("alice", "", &["admins"])]);
        let groups = groups(vec![
            group("staff", "1000", vec!["alice".into()]),
            group("admins", "1001", vec![]),
        ]);

        let by_user = resolve_identity_graph(&users, &groups, MemberScheme::MemberOf, "").unwrap();
        assert_eq!(names(&by_user, "alice"), ["admins"]);

        let by_group =
            resolve_identity_graph(&users, &groups, MemberScheme::MemberUid, "").unwrap();
        assert_eq!(names(&by_group, "alice"), ["staff"]);
    }

    #[test]
    fn test_dn_matching_is_case_insensitive() {
        let users = users(vec![DirectoryEntry::new("uid=alice,ou=People,dc=test")
            .with(ROLE_NAME, "alice")
            .with_membership(["CN=Staff,OU=Groups,DC=TEST"])]);
        let groups = groups(vec![
            group("staff", "1000", vec![]),
            group("admins", "1001", vec!["UID=ALICE,ou=people,DC=test".into()]),
        ]);

        let member_of =
            resolve_identity_graph(&users, &groups, MemberScheme::MemberOf, "").unwrap();
        assert_eq!(names(&member_of, "alice"), ["staff"]);

        let member = resolve_identity_graph(&users, &groups, MemberScheme::Member, "").unwrap();
        assert_eq!(names(&member, "alice"), ["admins"]);
    }

    #[test]
    fn test_primary_group_not_moved_when_already_present() {
        let users = users(vec![user("alice", "1001", &["staff", "admins"])]);
        let groups = groups(vec![
            group("staff", "1000", vec![]),
            group("admins", "1001", vec![]),
        ]);

        let graph = resolve_identity_graph(&users, &groups, MemberScheme::MemberOf, "").unwrap();
        assert_eq!(names(&graph, "alice"), ["staff", "admins"]);
    }

    #[test]
    fn test_primary_group_prepended() {
        let users = users(vec![user("alice", "1001", &["staff"])]);
        let groups = groups(vec![
            group("staff", "1000", vec![]),
            group("admins", "1001", vec![]),
        ]);

        let graph = resolve_identity_graph(&users, &groups, MemberScheme::MemberOf, "").unwrap();
        assert_eq!(
            graph["alice"],
            vec![Group::new("admins", 1001), Group::new("staff", 1000)]
        );
    }

    #[test]
    fn test_duplicates_removed() {
        let users = users(vec![user(
            "alice",
            "",
            &["staff", "STAFF", "admins", "staff"],
        )]);
        let groups = groups(vec![
            group("staff", "1000", vec![]),
            group("admins", "1001", vec![]),
        ]);

        let graph = resolve_identity_graph(&users, &groups, MemberScheme::MemberOf, "").unwrap();
        assert_eq!(names(&graph, "alice"), ["staff", "admins"]);
    }

    #[test]
    fn test_group_name_comparison_is_exact() {
        // Group names differing in case are distinct groups.
        let users = users(vec![user("alice", "2000", &["staff"])]);
        let groups = groups(vec![
            group("staff", "1000", vec![]),
            DirectoryEntry::new("cn=Staff,ou=Legacy,dc=test")
                .with(ROLE_NAME, "Staff")
                .with(ROLE_GID, "2000"),
        ]);

        let graph = resolve_identity_graph(&users, &groups, MemberScheme::MemberOf, "").unwrap();
        assert_eq!(names(&graph, "alice"), ["Staff", "staff"]);
    }

    #[test]
    fn test_user_without_groups_has_empty_entry() {
        let users = users(vec![user("nobody", "9999", &[])]);
        let groups = groups(vec![group("staff", "1000", vec![])]);

        let graph = resolve_identity_graph(&users, &groups, MemberScheme::MemberOf, "").unwrap();
        assert_eq!(graph.len(), 1);
        assert!(graph["nobody"].is_empty());
    }

    #[test]
    fn test_prefix_applied_to_keys_only() {
        let users = users(vec![user("alice", "1000", &[])]);
        let groups = groups(vec![group("staff", "1000", vec!["alice".into()])]);

        let graph =
            resolve_identity_graph(&users, &groups, MemberScheme::MemberUid, "ldap-").unwrap();
        assert_eq!(names(&graph, "ldap-alice"), ["staff"]);
        assert!(!graph.contains_key("alice"));
    }

    #[test]
    fn test_unresolvable_member_dn_dropped() {
        let users = users(vec![user("alice", "", &[])]);
        let groups = groups(vec![group(
            "staff",
            "1000",
            vec!["uid=ghost,ou=People,dc=test".into(), user_dn("alice")],
        )]);

        let graph = resolve_identity_graph(&users, &groups, MemberScheme::Member, "").unwrap();
        assert_eq!(graph.len(), 1);
        assert_eq!(names(&graph, "alice"), ["staff"]);
    }

    #[test]
    fn test_group_without_gid_resolves_to_zero() {
        let users = users(vec![user("alice", "", &["nogid"])]);
        let groups = groups(vec![DirectoryEntry::new(format!("cn=nogid,{GROUPS}"))
            .with(ROLE_NAME, "nogid")]);

        let graph = resolve_identity_graph(&users, &groups, MemberScheme::MemberOf, "").unwrap();
        assert_eq!(graph["alice"], vec![Group::new("nogid", 0)]);
    }

    #[test]
    fn test_non_numeric_gid_is_fatal() {
        let users = users(vec![user("alice", "", &["broken"])]);
        let groups = groups(vec![group("broken", "12ab", vec![])]);

        let err =
            resolve_identity_graph(&users, &groups, MemberScheme::MemberOf, "").unwrap_err();
        assert!(matches!(
            err,
            ResolveError::InvalidGid { ref group, ref value } if group == "broken" && value == "12ab"
        ));
    }

    #[test]
    fn test_padded_or_blank_gid_is_fatal() {
        for bad in ["   ", " 100"] {
            let users = users(vec![user("alice", "", &["g"])]);
            let groups = groups(vec![group("g", bad, vec![])]);

            let err =
                resolve_identity_graph(&users, &groups, MemberScheme::MemberOf, "").unwrap_err();
            assert!(
                matches!(err, ResolveError::InvalidGid { ref value, .. } if value == bad),
                "gid {bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_duplicate_gid_last_group_wins() {
        let users = users(vec![user("alice", "1000", &[])]);
        let groups = groups(vec![
            group("first", "1000", vec![]),
            group("second", "1000", vec![]),
        ]);

        let graph = resolve_identity_graph(&users, &groups, MemberScheme::MemberOf, "").unwrap();
        assert_eq!(names(&graph, "alice"), ["second"]);
    }
}
