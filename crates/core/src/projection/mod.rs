//! Projections ("mappers"): named derivations from directory snapshots to a
//! flat key/value dataset published as one ConfigMap.
//!
//! Every projection is one of two shapes:
//! - [`ProjectionKind::DirectAttribute`]: one key per user, the value is a
//!   single attribute of that user.
//! - [`ProjectionKind::GraphDerived`]: one key per user, the value is
//!   rendered from that user's groups in the identity graph.
//!
//! New projections are added by registering another descriptor with the
//! [`ProjectionRegistry`]; nothing else needs to change.

pub mod registry;

use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;

use crate::attr_map::{EntryKind, ROLE_GID, ROLE_NAME, ROLE_UID};
use crate::errors::ProjectionError;
use crate::identity::{resolve_identity_graph, DirectorySnapshot, Group, IdentityGraph, MemberScheme};

pub use registry::ProjectionRegistry;

/// Output dataset of one projection: key to value, sorted by key.
pub type Output = BTreeMap<String, String>;

/// Renders one user's groups as a ConfigMap value.
pub type RenderFn = fn(&[Group]) -> Result<String, serde_json::Error>;

/// The shape of a projection.
#[derive(Clone, Copy)]
pub enum ProjectionKind {
    /// Value is the user's attribute for `role`.
    DirectAttribute { role: &'static str },
    /// Value is `render` applied to the user's resolved groups.
    GraphDerived { render: RenderFn },
}

impl fmt::Debug for ProjectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DirectAttribute { role } => f
                .debug_struct("DirectAttribute")
                .field("role", role)
                .finish(),
            Self::GraphDerived { .. } => f.debug_struct("GraphDerived").finish_non_exhaustive(),
        }
    }
}

/// Settings every projection computes against.
#[derive(Debug, Clone, Default)]
pub struct ProjectionContext {
    pub scheme: MemberScheme,
    /// Prepended to every emitted user key.
    pub user_prefix: String,
}

/// A registered projection descriptor.
#[derive(Debug, Clone)]
pub struct Projection {
    name: String,
    artifact: String,
    user_attrs: Vec<String>,
    group_attrs: Vec<String>,
    kind: ProjectionKind,
}

impl Projection {
    /// A direct-attribute projection over users. Requires `name` and `role`.
    pub fn direct(name: impl Into<String>, role: &'static str) -> Self {
        let name = name.into();
        Self {
            artifact: format!("{name}-map"),
            name,
            user_attrs: vec![ROLE_NAME.to_string(), role.to_string()],
            group_attrs: Vec::new(),
            kind: ProjectionKind::DirectAttribute { role },
        }
    }

    /// A graph-derived projection. Requires `name` and `gid` on both sides.
    pub fn graph(name: impl Into<String>, render: RenderFn) -> Self {
        let name = name.into();
        let roles = vec![ROLE_NAME.to_string(), ROLE_GID.to_string()];
        Self {
            artifact: format!("{name}-map"),
            name,
            user_attrs: roles.clone(),
            group_attrs: roles,
            kind: ProjectionKind::GraphDerived { render },
        }
    }

    /// Publish under `artifact` instead of `<name>-map`.
    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = artifact.into();
        self
    }

    /// Stable identifier, used for selection and metric labels.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the ConfigMap this projection is published to.
    pub fn artifact_name(&self) -> &str {
        &self.artifact
    }

    pub fn is_graph_derived(&self) -> bool {
        matches!(self.kind, ProjectionKind::GraphDerived { .. })
    }

    /// Logical roles this projection reads on `kind` entries.
    pub fn required_attrs(&self, kind: EntryKind) -> &[String] {
        match kind {
            EntryKind::User => &self.user_attrs,
            EntryKind::Group => &self.group_attrs,
        }
    }

    /// Compute this projection's dataset from the given snapshots.
    pub fn compute_output(
        &self,
        ctx: &ProjectionContext,
        users: &DirectorySnapshot,
        groups: &DirectorySnapshot,
    ) -> Result<Output, ProjectionError> {
        debug!(mapper = %self.name, "mapper running");
        let output = match self.kind {
            ProjectionKind::DirectAttribute { role } => direct_output(ctx, users, role),
            ProjectionKind::GraphDerived { render } => {
                let graph = resolve_identity_graph(users, groups, ctx.scheme, &ctx.user_prefix)?;
                render_graph(&graph, render)?
            }
        };
        debug!(mapper = %self.name, keys = output.len(), "mapper complete");
        Ok(output)
    }

    /// Render an already resolved graph. Direct projections ignore the graph
    /// and read `users`.
    pub fn compute_with_graph(
        &self,
        ctx: &ProjectionContext,
        users: &DirectorySnapshot,
        graph: &IdentityGraph,
    ) -> Result<Output, ProjectionError> {
        debug!(mapper = %self.name, "mapper running on shared graph");
        let output = match self.kind {
            ProjectionKind::DirectAttribute { role } => direct_output(ctx, users, role),
            ProjectionKind::GraphDerived { render } => render_graph(graph, render)?,
        };
        debug!(mapper = %self.name, keys = output.len(), "mapper complete");
        Ok(output)
    }
}

/// Union of the roles `projections` need on `kind`, first occurrence order.
pub fn required_attributes(projections: &[Projection], kind: EntryKind) -> Vec<String> {
    let mut roles: Vec<String> = Vec::new();
    for role in projections.iter().flat_map(|p| p.required_attrs(kind)) {
        if !roles.contains(role) {
            roles.push(role.clone());
        }
    }
    roles
}

fn direct_output(ctx: &ProjectionContext, users: &DirectorySnapshot, role: &str) -> Output {
    users
        .entries()
        .iter()
        .map(|entry| {
            (
                format!("{}{}", ctx.user_prefix, entry.value(ROLE_NAME)),
                entry.value(role).to_string(),
            )
        })
        .collect()
}

fn render_graph(graph: &IdentityGraph, render: RenderFn) -> Result<Output, ProjectionError> {
    graph
        .iter()
        .map(|(user, groups)| Ok((user.clone(), render(groups)?)))
        .collect()
}

/// JSON array of group names, sorted lexicographically.
pub fn render_group_names(groups: &[Group]) -> Result<String, serde_json::Error> {
    let mut names: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
    names.sort_unstable();
    serde_json::to_string(&names)
}

/// JSON array of gids as strings, sorted numerically.
pub fn render_group_gids(groups: &[Group]) -> Result<String, serde_json::Error> {
    let mut gids: Vec<i64> = groups.iter().map(|g| g.gid).collect();
    gids.sort_unstable();
    let gids: Vec<String> = gids.iter().map(i64::to_string).collect();
    serde_json::to_string(&gids)
}

/// The projections shipped with the daemon.
pub fn builtin_projections() -> Vec<Projection> {
    vec![
        Projection::direct("user-uid", ROLE_UID),
        Projection::direct("user-gid", ROLE_GID),
        Projection::graph("user-groups", render_group_names),
        Projection::graph("user-gids", render_group_gids),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DirectoryEntry;

    fn sample_users() -> DirectorySnapshot {
        DirectorySnapshot::new(
            EntryKind::User,
            vec![
                DirectoryEntry::new("uid=alice,ou=People,dc=test")
                    .with(ROLE_NAME, "alice")
                    .with(ROLE_UID, "5001")
                    .with(ROLE_GID, "100")
                    .with_membership(["cn=zeta,ou=Groups,dc=test", "cn=alpha,ou=Groups,dc=test"]),
                DirectoryEntry::new("uid=bob,ou=People,dc=test")
                    .with(ROLE_NAME, "bob")
                    .with(ROLE_UID, "5002")
                    .with(ROLE_GID, "20"),
            ],
        )
    }

    fn sample_groups() -> DirectorySnapshot {
        DirectorySnapshot::new(
            EntryKind::Group,
            vec![
                DirectoryEntry::new("cn=zeta,ou=Groups,dc=test")
                    .with(ROLE_NAME, "zeta")
                    .with(ROLE_GID, "9"),
                DirectoryEntry::new("cn=alpha,ou=Groups,dc=test")
                    .with(ROLE_NAME, "alpha")
                    .with(ROLE_GID, "100"),
                DirectoryEntry::new("cn=mid,ou=Groups,dc=test")
                    .with(ROLE_NAME, "mid")
                    .with(ROLE_GID, "20"),
            ],
        )
    }

    fn ctx(prefix: &str) -> ProjectionContext {
        ProjectionContext {
            scheme: MemberScheme::MemberOf,
            user_prefix: prefix.into(),
        }
    }

    #[test]
    fn test_direct_projection_one_key_per_user() {
        let projection = Projection::direct("user-uid", ROLE_UID);
        let output = projection
            .compute_output(&ctx("ldap-"), &sample_users(), &DirectorySnapshot::empty(EntryKind::Group))
            .unwrap();
        assert_eq!(output.len(), 2);
        assert_eq!(output["ldap-alice"], "5001");
        assert_eq!(output["ldap-bob"], "5002");
    }

    #[test]
    fn test_group_names_sorted() {
        let projection = Projection::graph("user-groups", render_group_names);
        let output = projection
            .compute_output(&ctx(""), &sample_users(), &sample_groups())
            .unwrap();
        // primary "alpha" is first in the graph but the rendering is sorted
        assert_eq!(output["alice"], r#"["alpha","zeta"]"#);
        assert_eq!(output["bob"], r#"["mid"]"#);
    }

    #[test]
    fn test_group_gids_sorted_numerically() {
        let projection = Projection::graph("user-gids", render_group_gids);
        let output = projection
            .compute_output(&ctx(""), &sample_users(), &sample_groups())
            .unwrap();
        // 9 < 100 numerically, although "100" < "9" as strings
        assert_eq!(output["alice"], r#"["9","100"]"#);
    }

    #[test]
    fn test_output_is_idempotent() {
        let projection = Projection::graph("user-groups", render_group_names);
        let first = projection
            .compute_output(&ctx(""), &sample_users(), &sample_groups())
            .unwrap();
        let second = projection
            .compute_output(&ctx(""), &sample_users(), &sample_groups())
            .unwrap();
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[test]
    fn test_compute_with_graph_matches_compute_output() {
        let projection = Projection::graph("user-gids", render_group_gids);
        let context = ctx("");
        let graph = resolve_identity_graph(
            &sample_users(),
            &sample_groups(),
            context.scheme,
            &context.user_prefix,
        )
        .unwrap();
        assert_eq!(
            projection
                .compute_with_graph(&context, &sample_users(), &graph)
                .unwrap(),
            projection
                .compute_output(&context, &sample_users(), &sample_groups())
                .unwrap()
        );
    }

    #[test]
    fn test_graph_projection_propagates_bad_gid() {
        let groups = DirectorySnapshot::new(
            EntryKind::Group,
            vec![DirectoryEntry::new("cn=alpha,ou=Groups,dc=test")
                .with(ROLE_NAME, "alpha")
                .with(ROLE_GID, "one hundred")],
        );
        let projection = Projection::graph("user-gids", render_group_gids);
        let err = projection
            .compute_output(&ctx(""), &sample_users(), &groups)
            .unwrap_err();
        assert!(matches!(err, ProjectionError::Resolve(_)));
    }

    #[test]
    fn test_required_attributes_union() {
        let projections = builtin_projections();
        assert_eq!(
            required_attributes(&projections, EntryKind::User),
            ["name", "uid", "gid"]
        );
        assert_eq!(
            required_attributes(&projections[..2], EntryKind::Group),
            Vec::<String>::new()
        );
        assert_eq!(
            required_attributes(&projections, EntryKind::Group),
            ["name", "gid"]
        );
    }

    #[test]
    fn test_artifact_names() {
        let names: Vec<_> = builtin_projections()
            .iter()
            .map(|p| p.artifact_name().to_string())
            .collect();
        assert_eq!(
            names,
            ["user-uid-map", "user-gid-map", "user-groups-map", "user-gids-map"]
        );
        let custom = Projection::direct("user-uid", ROLE_UID).with_artifact("uids");
        assert_eq!(custom.name(), "user-uid");
        assert_eq!(custom.artifact_name(), "uids");
    }
}
