//! Synchronization pass orchestrator.
//!
//! The [`SyncEngine`] runs one pass as a small state machine:
//!
//! 1. Connect to the directory.
//! 2. Fetch the base user and group snapshots concurrently, skipping a side
//!    no enabled projection reads.
//! 3. Resolve the shared identity graph when a graph-derived projection
//!    uses the base snapshots.
//! 4. Dispatch every projection concurrently. Override queries run inside
//!    the projection's task and a failure there stays with that projection.
//! 5. Reconcile every computed output to the store concurrently.
//!
//! Metrics are recorded from the [`PassReport`] after all tasks have joined.
//! An atomic flag prevents overlapping passes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::attr_map::EntryKind;
use crate::config::AppConfig;
use crate::directory::{Directory, DirectoryConnector, SearchScope};
use crate::errors::{
    ConfigError, DirectoryError, PassError, ProjectionError, ProjectionFailure,
};
use crate::identity::{resolve_identity_graph, DirectorySnapshot, IdentityGraph};
use crate::metrics::SyncMetrics;
use crate::projection::{
    required_attributes, Output, Projection, ProjectionContext, ProjectionRegistry,
};
use crate::store::kube::ConfigMap;
use crate::store::{reconcile, ConfigStore, ReconcileAction};

// ---------------------------------------------------------------------------
// Pass state machine
// ---------------------------------------------------------------------------

/// Phases of a synchronization pass.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PassState {
    Idle,
    Connect,
    BaseFetch,
    Dispatch,
    Reconcile,
    Done,
    Failed,
}

impl fmt::Display for PassState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connect => write!(f, "connect"),
            Self::BaseFetch => write!(f, "base_fetch"),
            Self::Dispatch => write!(f, "dispatch"),
            Self::Reconcile => write!(f, "reconcile"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What happened to one projection during a pass.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectionOutcome {
    pub mapper: String,
    pub artifact: String,
    pub keys: usize,
    /// JSON-encoded size of the published object.
    pub size_bytes: usize,
    #[serde(skip)]
    pub action: Option<ReconcileAction>,
    pub error: Option<String>,
}

impl ProjectionOutcome {
    fn pending(projection: &Projection) -> Self {
        Self {
            mapper: projection.name().to_string(),
            artifact: projection.artifact_name().to_string(),
            keys: 0,
            size_bytes: 0,
            action: None,
            error: None,
        }
    }
}

/// Summary of a finished pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub failed: bool,
    /// One entry per projection that reached Dispatch.
    pub outcomes: Vec<ProjectionOutcome>,
}

impl PassReport {
    pub fn published(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_none()).count()
    }
}

/// Snapshot of engine status for the HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: PassState,
    pub running: bool,
    pub mappers: Vec<String>,
    pub last_pass: Option<PassReport>,
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Everything a pass needs that does not change between passes.
#[derive(Debug, Clone)]
pub struct PassPlan {
    pub projections: Vec<Projection>,
    pub ctx: ProjectionContext,
    pub users: SearchScope,
    pub groups: SearchScope,
    pub user_filter: String,
    pub group_filter: String,
    /// Projection name to user filter used instead of the base snapshot.
    pub user_overrides: BTreeMap<String, String>,
    /// Projection name to group filter used instead of the base snapshot.
    pub group_overrides: BTreeMap<String, String>,
}

impl PassPlan {
    /// Select the enabled projections and derive both search scopes from the
    /// union of their required roles.
    pub fn from_config(
        config: &AppConfig,
        registry: &ProjectionRegistry,
    ) -> Result<Self, ConfigError> {
        let projections = registry.enabled(&config.mappers.enabled)?;
        let ctx = config.projection_context();
        let scope = |kind: EntryKind, base_dn: &str| {
            SearchScope::new(
                kind,
                base_dn,
                config.ldap.attrs(kind),
                required_attributes(&projections, kind),
                ctx.scheme,
            )
        };
        let mut users = scope(EntryKind::User, &config.ldap.user_base_dn);
        let mut groups = scope(EntryKind::Group, &config.ldap.group_base_dn);
        if !projections.iter().any(Projection::is_graph_derived) {
            // membership is only read when building the identity graph
            users.membership_attr = None;
            groups.membership_attr = None;
        }
        Ok(Self {
            users,
            groups,
            user_filter: config.ldap.user_filter.clone(),
            group_filter: config.ldap.group_filter.clone(),
            user_overrides: config.mappers.user_filters.clone(),
            group_overrides: config.mappers.group_filters.clone(),
            projections,
            ctx,
        })
    }

    fn override_for(&self, kind: EntryKind, mapper: &str) -> Option<&str> {
        let overrides = match kind {
            EntryKind::User => &self.user_overrides,
            EntryKind::Group => &self.group_overrides,
        };
        overrides.get(mapper).map(String::as_str)
    }

    fn scope(&self, kind: EntryKind) -> &SearchScope {
        match kind {
            EntryKind::User => &self.users,
            EntryKind::Group => &self.groups,
        }
    }

    /// True when `projection` reads base snapshots only.
    fn uses_base_only(&self, projection: &Projection) -> bool {
        self.override_for(EntryKind::User, projection.name()).is_none()
            && self.override_for(EntryKind::Group, projection.name()).is_none()
    }

    fn needs_shared_graph(&self) -> bool {
        self.projections
            .iter()
            .any(|p| p.is_graph_derived() && self.uses_base_only(p))
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Inputs shared by every dispatch task of one pass.
struct PassInputs {
    plan: Arc<PassPlan>,
    directory: Arc<dyn Directory>,
    users: Arc<DirectorySnapshot>,
    groups: Arc<DirectorySnapshot>,
    graph: Option<Arc<IdentityGraph>>,
}

/// Runs synchronization passes.
pub struct SyncEngine {
    plan: Arc<PassPlan>,
    connector: Arc<dyn DirectoryConnector>,
    store: Arc<dyn ConfigStore>,
    metrics: Arc<SyncMetrics>,
    /// Atomic flag preventing concurrent passes.
    running: AtomicBool,
    state: Mutex<PassState>,
    last_pass: Mutex<Option<PassReport>>,
}

impl SyncEngine {
    pub fn new(
        plan: PassPlan,
        connector: Arc<dyn DirectoryConnector>,
        store: Arc<dyn ConfigStore>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        info!(
            mappers = ?plan.projections.iter().map(Projection::name).collect::<Vec<_>>(),
            namespace = store.namespace(),
            "initializing sync engine"
        );
        metrics.register_projections(&plan.projections);
        Self {
            plan: Arc::new(plan),
            connector,
            store,
            metrics,
            running: AtomicBool::new(false),
            state: Mutex::new(PassState::Idle),
            last_pass: Mutex::new(None),
        }
    }

    pub fn plan(&self) -> &PassPlan {
        &self.plan
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> PassState {
        *lock(&self.state)
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            state: self.state(),
            running: self.is_running(),
            mappers: self
                .plan
                .projections
                .iter()
                .map(|p| p.name().to_string())
                .collect(),
            last_pass: lock(&self.last_pass).clone(),
        }
    }

    fn enter(&self, state: PassState) {
        debug!(state = %state, "pass state");
        *lock(&self.state) = state;
    }

    // -----------------------------------------------------------------------
    // Main entry point
    // -----------------------------------------------------------------------

    /// Execute one full pass and record its metrics.
    ///
    /// Projections fail independently: a failed projection leaves its
    /// previously published object untouched while the others are still
    /// published, and all failures are joined into the returned error.
    pub async fn run_pass(&self) -> Result<PassReport, PassError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("pass requested while another is running");
            return Err(PassError::AlreadyRunning);
        }

        let started_at = Utc::now();
        let start = Instant::now();
        info!("starting synchronization pass");

        let (outcomes, result) = match self.execute().await {
            Ok((outcomes, failures)) if failures.is_empty() => (outcomes, Ok(())),
            Ok((outcomes, failures)) => (outcomes, Err(PassError::Projections(failures))),
            Err(e) => (Vec::new(), Err(e)),
        };

        let report = PassReport {
            started_at,
            duration: start.elapsed(),
            failed: result.is_err(),
            outcomes,
        };
        self.metrics.observe_pass(&report);

        match &result {
            Ok(()) => {
                self.enter(PassState::Done);
                info!(
                    published = report.published(),
                    duration_ms = report.duration.as_millis() as u64,
                    "pass complete"
                );
            }
            Err(e) => {
                self.enter(PassState::Failed);
                error!(
                    published = report.published(),
                    duration_ms = report.duration.as_millis() as u64,
                    error = %e,
                    "pass failed"
                );
            }
        }

        *lock(&self.last_pass) = Some(report.clone());
        self.running.store(false, Ordering::SeqCst);
        result.map(|()| report)
    }

    async fn execute(
        &self,
    ) -> Result<(Vec<ProjectionOutcome>, Vec<ProjectionFailure>), PassError> {
        self.enter(PassState::Connect);
        let directory = self.connector.connect().await?;
        let result = self.execute_connected(Arc::clone(&directory)).await;
        directory.close().await;
        result
    }

    async fn execute_connected(
        &self,
        directory: Arc<dyn Directory>,
    ) -> Result<(Vec<ProjectionOutcome>, Vec<ProjectionFailure>), PassError> {
        let plan = &self.plan;

        self.enter(PassState::BaseFetch);
        let (users, groups) = tokio::join!(
            fetch_base(directory.as_ref(), &plan.users, &plan.user_filter),
            fetch_base(directory.as_ref(), &plan.groups, &plan.group_filter),
        );
        let users = Arc::new(users?);
        let groups = Arc::new(groups?);

        let graph = if plan.needs_shared_graph() {
            let graph = resolve_identity_graph(
                &users,
                &groups,
                plan.ctx.scheme,
                &plan.ctx.user_prefix,
            )
            .map_err(|e| {
                error!(error = %e, "identity graph resolution failed, no mapper will run");
                e
            })?;
            debug!(users = graph.len(), "resolved shared identity graph");
            Some(Arc::new(graph))
        } else {
            None
        };

        self.enter(PassState::Dispatch);
        let inputs = Arc::new(PassInputs {
            plan: Arc::clone(plan),
            directory,
            users,
            groups,
            graph,
        });
        let handles: Vec<JoinHandle<Result<Output, ProjectionError>>> = plan
            .projections
            .iter()
            .map(|projection| {
                let inputs = Arc::clone(&inputs);
                let projection = projection.clone();
                tokio::spawn(async move { compute_projection(&inputs, &projection).await })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        let mut failures = Vec::new();
        let mut computed = Vec::new();
        for (projection, handle) in plan.projections.iter().zip(handles) {
            let mut outcome = ProjectionOutcome::pending(projection);
            match join_result(handle.await) {
                Ok(output) => {
                    outcome.keys = output.len();
                    computed.push((outcomes.len(), output));
                }
                Err(e) => record_failure(&mut outcome, &mut failures, e),
            }
            outcomes.push(outcome);
        }

        self.enter(PassState::Reconcile);
        let handles: Vec<(usize, JoinHandle<Result<(ReconcileAction, usize), ProjectionError>>)> =
            computed
                .into_iter()
                .map(|(index, output)| {
                    let store = Arc::clone(&self.store);
                    let artifact = outcomes[index].artifact.clone();
                    let handle =
                        tokio::spawn(async move { publish(store.as_ref(), &artifact, &output).await });
                    (index, handle)
                })
                .collect();

        for (index, handle) in handles {
            let outcome = &mut outcomes[index];
            match join_result(handle.await) {
                Ok((action, size_bytes)) => {
                    outcome.action = Some(action);
                    outcome.size_bytes = size_bytes;
                }
                Err(e) => record_failure(outcome, &mut failures, e),
            }
        }

        Ok((outcomes, failures))
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn fetch_base(
    directory: &dyn Directory,
    scope: &SearchScope,
    filter: &str,
) -> Result<DirectorySnapshot, DirectoryError> {
    if scope.is_unused() {
        debug!(kind = %scope.kind, "no enabled mapper reads this side, skipping search");
        return Ok(DirectorySnapshot::empty(scope.kind));
    }
    let snapshot = scope.fetch(directory, filter).await.map_err(|e| {
        error!(kind = %scope.kind, error = %e, "base search failed");
        e
    })?;
    info!(kind = %snapshot.kind(), count = snapshot.len(), "fetched directory entries");
    Ok(snapshot)
}

/// Run `projection` against the base snapshots, or against fresh snapshots
/// for the sides it overrides.
async fn compute_projection(
    inputs: &PassInputs,
    projection: &Projection,
) -> Result<Output, ProjectionError> {
    let plan = &inputs.plan;
    if plan.uses_base_only(projection) {
        if let Some(graph) = &inputs.graph {
            return projection.compute_with_graph(&plan.ctx, &inputs.users, graph);
        }
        return projection.compute_output(&plan.ctx, &inputs.users, &inputs.groups);
    }

    let (users, groups) = tokio::join!(
        fetch_override(inputs, projection, EntryKind::User),
        fetch_override(inputs, projection, EntryKind::Group),
    );
    let users = users?;
    let groups = groups?;
    projection.compute_output(
        &plan.ctx,
        users.as_ref().unwrap_or(&*inputs.users),
        groups.as_ref().unwrap_or(&*inputs.groups),
    )
}

async fn fetch_override(
    inputs: &PassInputs,
    projection: &Projection,
    kind: EntryKind,
) -> Result<Option<DirectorySnapshot>, DirectoryError> {
    let Some(filter) = inputs.plan.override_for(kind, projection.name()) else {
        return Ok(None);
    };
    if projection.required_attrs(kind).is_empty() {
        debug!(mapper = %projection.name(), kind = %kind, "override filter ignored, mapper does not read this side");
        return Ok(None);
    }
    debug!(mapper = %projection.name(), kind = %kind, filter, "running override search");
    let snapshot = inputs
        .plan
        .scope(kind)
        .fetch(inputs.directory.as_ref(), filter)
        .await?;
    Ok(Some(snapshot))
}

async fn publish(
    store: &dyn ConfigStore,
    artifact: &str,
    output: &Output,
) -> Result<(ReconcileAction, usize), ProjectionError> {
    let action = reconcile(store, artifact, output).await?;
    let size = ConfigMap::new(store.namespace(), artifact, output).encoded_len()?;
    Ok((action, size))
}

fn join_result<T>(
    joined: Result<Result<T, ProjectionError>, tokio::task::JoinError>,
) -> Result<T, ProjectionError> {
    joined.map_err(|e| ProjectionError::Aborted(e.to_string()))?
}

fn record_failure(
    outcome: &mut ProjectionOutcome,
    failures: &mut Vec<ProjectionFailure>,
    error: ProjectionError,
) {
    error!(mapper = %outcome.mapper, configmap = %outcome.artifact, error = %error, "mapper failed");
    outcome.error = Some(error.to_string());
    failures.push(ProjectionFailure {
        mapper: outcome.mapper.clone(),
        source: error,
    });
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
