//! ldap-configmap core library.
//!
//! Reads user and group entries from an LDAP directory, resolves group
//! membership into a per-user identity graph, and publishes named
//! projections of it as Kubernetes ConfigMaps: configuration, directory
//! client, membership resolver, projections, store clients, metrics and the
//! pass orchestrator.

pub mod attr_map;
pub mod config;
pub mod directory;
pub mod errors;
pub mod identity;
pub mod metrics;
pub mod projection;
pub mod store;
pub mod sync_engine;

// Re-exports for convenience.
pub use config::AppConfig;
pub use metrics::SyncMetrics;
pub use projection::{Projection, ProjectionRegistry};
pub use sync_engine::{PassPlan, PassReport, SyncEngine};
