//! Prometheus instrumentation for synchronization passes.
//!
//! Everything is registered under the `k8_ldap_configmap` prefix. Per-mapper and
//! per-ConfigMap series are created up front for every enabled projection so
//! they are scrapeable (at zero) before the first pass completes.

use std::sync::atomic::AtomicU64;
use std::sync::Mutex;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::info::Info;
use prometheus_client::registry::Registry;
use tracing::error;

use crate::projection::Projection;
use crate::sync_engine::PassReport;

pub const METRIC_PREFIX: &str = "k8_ldap_configmap";

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MapperLabels {
    pub mapper: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ConfigMapLabels {
    pub configmap: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BuildLabels {
    version: String,
}

/// All pass metrics plus the registry that exposes them.
pub struct SyncMetrics {
    registry: Mutex<Registry>,
    pub error: Gauge,
    pub errors: Family<MapperLabels, Counter>,
    pub run_duration_seconds: Gauge<f64, AtomicU64>,
    pub last_run_timestamp_seconds: Gauge<f64, AtomicU64>,
    pub size_bytes: Family<ConfigMapLabels, Gauge>,
    pub keys_count: Family<ConfigMapLabels, Gauge>,
}

impl SyncMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix(METRIC_PREFIX);

        registry.register(
            "build",
            "Build information",
            Info::new(BuildLabels {
                version: env!("CARGO_PKG_VERSION").to_string(),
            }),
        );

        let error = Gauge::default();
        registry.register("error", "1 if the last pass failed, 0 otherwise", error.clone());

        let errors = Family::<MapperLabels, Counter>::default();
        registry.register("errors", "Failed runs per mapper", errors.clone());

        let run_duration_seconds = Gauge::<f64, AtomicU64>::default();
        registry.register(
            "run_duration_seconds",
            "Duration of the last pass in seconds",
            run_duration_seconds.clone(),
        );

        let last_run_timestamp_seconds = Gauge::<f64, AtomicU64>::default();
        registry.register(
            "last_run_timestamp_seconds",
            "Unix time the last pass started",
            last_run_timestamp_seconds.clone(),
        );

        let size_bytes = Family::<ConfigMapLabels, Gauge>::default();
        registry.register(
            "size_bytes",
            "JSON-encoded size of the last published ConfigMap",
            size_bytes.clone(),
        );

        let keys_count = Family::<ConfigMapLabels, Gauge>::default();
        registry.register(
            "keys_count",
            "Number of keys in the last published ConfigMap",
            keys_count.clone(),
        );

        Self {
            registry: Mutex::new(registry),
            error,
            errors,
            run_duration_seconds,
            last_run_timestamp_seconds,
            size_bytes,
            keys_count,
        }
    }

    /// Create the labelled series for every enabled projection.
    pub fn register_projections(&self, projections: &[Projection]) {
        for projection in projections {
            let _ = self.errors.get_or_create(&mapper_labels(projection.name()));
            let labels = configmap_labels(projection.artifact_name());
            let _ = self.size_bytes.get_or_create(&labels);
            let _ = self.keys_count.get_or_create(&labels);
        }
    }

    /// Record a finished pass.
    pub fn observe_pass(&self, report: &PassReport) {
        self.last_run_timestamp_seconds
            .set(report.started_at.timestamp() as f64);
        self.run_duration_seconds
            .set(report.duration.as_secs_f64());
        self.error.set(i64::from(report.failed));

        for outcome in &report.outcomes {
            if outcome.error.is_some() {
                self.errors.get_or_create(&mapper_labels(&outcome.mapper)).inc();
                continue;
            }
            let labels = configmap_labels(&outcome.artifact);
            self.keys_count
                .get_or_create(&labels)
                .set(saturating_i64(outcome.keys));
            self.size_bytes
                .get_or_create(&labels)
                .set(saturating_i64(outcome.size_bytes));
        }
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        let registry = match self.registry.lock() {
            Ok(registry) => registry,
            Err(poisoned) => poisoned.into_inner(),
        };
        prometheus_client::encoding::text::encode(&mut buf, &registry).map_err(|e| {
            error!(error = %e, "failed to encode metrics");
            e
        })?;
        Ok(buf)
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn mapper_labels(mapper: &str) -> MapperLabels {
    MapperLabels {
        mapper: mapper.to_string(),
    }
}

fn configmap_labels(configmap: &str) -> ConfigMapLabels {
    ConfigMapLabels {
        configmap: configmap.to_string(),
    }
}

fn saturating_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
