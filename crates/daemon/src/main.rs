//! ldap-configmap daemon entry point.
//!
//! Loads and validates configuration, starts the metrics server and the pass
//! scheduler, and handles graceful shutdown.

mod scheduler;
mod signals;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ldap_configmap_core::config::{AppConfig, LogFormat};
use ldap_configmap_core::directory::LdapConnector;
use ldap_configmap_core::store::KubeConfigMapStore;
use ldap_configmap_core::sync_engine::{PassPlan, SyncEngine};
use ldap_configmap_core::{ProjectionRegistry, SyncMetrics};
use ldap_configmap_web::WebServer;

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// Publishes LDAP users and groups as Kubernetes ConfigMaps.
#[derive(Parser, Debug)]
#[command(
    name = "ldap-configmap",
    version,
    about = "Synchronizes LDAP identity data into Kubernetes ConfigMaps"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "LDAP_CONFIGMAP_CONFIG")]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Override the log format from the config file (text, logfmt, json).
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Run a single pass and exit; the exit code reflects the pass result.
    #[arg(long, conflicts_with = "check_config")]
    once: bool,

    /// Validate the configuration and exit.
    #[arg(long)]
    check_config: bool,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config =
        AppConfig::load_from_file(&args.config).context("failed to load configuration file")?;
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables in config")?;

    // Initialize tracing
    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.daemon.log_level.clone());
    let log_format = args.log_format.unwrap_or(config.daemon.log_format);
    let filter = EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false);
    match log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }

    let registry = ProjectionRegistry::with_builtin();
    config
        .validate(&registry)
        .context("configuration validation failed")?;

    if args.check_config {
        info!(path = %args.config.display(), "configuration is valid");
        return Ok(());
    }

    // Startup banner
    info!("========================================");
    info!("  ldap-configmap v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file   : {}", args.config.display());
    info!("LDAP URL      : {}", config.ldap.url);
    info!("Member scheme : {}", config.ldap.member_scheme);
    info!("Mappers       : {}", config.mappers.enabled.join(","));
    info!("Namespace     : {}", config.store.namespace);
    info!("Interval      : {}s", config.daemon.interval_secs);
    info!("Listen        : {}", config.daemon.listen);
    info!("Log level     : {}", log_level);
    info!("Log format    : {}", log_format);
    info!("========================================");

    let plan = PassPlan::from_config(&config, &registry).context("failed to select mappers")?;
    let store = KubeConfigMapStore::from_config(&config.store)
        .context("failed to create ConfigMap client")?;
    let sync_engine = Arc::new(SyncEngine::new(
        plan,
        Arc::new(LdapConnector::new(config.ldap.clone())),
        Arc::new(store),
        Arc::new(SyncMetrics::new()),
    ));

    if args.once {
        let report = sync_engine.run_pass().await.context("pass failed")?;
        info!(published = report.published(), "single pass complete");
        return Ok(());
    }

    // Bind first so an unusable address is fatal before any pass runs
    let listener = ldap_configmap_web::bind(&config.daemon.listen)
        .await
        .with_context(|| format!("failed to listen on {}", config.daemon.listen))?;
    let mut web_handle = tokio::spawn(WebServer::new(sync_engine.clone()).serve(listener));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sched = scheduler::Scheduler::new(
        sync_engine.clone(),
        Duration::from_secs(config.daemon.interval_secs),
    );
    let stats = sched.stats();
    let scheduler_handle = tokio::spawn(sched.run(shutdown_rx));

    let result = tokio::select! {
        _ = signals::wait_for_shutdown() => {
            info!("Shutdown signal received, stopping...");
            Ok(())
        }
        joined = &mut web_handle => {
            let err = match joined {
                Ok(Ok(())) => anyhow!("web server exited unexpectedly"),
                Ok(Err(e)) => e.context("web server failed"),
                Err(e) => anyhow!(e).context("web server task panicked"),
            };
            error!(error = %format!("{err:#}"), "web server stopped, shutting down");
            Err(err)
        }
    };

    // Signal cooperative shutdown to the scheduler
    let _ = shutdown_tx.send(true);

    // Wait for the scheduler to finish its current pass (up to 10s)
    match tokio::time::timeout(Duration::from_secs(10), scheduler_handle).await {
        Ok(Ok(())) => info!("scheduler stopped gracefully"),
        Ok(Err(e)) => warn!("scheduler task error: {}", e),
        Err(_) => warn!("scheduler did not stop within 10s, forcing shutdown"),
    }

    web_handle.abort();

    info!(
        passes = stats.total_passes.load(Ordering::SeqCst),
        errors = stats.total_errors.load(Ordering::SeqCst),
        "ldap-configmap daemon stopped"
    );
    result
}
