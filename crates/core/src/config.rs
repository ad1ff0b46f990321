//! TOML-based configuration for the LDAP to ConfigMap daemon.
//!
//! The bind password is never stored inline: `ldap.bind_password_env` names
//! an environment variable resolved at runtime via
//! [`AppConfig::resolve_env_vars`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::attr_map::{AttributeMap, EntryKind, DEFAULT_GROUP_ATTR_MAP, DEFAULT_USER_ATTR_MAP};
use crate::errors::ConfigError;
use crate::identity::MemberScheme;
use crate::projection::{ProjectionContext, ProjectionRegistry};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Scheduling, logging and HTTP listener.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Directory connection and search settings.
    pub ldap: LdapConfig,

    /// Which mappers run and how.
    #[serde(default)]
    pub mappers: MappersConfig,

    /// Where ConfigMaps are written.
    pub store: StoreConfig,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Seconds between the end of one pass and the start of the next.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log line format.
    #[serde(default)]
    pub log_format: LogFormat,

    /// Address the metrics endpoint listens on.
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_interval() -> u64 {
    300
}
fn default_log_level() -> String {
    "info".into()
}
fn default_listen() -> String {
    "0.0.0.0:8080".into()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            listen: default_listen(),
        }
    }
}

/// How the daemon writes log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable `key=value` lines.
    #[default]
    #[serde(alias = "logfmt")]
    Text,
    /// One JSON object per line.
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => f.write_str("text"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "logfmt" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!(
                "unknown log format '{other}' (expected text or json)"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// LDAP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdapConfig {
    /// `ldap://` or `ldaps://` URL.
    pub url: String,

    /// Upgrade the connection with StartTLS.
    #[serde(default)]
    pub tls: bool,

    /// Verify the server certificate.
    #[serde(default = "default_true")]
    pub tls_verify: bool,

    /// CA certificate: an absolute path to a PEM file, or inline PEM.
    #[serde(default)]
    pub tls_ca_cert: Option<String>,

    #[serde(default)]
    pub bind_dn: Option<String>,

    /// Environment variable holding the bind password.
    #[serde(default)]
    pub bind_password_env: Option<String>,

    /// Resolved bind password (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub bind_password: Option<String>,

    pub user_base_dn: String,

    #[serde(default)]
    pub group_base_dn: String,

    #[serde(default = "default_user_filter")]
    pub user_filter: String,

    #[serde(default = "default_group_filter")]
    pub group_filter: String,

    /// Use the paged results control for searches.
    #[serde(default)]
    pub paged_search: bool,

    #[serde(default = "default_page_size")]
    pub paged_search_size: u32,

    #[serde(default)]
    pub member_scheme: MemberScheme,

    /// `role=attribute` pairs for user entries.
    #[serde(default = "default_user_attr_map")]
    pub user_attr_map: String,

    /// `role=attribute` pairs for group entries.
    #[serde(default = "default_group_attr_map")]
    pub group_attr_map: String,
}

fn default_true() -> bool {
    true
}
fn default_user_filter() -> String {
    "(objectClass=posixAccount)".into()
}
fn default_group_filter() -> String {
    "(objectClass=posixGroup)".into()
}
fn default_page_size() -> u32 {
    1000
}
fn default_user_attr_map() -> String {
    DEFAULT_USER_ATTR_MAP.into()
}
fn default_group_attr_map() -> String {
    DEFAULT_GROUP_ATTR_MAP.into()
}

impl LdapConfig {
    pub fn user_attrs(&self) -> AttributeMap {
        AttributeMap::parse(&self.user_attr_map)
    }

    pub fn group_attrs(&self) -> AttributeMap {
        AttributeMap::parse(&self.group_attr_map)
    }

    pub fn attrs(&self, kind: EntryKind) -> AttributeMap {
        match kind {
            EntryKind::User => self.user_attrs(),
            EntryKind::Group => self.group_attrs(),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            url: "ldap://127.0.0.1:389".into(),
            tls: false,
            tls_verify: true,
            tls_ca_cert: None,
            bind_dn: None,
            bind_password_env: None,
            bind_password: None,
            user_base_dn: "ou=People,dc=test".into(),
            group_base_dn: "ou=Groups,dc=test".into(),
            user_filter: default_user_filter(),
            group_filter: default_group_filter(),
            paged_search: false,
            paged_search_size: default_page_size(),
            member_scheme: MemberScheme::default(),
            user_attr_map: default_user_attr_map(),
            group_attr_map: default_group_attr_map(),
        }
    }
}

// ---------------------------------------------------------------------------
// Mappers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappersConfig {
    /// Mapper names to run each pass.
    #[serde(default = "default_enabled")]
    pub enabled: Vec<String>,

    /// Prepended to every emitted user key.
    #[serde(default)]
    pub user_prefix: String,

    /// Per-mapper user filter overrides.
    #[serde(default)]
    pub user_filters: BTreeMap<String, String>,

    /// Per-mapper group filter overrides.
    #[serde(default)]
    pub group_filters: BTreeMap<String, String>,
}

fn default_enabled() -> Vec<String> {
    vec!["user-uid".into(), "user-gid".into()]
}

impl Default for MappersConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            user_prefix: String::new(),
            user_filters: BTreeMap::new(),
            group_filters: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Namespace the ConfigMaps are written to.
    pub namespace: String,

    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Bearer token file. Re-read on every request.
    #[serde(default = "default_token_file")]
    pub token_file: Option<PathBuf>,

    /// PEM bundle trusted for the API server.
    #[serde(default = "default_ca_file")]
    pub ca_file: Option<PathBuf>,
}

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

fn default_api_url() -> String {
    "https://kubernetes.default.svc".into()
}
fn default_token_file() -> Option<PathBuf> {
    Some(Path::new(SERVICE_ACCOUNT_DIR).join("token"))
}
fn default_ca_file() -> Option<PathBuf> {
    Some(Path::new(SERVICE_ACCOUNT_DIR).join("ca.crt"))
}

// ---------------------------------------------------------------------------
// Loading, resolving and validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables; call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve `*_env` fields from the environment. A missing variable only
    /// logs a warning; [`validate`](Self::validate) decides if it matters.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if let Some(ref env_name) = self.ldap.bind_password_env {
            self.ldap.bind_password = resolve_optional_env(env_name, "ldap.bind_password_env");
        }
        Ok(())
    }

    /// Check the whole configuration against `registry`, reporting every
    /// problem at once.
    pub fn validate(&self, registry: &ProjectionRegistry) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.daemon.interval_secs == 0 {
            errors.push(invalid("daemon.interval_secs", "interval must be > 0"));
        }
        if self.ldap.url.is_empty() {
            errors.push(invalid("ldap.url", "LDAP URL must not be empty"));
        }
        if self.ldap.user_base_dn.is_empty() {
            errors.push(invalid("ldap.user_base_dn", "user base DN must not be empty"));
        }
        if self.ldap.paged_search && self.ldap.paged_search_size == 0 {
            errors.push(invalid("ldap.paged_search_size", "page size must be > 0"));
        }
        if self.store.namespace.is_empty() {
            errors.push(invalid("store.namespace", "namespace must not be empty"));
        }

        let has_dn = self.ldap.bind_dn.as_deref().is_some_and(|s| !s.is_empty());
        let has_password = self.ldap.bind_password.is_some();
        if has_dn && !has_password {
            errors.push(invalid(
                "ldap.bind_password_env",
                "bind DN is set but no bind password was resolved",
            ));
        }
        if has_password && !has_dn {
            errors.push(invalid("ldap.bind_dn", "bind password is set without a bind DN"));
        }

        for name in &self.mappers.enabled {
            if !registry.contains(name) {
                errors.push(ConfigError::UnknownProjection {
                    name: name.clone(),
                    field: "mappers.enabled".into(),
                });
            }
        }
        for (field, overrides) in [
            ("mappers.user_filters", &self.mappers.user_filters),
            ("mappers.group_filters", &self.mappers.group_filters),
        ] {
            for name in overrides.keys().filter(|n| !registry.contains(n)) {
                errors.push(ConfigError::UnknownProjection {
                    name: name.clone(),
                    field: field.into(),
                });
            }
        }

        for kind in [EntryKind::User, EntryKind::Group] {
            let required = registry.required_attrs(kind, &self.mappers.enabled);
            errors.extend(self.ldap.attrs(kind).validate(kind, &required));
        }
        if self.ldap.group_base_dn.is_empty()
            && !registry
                .required_attrs(EntryKind::Group, &self.mappers.enabled)
                .is_empty()
        {
            errors.push(invalid(
                "ldap.group_base_dn",
                "group base DN is required by the enabled mappers",
            ));
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::Multiple(errors)),
        }
    }

    pub fn projection_context(&self) -> ProjectionContext {
        ProjectionContext {
            scheme: self.ldap.member_scheme,
            user_prefix: self.mappers.user_prefix.clone(),
        }
    }
}

fn invalid(field: &str, detail: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        detail: detail.into(),
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}
