//! Error types for the ldap-configmap core library.
//!
//! Each subsystem has its own error type derived with `thiserror`. A pass
//! reports through [`PassError`], which carries the subsystem errors.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// An enabled projection needs a logical role the attribute map lacks.
    #[error("{side} attribute map is missing key '{role}'")]
    MissingAttribute { side: String, role: String },

    /// A projection name that is not registered.
    #[error("unknown mapper '{name}' in {field}")]
    UnknownProjection { name: String, field: String },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Several problems found by one validation run.
    #[error("{}", join_messages(.0))]
    Multiple(Vec<ConfigError>),

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Directory errors
// ---------------------------------------------------------------------------

/// Connectivity and protocol failures talking to the directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The URL could not be dialed.
    #[error("failed to connect to LDAP server at {url}: {detail}")]
    ConnectFailed { url: String, detail: String },

    /// TLS setup (CA certificate, connector) failed.
    #[error("LDAP TLS setup failed: {0}")]
    Tls(String),

    /// Simple bind was rejected.
    #[error("LDAP bind failed for '{bind_dn}': {detail}")]
    BindFailed { bind_dn: String, detail: String },

    /// A search returned an error or a non-success result code.
    #[error("LDAP {kind} search under '{base_dn}' failed: {detail}")]
    SearchFailed {
        kind: String,
        base_dn: String,
        detail: String,
    },

    /// Generic I/O error (e.g. reading a CA file).
    #[error("LDAP I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Resolution errors
// ---------------------------------------------------------------------------

/// Data-integrity faults found while building the identity graph.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// A group exposes a gid value that is not an integer.
    #[error("group '{group}' has non-numeric gid '{value}'")]
    InvalidGid { group: String, value: String },
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

/// Errors from the external key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// HTTP-level transport error (network, TLS, etc.).
    #[error("store HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The API returned a non-success status code.
    #[error("store API error (HTTP {status}) for '{name}': {body}")]
    ApiError {
        name: String,
        status: u16,
        body: String,
    },

    /// Object already exists on create.
    #[error("object '{0}' already exists")]
    AlreadyExists(String),

    /// Object vanished before replace.
    #[error("object '{0}' not found")]
    NotFound(String),

    /// Client setup failed (token or CA file).
    #[error("store client setup failed: {0}")]
    Setup(String),

    /// Generic I/O error.
    #[error("store I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Projection errors
// ---------------------------------------------------------------------------

/// A failure scoped to one projection: its override query, its computation,
/// or its reconciliation.
#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("override query failed: {0}")]
    Directory(#[from] DirectoryError),

    #[error("resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    #[error("encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("reconcile failed: {0}")]
    Store(#[from] StoreError),

    /// The task computing this projection panicked or was cancelled.
    #[error("task aborted: {0}")]
    Aborted(String),
}

/// One projection's failure, labelled with the projection name.
#[derive(Debug, Error)]
#[error("mapper {mapper}: {source}")]
pub struct ProjectionFailure {
    pub mapper: String,
    #[source]
    pub source: ProjectionError,
}

// ---------------------------------------------------------------------------
// Pass errors
// ---------------------------------------------------------------------------

/// Why a synchronization pass is reported as failed.
#[derive(Debug, Error)]
pub enum PassError {
    /// Connect or base fetch failed; no projection ran.
    #[error("directory unavailable: {0}")]
    Directory(#[from] DirectoryError),

    /// The shared identity graph could not be built; no projection ran.
    #[error("data integrity: {0}")]
    DataIntegrity(#[from] ResolveError),

    /// One or more projections failed; the others were still published.
    #[error("{}", join_messages(.0))]
    Projections(Vec<ProjectionFailure>),

    /// Another pass holds the engine.
    #[error("a pass is already running")]
    AlreadyRunning,
}

fn join_messages<E: std::fmt::Display>(errors: &[E]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = ConfigError::MissingAttribute {
            side: "group".into(),
            role: "gid".into(),
        };
        assert_eq!(err.to_string(), "group attribute map is missing key 'gid'");

        let err = ResolveError::InvalidGid {
            group: "staff".into(),
            value: "abc".into(),
        };
        assert_eq!(err.to_string(), "group 'staff' has non-numeric gid 'abc'");

        let err = StoreError::ApiError {
            name: "user-uid-map".into(),
            status: 403,
            body: "forbidden".into(),
        };
        assert!(err.to_string().contains("HTTP 403"));
    }

    #[test]
    fn test_multiple_errors_are_joined() {
        let err = ConfigError::Multiple(vec![
            ConfigError::UnknownProjection {
                name: "bogus".into(),
                field: "mappers.enabled".into(),
            },
            ConfigError::InvalidValue {
                field: "daemon.interval_secs".into(),
                detail: "interval must be > 0".into(),
            },
        ]);
        let msg = err.to_string();
        assert!(msg.contains("unknown mapper 'bogus'"));
        assert!(msg.contains(", invalid configuration value"));
    }

    #[test]
    fn test_pass_error_joins_projection_failures() {
        let err = PassError::Projections(vec![
            ProjectionFailure {
                mapper: "user-uid".into(),
                source: ProjectionError::Store(StoreError::NotFound("user-uid-map".into())),
            },
            ProjectionFailure {
                mapper: "user-gids".into(),
                source: ProjectionError::Resolve(ResolveError::InvalidGid {
                    group: "g".into(),
                    value: "x".into(),
                }),
            },
        ]);
        let msg = err.to_string();
        assert!(msg.starts_with("mapper user-uid: reconcile failed"));
        assert!(msg.contains("mapper user-gids: resolution failed"));
    }
}
