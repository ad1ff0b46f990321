//! LDAP-backed [`Directory`] using the `ldap3` async client.
//!
//! One connection is opened per pass. The `Ldap` handle multiplexes
//! operations over that connection, so concurrent searches clone the handle
//! rather than locking it.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use ldap3::adapters::{Adapter, EntriesOnly, PagedResults};
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, Scope, SearchEntry};
use tracing::{debug, error, warn};

use super::{Directory, DirectoryConnector, RawEntry};
use crate::attr_map::EntryKind;
use crate::config::LdapConfig;
use crate::errors::DirectoryError;

/// Opens [`LdapDirectory`] connections from an [`LdapConfig`].
#[derive(Debug, Clone)]
pub struct LdapConnector {
    config: LdapConfig,
}

impl LdapConnector {
    pub fn new(config: LdapConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DirectoryConnector for LdapConnector {
    async fn connect(&self) -> Result<Arc<dyn Directory>, DirectoryError> {
        let directory = LdapDirectory::connect(&self.config).await?;
        Ok(Arc::new(directory))
    }
}

/// A connected, optionally bound LDAP session.
pub struct LdapDirectory {
    ldap: Ldap,
    page_size: Option<i32>,
}

impl LdapDirectory {
    /// Dial `config.url`, negotiate TLS if requested and bind if a bind DN is
    /// configured.
    pub async fn connect(config: &LdapConfig) -> Result<Self, DirectoryError> {
        debug!(url = %config.url, "connecting to LDAP");

        let mut settings = LdapConnSettings::new()
            .set_starttls(config.tls)
            .set_no_tls_verify(!config.tls_verify);
        if let Some(ca) = config.tls_ca_cert.as_deref().filter(|s| !s.is_empty()) {
            settings = settings.set_connector(tls_connector(ca, config.tls_verify)?);
        }

        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &config.url)
            .await
            .map_err(|e| {
                error!(url = %config.url, error = %e, "error connecting to LDAP URL");
                DirectoryError::ConnectFailed {
                    url: config.url.clone(),
                    detail: e.to_string(),
                }
            })?;

        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "LDAP connection driver error");
            }
        });

        if let (Some(bind_dn), Some(password)) = (
            config.bind_dn.as_deref().filter(|s| !s.is_empty()),
            config.bind_password.as_deref(),
        ) {
            debug!(url = %config.url, bind_dn, "binding to LDAP");
            ldap.simple_bind(bind_dn, password)
                .await
                .and_then(|r| r.success())
                .map_err(|e| {
                    error!(bind_dn, error = %e, "error binding to LDAP");
                    DirectoryError::BindFailed {
                        bind_dn: bind_dn.to_string(),
                        detail: e.to_string(),
                    }
                })?;
        }

        let page_size = config
            .paged_search
            .then(|| i32::try_from(config.paged_search_size).unwrap_or(i32::MAX));

        Ok(Self { ldap, page_size })
    }

    async fn paged_search(
        &self,
        page_size: i32,
        base_dn: &str,
        filter: &str,
        attributes: Vec<String>,
    ) -> Result<Vec<SearchEntry>, ldap3::LdapError> {
        let mut ldap = self.ldap.clone();
        let adapters: Vec<Box<dyn Adapter<_, _>>> = vec![
            Box::new(EntriesOnly::new()),
            Box::new(PagedResults::new(page_size)),
        ];
        let mut stream = ldap
            .streaming_search_with(adapters, base_dn, Scope::Subtree, filter, attributes)
            .await?;
        let mut entries = Vec::new();
        while let Some(entry) = stream.next().await? {
            entries.push(SearchEntry::construct(entry));
        }
        stream.finish().await.success()?;
        Ok(entries)
    }

    async fn plain_search(
        &self,
        base_dn: &str,
        filter: &str,
        attributes: Vec<String>,
    ) -> Result<Vec<SearchEntry>, ldap3::LdapError> {
        let mut ldap = self.ldap.clone();
        let (entries, _) = ldap
            .search(base_dn, Scope::Subtree, filter, attributes)
            .await?
            .success()?;
        Ok(entries.into_iter().map(SearchEntry::construct).collect())
    }
}

#[async_trait]
impl Directory for LdapDirectory {
    async fn search(
        &self,
        kind: EntryKind,
        base_dn: &str,
        filter: &str,
        attributes: &[String],
    ) -> Result<Vec<RawEntry>, DirectoryError> {
        let result = match self.page_size {
            Some(size) => {
                self.paged_search(size, base_dn, filter, attributes.to_vec())
                    .await
            }
            None => self.plain_search(base_dn, filter, attributes.to_vec()).await,
        };
        let entries = result.map_err(|e| {
            error!(kind = %kind, error = %e, "error getting results");
            DirectoryError::SearchFailed {
                kind: kind.to_string(),
                base_dn: base_dn.to_string(),
                detail: e.to_string(),
            }
        })?;
        Ok(entries
            .into_iter()
            .map(|e| RawEntry {
                dn: e.dn,
                attrs: e.attrs,
            })
            .collect())
    }

    async fn close(&self) {
        let mut ldap = self.ldap.clone();
        if let Err(e) = ldap.unbind().await {
            debug!(error = %e, "LDAP unbind failed");
        }
    }
}

/// Build a TLS connector trusting `ca`, which is either an absolute path to a
/// PEM file or the PEM text itself.
fn tls_connector(ca: &str, verify: bool) -> Result<native_tls::TlsConnector, DirectoryError> {
    let pem = if ca.starts_with('/') && Path::new(ca).exists() {
        std::fs::read(ca).map_err(|e| {
            error!(ca_certificate = ca, error = %e, "failed to read CA certificate");
            DirectoryError::IoError(e)
        })?
    } else {
        ca.as_bytes().to_vec()
    };
    let mut builder = native_tls::TlsConnector::builder();
    for cert in pem_certificates(&pem)? {
        builder.add_root_certificate(cert);
    }
    builder
        .danger_accept_invalid_certs(!verify)
        .danger_accept_invalid_hostnames(!verify)
        .build()
        .map_err(|e| DirectoryError::Tls(e.to_string()))
}

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";

/// Every certificate in a PEM bundle. Blocks of other types are skipped.
fn pem_certificates(pem: &[u8]) -> Result<Vec<native_tls::Certificate>, DirectoryError> {
    let text = String::from_utf8_lossy(pem);
    let mut certs = Vec::new();
    let mut rest = text.as_ref();
    while let Some(start) = rest.find(PEM_BEGIN) {
        let Some(len) = rest[start..].find(PEM_END) else {
            return Err(DirectoryError::Tls("unterminated PEM certificate block".into()));
        };
        let end = start + len + PEM_END.len();
        let cert = native_tls::Certificate::from_pem(rest[start..end].as_bytes())
            .map_err(|e| DirectoryError::Tls(e.to_string()))?;
        certs.push(cert);
        rest = &rest[end..];
    }
    if certs.is_empty() {
        return Err(DirectoryError::Tls("no PEM certificate found".into()));
    }
    debug!(count = certs.len(), "loaded CA certificates");
    Ok(certs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_connector_rejects_garbage_pem() {
        let result = tls_connector("not a certificate", true);
        assert!(matches!(result, Err(DirectoryError::Tls(_))));
    }

    const CA_BUNDLE: &str = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/tests/fixtures/ca-bundle.pem"
    ));

    #[test]
    fn test_pem_bundle_keeps_every_certificate() {
        let certs = pem_certificates(CA_BUNDLE.as_bytes()).unwrap();
        assert_eq!(certs.len(), 2);
        assert!(tls_connector(CA_BUNDLE, true).is_ok());
    }

    #[test]
    fn test_pem_bundle_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.pem");
        std::fs::write(&path, CA_BUNDLE).unwrap();
        assert!(tls_connector(path.to_str().unwrap(), true).is_ok());
    }

    #[test]
    fn test_unterminated_pem_block_is_rejected() {
        let truncated = &CA_BUNDLE[..CA_BUNDLE.rfind(PEM_END).unwrap()];
        assert!(matches!(
            pem_certificates(truncated.as_bytes()),
            Err(DirectoryError::Tls(_))
        ));
    }

    #[test]
    fn test_tls_connector_missing_file_falls_back_to_inline() {
        // A path that does not exist is treated as inline PEM text.
        let result = tls_connector("/nonexistent/ca.pem", true);
        assert!(matches!(result, Err(DirectoryError::Tls(_))));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let config = LdapConfig {
            url: "ldap://127.0.0.1:1".into(),
            ..LdapConfig::for_tests()
        };
        let result = LdapDirectory::connect(&config).await;
        assert!(matches!(result, Err(DirectoryError::ConnectFailed { .. })));
    }
}
