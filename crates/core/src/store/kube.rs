//! Kubernetes ConfigMap store over the core REST API.
//!
//! Talks to `/api/v1/namespaces/{ns}/configmaps` with `reqwest`. In-cluster
//! the bearer token and cluster CA come from the service-account mount; the
//! token is re-read on every request so projected tokens can rotate.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::{ConfigStore, StoredObject};
use crate::config::StoreConfig;
use crate::errors::StoreError;

/// `v1/ConfigMap` as sent to and received from the API server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMap {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ConfigMap {
    pub fn new(namespace: &str, name: &str, data: &BTreeMap<String, String>) -> Self {
        Self {
            api_version: "v1".into(),
            kind: "ConfigMap".into(),
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: Some(namespace.to_string()),
            },
            data: data.clone(),
        }
    }

    /// Size in bytes of the JSON document.
    pub fn encoded_len(&self) -> Result<usize, serde_json::Error> {
        serde_json::to_vec(self).map(|v| v.len())
    }
}

#[derive(Debug, Clone)]
enum Token {
    None,
    Static(String),
    File(PathBuf),
}

/// ConfigMap store scoped to one namespace.
#[derive(Debug, Clone)]
pub struct KubeConfigMapStore {
    http: reqwest::Client,
    api_url: String,
    namespace: String,
    token: Token,
}

impl KubeConfigMapStore {
    /// Build a client from config. A missing token file means requests are
    /// unauthenticated; a missing CA file means system roots are used.
    pub fn from_config(config: &StoreConfig) -> Result<Self, StoreError> {
        let ca_pem = match &config.ca_file {
            Some(path) if path.exists() => Some(std::fs::read(path)?),
            Some(path) => {
                warn!(path = %path.display(), "CA file not found, using system roots");
                None
            }
            None => None,
        };
        let token = match &config.token_file {
            Some(path) if path.exists() => Token::File(path.clone()),
            Some(path) => {
                warn!(path = %path.display(), "token file not found, requests are unauthenticated");
                Token::None
            }
            None => Token::None,
        };
        Self::build(&config.api_url, &config.namespace, token, ca_pem.as_deref())
    }

    /// Client with a fixed bearer token.
    pub fn with_token(
        api_url: &str,
        namespace: &str,
        token: impl Into<String>,
        ca_pem: Option<&[u8]>,
    ) -> Result<Self, StoreError> {
        Self::build(api_url, namespace, Token::Static(token.into()), ca_pem)
    }

    fn build(
        api_url: &str,
        namespace: &str,
        token: Token,
        ca_pem: Option<&[u8]>,
    ) -> Result<Self, StoreError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("ldap-configmap/", env!("CARGO_PKG_VERSION"))),
        );
        let mut builder = reqwest::Client::builder().default_headers(headers);
        if let Some(pem) = ca_pem {
            for cert in root_certificates(pem)? {
                builder = builder.add_root_certificate(cert);
            }
        }
        let http = builder.build()?;
        let api_url = api_url.trim_end_matches('/').to_string();
        info!(api_url = %api_url, namespace, "created ConfigMap store");
        Ok(Self {
            http,
            api_url,
            namespace: namespace.to_string(),
            token,
        })
    }

    fn collection_url(&self) -> String {
        format!(
            "{}/api/v1/namespaces/{}/configmaps",
            self.api_url, self.namespace
        )
    }

    fn object_url(&self, name: &str) -> String {
        format!("{}/{}", self.collection_url(), name)
    }

    fn bearer(&self) -> Result<Option<String>, StoreError> {
        match &self.token {
            Token::None => Ok(None),
            Token::Static(token) => Ok(Some(token.clone())),
            Token::File(path) => read_token(path).map(Some),
        }
    }

    fn request(
        &self,
        method: reqwest::Method,
        url: &str,
    ) -> Result<reqwest::RequestBuilder, StoreError> {
        let req = self.http.request(method, url);
        Ok(match self.bearer()? {
            Some(token) => req.bearer_auth(token),
            None => req,
        })
    }

    async fn check_response(
        name: &str,
        resp: reqwest::Response,
    ) -> Result<reqwest::Response, StoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => StoreError::NotFound(name.to_string()),
            StatusCode::CONFLICT => StoreError::AlreadyExists(name.to_string()),
            _ => StoreError::ApiError {
                name: name.to_string(),
                status: status.as_u16(),
                body,
            },
        })
    }
}

fn read_token(path: &Path) -> Result<String, StoreError> {
    let token = std::fs::read_to_string(path)?;
    let token = token.trim();
    if token.is_empty() {
        return Err(StoreError::Setup(format!(
            "token file {} is empty",
            path.display()
        )));
    }
    Ok(token.to_string())
}

/// Every certificate in a PEM bundle, so intermediate and rotated CAs are all
/// trusted.
fn root_certificates(pem: &[u8]) -> Result<Vec<reqwest::Certificate>, StoreError> {
    let certs = reqwest::Certificate::from_pem_bundle(pem)?;
    if certs.is_empty() {
        return Err(StoreError::Setup("CA file holds no PEM certificate".into()));
    }
    debug!(count = certs.len(), "loaded cluster CA certificates");
    Ok(certs)
}

#[async_trait]
impl ConfigStore for KubeConfigMapStore {
    #[instrument(skip(self))]
    async fn get_object(&self, name: &str) -> Result<Option<StoredObject>, StoreError> {
        let resp = self
            .request(reqwest::Method::GET, &self.object_url(name))?
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            debug!(name, "ConfigMap not found");
            return Ok(None);
        }
        let resp = Self::check_response(name, resp).await?;
        let cm: ConfigMap = resp.json().await?;
        Ok(Some(StoredObject {
            name: cm.metadata.name,
            data: cm.data,
        }))
    }

    #[instrument(skip(self, data), fields(keys = data.len()))]
    async fn create_object(
        &self,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let body = ConfigMap::new(&self.namespace, name, data);
        let resp = self
            .request(reqwest::Method::POST, &self.collection_url())?
            .json(&body)
            .send()
            .await?;
        Self::check_response(name, resp).await?;
        Ok(())
    }

    #[instrument(skip(self, data), fields(keys = data.len()))]
    async fn replace_object(
        &self,
        name: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let body = ConfigMap::new(&self.namespace, name, data);
        let resp = self
            .request(reqwest::Method::PUT, &self.object_url(name))?
            .json(&body)
            .send()
            .await?;
        Self::check_response(name, resp).await?;
        Ok(())
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_map_json_shape() {
        let data = BTreeMap::from([("alice".to_string(), "1000".to_string())]);
        let cm = ConfigMap::new("ldap", "user-uid-map", &data);
        let json = serde_json::to_value(&cm).unwrap();
        assert_eq!(json["apiVersion"], "v1");
        assert_eq!(json["kind"], "ConfigMap");
        assert_eq!(json["metadata"]["name"], "user-uid-map");
        assert_eq!(json["metadata"]["namespace"], "ldap");
        assert_eq!(json["data"]["alice"], "1000");
        assert_eq!(
            cm.encoded_len().unwrap(),
            serde_json::to_string(&cm).unwrap().len()
        );
    }

    #[test]
    fn test_config_map_without_data_parses() {
        let cm: ConfigMap = serde_json::from_str(
            r#"{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"x","resourceVersion":"7"}}"#,
        )
        .unwrap();
        assert!(cm.data.is_empty());
        assert_eq!(cm.metadata.name, "x");
    }

    #[test]
    fn test_urls() {
        let store =
            KubeConfigMapStore::with_token("https://k8s.example.com/", "ldap", "t", None).unwrap();
        assert_eq!(
            store.object_url("user-uid-map"),
            "https://k8s.example.com/api/v1/namespaces/ldap/configmaps/user-uid-map"
        );
        assert_eq!(store.namespace(), "ldap");
    }

    #[test]
    fn test_token_file_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "abc123\n").unwrap();
        assert_eq!(read_token(&path).unwrap(), "abc123");

        std::fs::write(&path, "  \n").unwrap();
        assert!(matches!(read_token(&path), Err(StoreError::Setup(_))));
    }

    #[test]
    fn test_ca_bundle_keeps_every_certificate() {
        let bundle = include_bytes!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tests/fixtures/ca-bundle.pem"
        ));
        assert_eq!(root_certificates(bundle).unwrap().len(), 2);
        assert!(root_certificates(b"no certificates here").is_err());

        let dir = tempfile::tempdir().unwrap();
        let ca_file = dir.path().join("ca.crt");
        std::fs::write(&ca_file, bundle).unwrap();
        let config = StoreConfig {
            namespace: "ldap".into(),
            api_url: "https://127.0.0.1:6443".into(),
            token_file: None,
            ca_file: Some(ca_file),
        };
        assert!(KubeConfigMapStore::from_config(&config).is_ok());
    }

    #[test]
    fn test_from_config_tolerates_missing_files() {
        let config = StoreConfig {
            namespace: "ldap".into(),
            api_url: "https://127.0.0.1:6443".into(),
            token_file: Some("/nonexistent/token".into()),
            ca_file: Some("/nonexistent/ca.crt".into()),
        };
        let store = KubeConfigMapStore::from_config(&config).unwrap();
        assert!(matches!(store.token, Token::None));
    }
}
