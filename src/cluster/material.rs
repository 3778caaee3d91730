//! Cluster connection material
//!
//! [`ConnectionMaterial`] is the capability produced by cluster provisioning and
//! consumed exactly once by the client factory. It is not `Clone`, and its
//! `Debug` output is fully redacted so it can never end up in logs.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use zeroize::Zeroizing;

use crate::sensitive::{Sensitive, REDACTED};
use crate::Error;

/// Terraform resource type of a managed cluster
const TERRAFORM_CLUSTER_TYPE: &str = "azurerm_kubernetes_cluster";

/// API endpoint plus base64-encoded PEM certificates and key
pub struct ConnectionMaterial {
    api_host: String,
    client_cert: String,
    client_key: Sensitive,
    ca_cert: String,
}

impl ConnectionMaterial {
    /// Create connection material from an API host and base64-encoded PEM blocks
    pub fn new(
        api_host: impl Into<String>,
        client_cert: impl Into<String>,
        client_key: impl Into<Sensitive>,
        ca_cert: impl Into<String>,
    ) -> Self {
        Self {
            api_host: api_host.into(),
            client_cert: client_cert.into(),
            client_key: client_key.into(),
            ca_cert: ca_cert.into(),
        }
    }

    /// API server URL, with `https://` added when the host has no scheme
    pub fn server_url(&self) -> String {
        if self.api_host.contains("://") {
            self.api_host.clone()
        } else {
            format!("https://{}", self.api_host)
        }
    }

    /// True if every field is non-empty
    pub fn is_complete(&self) -> bool {
        !self.api_host.is_empty()
            && !self.client_cert.is_empty()
            && !self.client_key.is_empty()
            && !self.ca_cert.is_empty()
    }

    /// Check that the host is set and every certificate and key decodes to PEM
    pub(crate) fn decode(&self) -> Result<(), Error> {
        if self.api_host.trim().is_empty() {
            return Err(Error::invalid_credentials("API host is empty"));
        }

        decode_pem("client certificate", &self.client_cert)?;
        decode_pem("client key", self.client_key.expose())?;
        decode_pem("CA certificate", &self.ca_cert)?;
        Ok(())
    }

    /// Render a single-context kubeconfig document for this material
    ///
    /// Fails with `InvalidCredentials` if any field does not decode, so a
    /// rendered document always carries usable PEM data.
    pub(crate) fn to_kubeconfig_yaml(&self) -> Result<Zeroizing<String>, Error> {
        self.decode()?;

        let doc = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [{
                "name": "kubebox",
                "cluster": {
                    "server": self.server_url(),
                    "certificate-authority-data": self.ca_cert.trim(),
                }
            }],
            "users": [{
                "name": "kubebox-admin",
                "user": {
                    "client-certificate-data": self.client_cert.trim(),
                    "client-key-data": self.client_key.expose().trim(),
                }
            }],
            "contexts": [{
                "name": "kubebox",
                "context": { "cluster": "kubebox", "user": "kubebox-admin" }
            }],
            "current-context": "kubebox",
        });

        serde_yaml::to_string(&doc)
            .map(Zeroizing::new)
            .map_err(|e| Error::serialization(format!("failed to render kubeconfig: {e}")))
    }

    /// Extract connection material from a kubeconfig document
    ///
    /// Uses the current context when set, otherwise the first cluster and user.
    /// Only embedded (`*-data`) certificates and keys are supported.
    pub fn from_kubeconfig_yaml(yaml: &str) -> Result<Self, Error> {
        let doc: serde_yaml::Value = serde_yaml::from_str(yaml)
            .map_err(|e| Error::invalid_credentials(format!("kubeconfig is not valid YAML: {e}")))?;

        let context = doc
            .get("current-context")
            .and_then(|c| c.as_str())
            .and_then(|current| find_named(&doc, "contexts", current))
            .and_then(|entry| entry.get("context"));
        let cluster_name = context.and_then(|c| c.get("cluster")).and_then(|v| v.as_str());
        let user_name = context.and_then(|c| c.get("user")).and_then(|v| v.as_str());

        let cluster = named_or_first(&doc, "clusters", cluster_name)
            .and_then(|entry| entry.get("cluster"))
            .ok_or_else(|| Error::invalid_credentials("kubeconfig has no cluster entry"))?;
        let user = named_or_first(&doc, "users", user_name)
            .and_then(|entry| entry.get("user"))
            .ok_or_else(|| Error::invalid_credentials("kubeconfig has no user entry"))?;

        let field = |value: &serde_yaml::Value, key: &str| {
            value
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| Error::invalid_credentials(format!("kubeconfig is missing '{key}'")))
        };

        Ok(Self {
            api_host: field(cluster, "server")?,
            ca_cert: field(cluster, "certificate-authority-data")?,
            client_cert: field(user, "client-certificate-data")?,
            client_key: Sensitive::new(field(user, "client-key-data")?),
        })
    }

    /// Extract connection material from a Terraform state document
    ///
    /// Reads the first managed cluster resource. Its structured admin config is
    /// preferred, then the user config, then the raw kubeconfig attributes.
    pub fn from_terraform_state(json: &str) -> Result<Self, Error> {
        let state: serde_json::Value = serde_json::from_str(json).map_err(|e| {
            Error::invalid_credentials(format!("terraform state is not valid JSON: {e}"))
        })?;

        let attributes = state
            .get("resources")
            .and_then(|r| r.as_array())
            .into_iter()
            .flatten()
            .filter(|r| r.get("type").and_then(|t| t.as_str()) == Some(TERRAFORM_CLUSTER_TYPE))
            .filter_map(|r| r.pointer("/instances/0/attributes"))
            .next()
            .ok_or_else(|| {
                Error::invalid_credentials(format!(
                    "terraform state has no {TERRAFORM_CLUSTER_TYPE} resource"
                ))
            })?;

        for block in ["kube_admin_config", "kube_config"] {
            if let Some(config) = attributes.pointer(&format!("/{block}/0")) {
                let field = |key: &str| {
                    config
                        .get(key)
                        .and_then(|v| v.as_str())
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                };
                if let (Some(host), Some(cert), Some(key), Some(ca)) = (
                    field("host"),
                    field("client_certificate"),
                    field("client_key"),
                    field("cluster_ca_certificate"),
                ) {
                    return Ok(Self::new(host, cert, key, ca));
                }
            }
        }

        for raw in ["kube_admin_config_raw", "kube_config_raw"] {
            if let Some(yaml) = attributes
                .get(raw)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
            {
                return Self::from_kubeconfig_yaml(yaml);
            }
        }

        Err(Error::invalid_credentials(
            "terraform state cluster has no kube config attributes",
        ))
    }
}

impl fmt::Debug for ConnectionMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionMaterial({REDACTED})")
    }
}

fn decode_pem(what: &str, encoded: &str) -> Result<Zeroizing<Vec<u8>>, Error> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(Error::invalid_credentials(format!("{what} is empty")));
    }

    let bytes = Zeroizing::new(
        STANDARD
            .decode(compact.as_bytes())
            .map_err(|_| Error::invalid_credentials(format!("{what} is not valid base64")))?,
    );

    if !bytes.starts_with(b"-----BEGIN") {
        return Err(Error::invalid_credentials(format!(
            "{what} does not decode to a PEM block"
        )));
    }

    Ok(bytes)
}

fn find_named<'a>(doc: &'a serde_yaml::Value, list: &str, name: &str) -> Option<&'a serde_yaml::Value> {
    doc.get(list)?
        .as_sequence()?
        .iter()
        .find(|entry| entry.get("name").and_then(|n| n.as_str()) == Some(name))
}

fn named_or_first<'a>(
    doc: &'a serde_yaml::Value,
    list: &str,
    name: Option<&str>,
) -> Option<&'a serde_yaml::Value> {
    match name {
        Some(name) => find_named(doc, list, name),
        None => doc.get(list)?.as_sequence()?.first(),
    }
}
