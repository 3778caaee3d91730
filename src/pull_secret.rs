//! Registry pull credential stage
//!
//! The credential is a `kubernetes.io/dockerconfigjson` secret holding
//! `{"auths": {"<host>": {"auth": base64("<user>:<pass>")}}}`. The document is
//! deterministic for a given host and login, so an unchanged credential is
//! recognised by comparing bytes, and a changed one replaces the whole object.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use zeroize::Zeroizing;

use crate::cluster::ClusterClient;
use crate::config::RegistryLogin;
use crate::model::validate_dns_label;
use crate::retry::{retry_transient, RetryConfig};
use crate::sensitive::Sensitive;
use crate::{ApplyAction, Error, FIELD_MANAGER, MANAGED_BY_LABEL};

/// Secret type for registry credentials
pub const DOCKER_CONFIG_SECRET_TYPE: &str = "kubernetes.io/dockerconfigjson";
/// Data key holding the docker config document
pub const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";

/// One registry entry in a docker config document
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerAuth {
    /// base64("user:pass")
    pub auth: String,
    /// Optional email; carries no meaning for authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl std::fmt::Debug for DockerAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerAuth")
            .field("auth", &crate::sensitive::REDACTED)
            .field("email", &self.email)
            .finish()
    }
}

/// A docker config document with exactly one registry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Entries keyed by registry host
    pub auths: BTreeMap<String, DockerAuth>,
}

impl DockerConfig {
    /// Build the document for `host` and `login`
    pub fn new(host: &str, login: &RegistryLogin) -> Self {
        let pair = Zeroizing::new(format!("{}:{}", login.username, login.password.expose()));
        Self {
            auths: BTreeMap::from([(
                host.to_string(),
                DockerAuth {
                    auth: STANDARD.encode(pair.as_bytes()),
                    email: login.email.clone(),
                },
            )]),
        }
    }

    /// Serialized JSON document, as stored in the secret's data
    pub fn to_json(&self) -> Result<Zeroizing<Vec<u8>>, Error> {
        serde_json::to_vec(self)
            .map(Zeroizing::new)
            .map_err(|e| Error::serialization(format!("failed to encode docker config: {e}")))
    }

    /// base64 of the JSON document
    pub fn auth_blob(&self) -> Result<Sensitive, Error> {
        Ok(Sensitive::new(STANDARD.encode(self.to_json()?.as_slice())))
    }

    /// Parse a base64 auth blob back into a document
    pub fn from_auth_blob(blob: &str) -> Result<Self, Error> {
        let json = Zeroizing::new(
            STANDARD
                .decode(blob)
                .map_err(|e| Error::serialization(format!("auth blob is not base64: {e}")))?,
        );
        serde_json::from_slice(&json)
            .map_err(|e| Error::serialization(format!("auth blob is not a docker config: {e}")))
    }
}

/// Result of ensuring a pull secret; carries no credential material
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnsuredPullSecret {
    /// Secret name
    pub name: String,
    /// Namespace holding the secret
    pub namespace: String,
    /// Registry host the secret authenticates to
    pub registry_host: String,
    /// What had to be done
    pub action: ApplyAction,
}

/// Builds registry pull credentials and installs them in a namespace
#[derive(Clone, Debug, Default)]
pub struct PullSecretAssembler {
    retry: RetryConfig,
}

impl PullSecretAssembler {
    /// Create an assembler that retries transient read failures with `retry`
    pub fn new(retry: RetryConfig) -> Self {
        Self { retry }
    }

    /// Build the secret object for a docker config document
    pub fn build(namespace: &str, name: &str, config: &DockerConfig) -> Result<Secret, Error> {
        Ok(Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    MANAGED_BY_LABEL.to_string(),
                    FIELD_MANAGER.to_string(),
                )])),
                ..Default::default()
            },
            type_: Some(DOCKER_CONFIG_SECRET_TYPE.to_string()),
            data: Some(BTreeMap::from([(
                DOCKER_CONFIG_KEY.to_string(),
                ByteString(config.to_json()?.to_vec()),
            )])),
            ..Default::default()
        })
    }

    /// Create the pull secret, replace it if its payload differs, or leave it
    #[instrument(skip(self, client, login, cancel))]
    pub async fn ensure(
        &self,
        client: &ClusterClient,
        namespace: &str,
        name: &str,
        host: &str,
        login: &RegistryLogin,
        cancel: &CancellationToken,
    ) -> Result<EnsuredPullSecret, Error> {
        validate_dns_label(name, "pull secret name")?;
        if host.trim().is_empty() {
            return Err(Error::validation("registry host must not be empty"));
        }
        if login.username.is_empty() || login.password.is_empty() {
            return Err(Error::config("registry username and password are required"));
        }

        let desired = Self::build(namespace, name, &DockerConfig::new(host, login))?;
        let api = client.api();

        let existing = retry_transient(&self.retry, cancel, "get_secret", || {
            api.get_secret(namespace, name)
        })
        .await?;

        let action = match existing {
            None => {
                api.create_secret(namespace, &desired).await?;
                info!(secret = %name, "Created pull secret");
                ApplyAction::Created
            }
            Some(existing) if same_payload(&existing, &desired) => {
                debug!(secret = %name, "Pull secret up to date");
                ApplyAction::Unchanged
            }
            Some(existing) => {
                let mut replacement = desired;
                replacement.metadata.resource_version = existing.metadata.resource_version;
                api.replace_secret(namespace, &replacement).await?;
                info!(secret = %name, "Replaced pull secret with new credentials");
                ApplyAction::Updated
            }
        };

        Ok(EnsuredPullSecret {
            name: name.to_string(),
            namespace: namespace.to_string(),
            registry_host: host.to_string(),
            action,
        })
    }
}

fn same_payload(existing: &Secret, desired: &Secret) -> bool {
    existing.type_ == desired.type_ && existing.data == desired.data
}
