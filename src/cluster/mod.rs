//! Authenticated access to the provisioned cluster
//!
//! Provisioning hands a [`ConnectionMaterial`] to a [`ClientFactory`], which
//! moves it into a [`ClusterClient`]. The client is cheap to clone and is the
//! only thing shared between concurrently deployed apps.

mod api;
mod material;

pub use api::{ClusterApi, KubeClusterApi};
pub use material::ConnectionMaterial;

#[cfg(test)]
pub use api::MockClusterApi;
#[cfg(test)]
pub(crate) use material::tests::sample_material;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{info, instrument};

use crate::Error;

/// Shared handle to a cluster's control-plane API
#[derive(Clone)]
pub struct ClusterClient {
    api: Arc<dyn ClusterApi>,
}

impl ClusterClient {
    /// Wrap a control-plane API implementation
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { api }
    }

    /// The control-plane API
    pub fn api(&self) -> &dyn ClusterApi {
        self.api.as_ref()
    }
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient").finish_non_exhaustive()
    }
}

/// Builds cluster clients from connection material
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Consume connection material and return a client bound to its API host
    ///
    /// Fails with [`Error::InvalidCredentials`] if the material does not decode
    /// or the API host cannot be reached within the connect timeout.
    async fn connect(&self, material: ConnectionMaterial) -> Result<ClusterClient, Error>;
}

/// [`ClientFactory`] producing kube-rs backed clients
#[derive(Clone, Debug)]
pub struct KubeClientFactory {
    connect_timeout: Duration,
}

impl KubeClientFactory {
    /// Create a factory with the given reachability timeout
    pub fn new(connect_timeout: Duration) -> Self {
        // Ignored if the binary already installed a provider
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        Self { connect_timeout }
    }
}

#[async_trait]
impl ClientFactory for KubeClientFactory {
    #[instrument(skip_all)]
    async fn connect(&self, material: ConnectionMaterial) -> Result<ClusterClient, Error> {
        let yaml = material.to_kubeconfig_yaml()?;
        drop(material);

        let kubeconfig = Kubeconfig::from_yaml(&yaml)
            .map_err(|e| Error::invalid_credentials(format!("kubeconfig rejected: {e}")))?;
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::invalid_credentials(format!("kubeconfig rejected: {e}")))?;
        config.connect_timeout = Some(self.connect_timeout);

        let server = config.cluster_url.to_string();
        let client = Client::try_from(config)
            .map_err(|e| Error::invalid_credentials(format!("failed to build client: {e}")))?;

        let version = tokio::time::timeout(self.connect_timeout, client.apiserver_version())
            .await
            .map_err(|_| {
                Error::invalid_credentials(format!(
                    "API host {server} unreachable within {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|e| {
                Error::invalid_credentials(format!("API host {server} rejected the client: {e}"))
            })?;

        info!(server = %server, version = %version.git_version, "Connected to cluster");
        Ok(ClusterClient::new(Arc::new(KubeClusterApi::new(client))))
    }
}
