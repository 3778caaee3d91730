//! Pipeline configuration
//!
//! A pipeline is one YAML document describing the resource group, cluster,
//! optional registry and the apps to deploy, plus timeouts. Credentials never
//! live in this file; they come from the environment (see [`credentials`]).
//!
//! ```yaml
//! resourceGroup: { name: rg-demo, region: eastus }
//! cluster:
//!   name: c1
//!   nodePool: { sizeClass: Standard_D2_v2, nodeCount: 2 }
//! registry: { name: demoregistry01 }
//! apps:
//!   - namespace: myapp
//!     pullSecret: { name: acr-secret }
//!     workload: { ... }
//!     service: { ... }
//! ```

pub mod credentials;

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use credentials::{AzureCredentials, RegistryLogin};

use crate::model::{
    validate_dns_label, ManagedClusterSpec, RegistrySpec, ResourceGroup, ServiceSpec, WorkloadSpec,
};
use crate::retry::RetryConfig;
use crate::wait::{duration_secs, PollConfig};
use crate::Error;

/// Where a pull secret's registry credentials come from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullSecretSpec {
    /// Secret name in the app's namespace
    pub name: String,
    /// Registry host for explicit credentials (REGISTRY_USERNAME/REGISTRY_PASSWORD).
    /// When unset the provisioned registry's login server and admin
    /// credentials are used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_host: Option<String>,
}

/// One deployable unit: a namespace with its pull secret, workload and service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    /// Target namespace
    pub namespace: String,
    /// Registry pull credential installed in the namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secret: Option<PullSecretSpec>,
    /// Replicated workload
    pub workload: WorkloadSpec,
    /// Service in front of the workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceSpec>,
    /// Wait for the workload's pods to become ready
    #[serde(default = "default_true")]
    pub wait_for_ready: bool,
    /// Wait for the service's external address
    #[serde(default = "default_true")]
    pub wait_for_external_address: bool,
}

fn default_true() -> bool {
    true
}

impl AppSpec {
    /// Validate the app and the consistency between its parts
    pub fn validate(&self, registry: Option<&RegistrySpec>) -> Result<(), Error> {
        validate_dns_label(&self.namespace, "namespace")?;
        self.workload.validate()?;

        if let Some(secret) = &self.pull_secret {
            validate_dns_label(&secret.name, "pull secret name")?;
            match &secret.registry_host {
                Some(host) if host.trim().is_empty() => {
                    return Err(Error::validation(format!(
                        "app '{}': pull secret registryHost must not be empty",
                        self.namespace
                    )));
                }
                None => match registry {
                    None => {
                        return Err(Error::validation(format!(
                            "app '{}': pull secret '{}' has no registryHost and no registry is provisioned",
                            self.namespace, secret.name
                        )));
                    }
                    Some(registry) if !registry.admin_enabled => {
                        return Err(Error::validation(format!(
                            "app '{}': pull secret '{}' needs admin credentials, but registry '{}' has adminEnabled: false; enable it or set registryHost",
                            self.namespace, secret.name, registry.name
                        )));
                    }
                    Some(_) => {}
                },
                _ => {}
            }
        }

        if let Some(secret_ref) = &self.workload.pod_template.pull_secret_ref {
            let declared = self.pull_secret.as_ref().map(|s| s.name.as_str());
            if declared != Some(secret_ref.as_str()) {
                return Err(Error::validation(format!(
                    "workload '{}' references pull secret '{}' which app '{}' does not declare",
                    self.workload.name, secret_ref, self.namespace
                )));
            }
        }

        if let Some(service) = &self.service {
            service.validate()?;
            if !service.selects(&self.workload.pod_template.labels) {
                return Err(Error::validation(format!(
                    "service '{}' selector {:?} does not match pods of workload '{}'",
                    service.name, service.selector_labels, self.workload.name
                )));
            }
        }

        Ok(())
    }
}

/// Poll deadlines and retry bounds
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Timeouts {
    /// Cluster provisioning
    pub cluster: PollConfig,
    /// Registry provisioning
    pub registry: PollConfig,
    /// Workload readiness
    pub readiness: PollConfig,
    /// Service external address assignment
    pub external_address: PollConfig,
    /// Resource group deletion during teardown
    pub teardown: PollConfig,
    /// Cluster API reachability check
    #[serde(with = "duration_secs")]
    pub connect: Duration,
    /// Maximum attempts for transient failures of a single remote read
    pub retry_attempts: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            cluster: PollConfig::new(Duration::from_secs(30 * 60), Duration::from_secs(15)),
            registry: PollConfig::new(Duration::from_secs(10 * 60), Duration::from_secs(5)),
            readiness: PollConfig::new(Duration::from_secs(5 * 60), Duration::from_secs(5)),
            external_address: PollConfig::new(Duration::from_secs(30), Duration::from_secs(2)),
            teardown: PollConfig::new(Duration::from_secs(30 * 60), Duration::from_secs(15)),
            connect: Duration::from_secs(10),
            retry_attempts: 5,
        }
    }
}

impl Timeouts {
    /// Retry config for remote reads inside poll loops
    pub fn retry(&self) -> RetryConfig {
        RetryConfig::with_max_attempts(self.retry_attempts)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.retry_attempts == 0 {
            return Err(Error::validation("timeouts.retryAttempts must be at least 1"));
        }
        if self.connect.is_zero() {
            return Err(Error::validation("timeouts.connect must be at least 1 second"));
        }
        Ok(())
    }
}

/// Full pipeline definition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Resource group holding the cluster and registry
    pub resource_group: ResourceGroup,
    /// Managed cluster
    pub cluster: ManagedClusterSpec,
    /// Optional container registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistrySpec>,
    /// Apps deployed onto the cluster
    #[serde(default)]
    pub apps: Vec<AppSpec>,
    /// Deadlines and retry bounds
    #[serde(default)]
    pub timeouts: Timeouts,
}

impl PipelineConfig {
    /// Parse and validate a pipeline definition
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::config(format!("invalid pipeline config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a pipeline definition file
    pub async fn load(path: &Path) -> Result<Self, Error> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_yaml(&content)
    }

    /// Validate every part of the pipeline without any remote call
    pub fn validate(&self) -> Result<(), Error> {
        self.resource_group.validate()?;
        self.cluster.validate()?;
        if let Some(registry) = &self.registry {
            registry.validate()?;
        }
        self.timeouts.validate()?;

        let mut namespaces = BTreeSet::new();
        for app in &self.apps {
            app.validate(self.registry.as_ref())?;
            if !namespaces.insert(app.namespace.as_str()) {
                return Err(Error::validation(format!(
                    "namespace '{}' is used by more than one app",
                    app.namespace
                )));
            }
        }

        Ok(())
    }

    /// True if any app pulls with explicit registry credentials
    pub fn needs_registry_login(&self) -> bool {
        self.apps
            .iter()
            .filter_map(|a| a.pull_secret.as_ref())
            .any(|s| s.registry_host.is_some())
    }
}
