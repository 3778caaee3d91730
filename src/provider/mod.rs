//! Cloud provisioning API abstraction
//!
//! [`CloudApi`] is the seam between the provisioners and the cloud. The
//! production implementation is [`AzureCloud`], which talks to the Azure
//! Resource Manager REST API; tests use the generated `MockCloudApi` or an
//! in-memory fake.
//!
//! Mutating calls start long-running operations and return as soon as the
//! cloud has accepted them. Callers observe completion by polling
//! [`CloudApi::get_cluster_status`] or [`CloudApi::get_registry`].

mod azure;

pub use azure::{AzureCloud, AzureEndpoints};

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::cluster::ConnectionMaterial;
use crate::model::{ManagedClusterSpec, NodePool, RegistrySku, RegistrySpec, ResourceGroup};
use crate::sensitive::Sensitive;
use crate::Error;

/// Provisioning state of a cloud resource as reported by the cloud
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProvisioningState {
    /// Resource is ready
    Succeeded,
    /// Initial creation in progress
    Creating,
    /// Update in progress
    Updating,
    /// Deletion in progress
    Deleting,
    /// The last operation failed, with the cloud-reported reason
    Failed(String),
    /// The last operation was cancelled on the cloud side
    Canceled,
    /// Any other transitional state (e.g. "Scaling", "Upgrading")
    Other(String),
}

impl ProvisioningState {
    /// Parse a cloud provisioning state string
    pub fn parse(state: &str, failure_reason: Option<String>) -> Self {
        match state {
            "Succeeded" => Self::Succeeded,
            "Creating" => Self::Creating,
            "Updating" => Self::Updating,
            "Deleting" => Self::Deleting,
            "Canceled" => Self::Canceled,
            "Failed" => Self::Failed(
                failure_reason.unwrap_or_else(|| "cloud reported provisioning state Failed".into()),
            ),
            other => Self::Other(other.to_string()),
        }
    }

    /// True if the last operation finished, successfully or not
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_) | Self::Canceled)
    }
}

impl std::fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Creating => write!(f, "Creating"),
            Self::Updating => write!(f, "Updating"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Failed(_) => write!(f, "Failed"),
            Self::Canceled => write!(f, "Canceled"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

/// A managed cluster as it currently exists in the cloud
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedCluster {
    /// Current provisioning state
    pub provisioning_state: ProvisioningState,
    /// The default node pool, if the cloud reported one
    pub node_pool: Option<NodePool>,
    /// API server FQDN once assigned
    pub fqdn: Option<String>,
}

/// A container registry as it currently exists in the cloud
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedRegistry {
    /// Current provisioning state
    pub provisioning_state: ProvisioningState,
    /// Host name used to push and pull images
    pub login_server: String,
    /// Pricing tier
    pub sku: RegistrySku,
    /// Whether admin credentials are enabled
    pub admin_enabled: bool,
}

/// Admin login for a provisioned registry
#[derive(Clone, Debug)]
pub struct RegistryCredentials {
    /// Host name used to push and pull images
    pub login_server: String,
    /// Admin username
    pub username: String,
    /// Admin password
    pub password: Sensitive,
}

/// Cloud provisioning operations
///
/// Reads of missing resources return `Ok(None)` rather than an error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Read a resource group
    async fn get_resource_group(&self, name: &str) -> Result<Option<ResourceGroup>, Error>;

    /// Create a resource group, or leave an existing one as is
    async fn create_or_update_resource_group(&self, group: &ResourceGroup) -> Result<(), Error>;

    /// Start deleting a resource group and everything in it
    async fn delete_resource_group(&self, name: &str) -> Result<(), Error>;

    /// Compute SKUs offered in a region
    async fn list_vm_sizes(&self, region: &str) -> Result<Vec<String>, Error>;

    /// Read a managed cluster
    async fn get_cluster(&self, group: &str, name: &str) -> Result<Option<ObservedCluster>, Error>;

    /// Start creating or updating a managed cluster
    async fn create_or_update_cluster(
        &self,
        group: &ResourceGroup,
        spec: &ManagedClusterSpec,
    ) -> Result<(), Error>;

    /// Current provisioning state of a managed cluster
    async fn get_cluster_status(&self, group: &str, name: &str) -> Result<ProvisioningState, Error>;

    /// Admin connection material of a ready cluster
    async fn get_cluster_credentials(
        &self,
        group: &str,
        name: &str,
    ) -> Result<ConnectionMaterial, Error>;

    /// Read a container registry
    async fn get_registry(&self, group: &str, name: &str)
        -> Result<Option<ObservedRegistry>, Error>;

    /// Start creating or updating a container registry
    async fn create_or_update_registry(
        &self,
        group: &ResourceGroup,
        spec: &RegistrySpec,
    ) -> Result<(), Error>;

    /// Admin credentials of a registry with admin enabled
    async fn get_registry_credentials(
        &self,
        group: &str,
        name: &str,
    ) -> Result<RegistryCredentials, Error>;
}
