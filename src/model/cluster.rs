//! Cloud-side desired state: resource group, managed cluster, registry

use serde::{Deserialize, Serialize};

use crate::Error;

/// Container for the cluster and registry; immutable once created
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroup {
    /// Resource group name
    pub name: String,
    /// Cloud region (e.g. "eastus")
    pub region: String,
}

impl ResourceGroup {
    /// Validate name and region
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() || self.name.len() > 90 {
            return Err(Error::validation(format!(
                "resource group name '{}' must be between 1 and 90 characters",
                self.name
            )));
        }
        let valid = self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '(' | ')'));
        if !valid || self.name.ends_with('.') {
            return Err(Error::validation(format!(
                "resource group name '{}' contains invalid characters",
                self.name
            )));
        }
        validate_region(&self.region)
    }
}

/// How the cluster authenticates to other cloud services
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityMode {
    /// Cloud-managed identity created with the cluster
    #[default]
    SystemAssigned,
    /// No managed identity
    None,
}

impl IdentityMode {
    /// Wire value used by the cloud API
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityMode::SystemAssigned => "SystemAssigned",
            IdentityMode::None => "None",
        }
    }
}

/// The cluster's default node pool
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePool {
    /// Pool name (lowercase alphanumeric, at most 12 characters)
    #[serde(default = "default_pool_name")]
    pub name: String,
    /// Compute SKU for the nodes (e.g. "Standard_D2_v2")
    pub size_class: String,
    /// Number of nodes
    pub node_count: u32,
}

fn default_pool_name() -> String {
    "default".to_string()
}

/// Desired managed Kubernetes cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    /// Cluster name
    pub name: String,
    /// Region; defaults to the resource group's region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Default node pool
    pub node_pool: NodePool,
    /// Identity mode
    #[serde(default)]
    pub identity_mode: IdentityMode,
    /// DNS prefix for the API server; defaults to the cluster name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_prefix: Option<String>,
    /// Kubernetes version; the cloud's default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
}

impl ManagedClusterSpec {
    /// Effective region for this cluster
    pub fn region<'a>(&'a self, group: &'a ResourceGroup) -> &'a str {
        self.region.as_deref().unwrap_or(&group.region)
    }

    /// Effective DNS prefix for the API server
    pub fn dns_prefix(&self) -> &str {
        self.dns_prefix.as_deref().unwrap_or(&self.name)
    }

    /// Validate everything that can be checked without calling the cloud
    ///
    /// Whether `size_class` is offered in the region needs a remote read and
    /// is checked by the provisioner.
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() || self.name.len() > 63 {
            return Err(Error::validation(format!(
                "cluster name '{}' must be between 1 and 63 characters",
                self.name
            )));
        }
        let valid = self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid || !self.name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return Err(Error::validation(format!(
                "cluster name '{}' may only contain alphanumerics, '-' and '_', and must start with an alphanumeric",
                self.name
            )));
        }

        if let Some(region) = &self.region {
            validate_region(region)?;
        }

        let pool = &self.node_pool;
        if pool.node_count < 1 {
            return Err(Error::validation(format!(
                "cluster '{}': node_count must be at least 1",
                self.name
            )));
        }
        if pool.size_class.trim().is_empty() {
            return Err(Error::validation(format!(
                "cluster '{}': node pool size_class is required",
                self.name
            )));
        }
        let pool_name_ok = !pool.name.is_empty()
            && pool.name.len() <= 12
            && pool
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            && pool.name.starts_with(|c: char| c.is_ascii_lowercase());
        if !pool_name_ok {
            return Err(Error::validation(format!(
                "node pool name '{}' must be 1-12 lowercase alphanumerics starting with a letter",
                pool.name
            )));
        }

        Ok(())
    }
}

/// Registry pricing tier
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrySku {
    /// Basic tier
    #[default]
    Basic,
    /// Standard tier
    Standard,
    /// Premium tier
    Premium,
}

impl RegistrySku {
    /// Wire value used by the cloud API
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrySku::Basic => "Basic",
            RegistrySku::Standard => "Standard",
            RegistrySku::Premium => "Premium",
        }
    }
}

impl std::str::FromStr for RegistrySku {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Basic" => Ok(RegistrySku::Basic),
            "Standard" => Ok(RegistrySku::Standard),
            "Premium" => Ok(RegistrySku::Premium),
            other => Err(Error::cloud(None, format!("unknown registry sku '{other}'"))),
        }
    }
}

/// Desired container registry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySpec {
    /// Registry name (globally unique, 5-50 alphanumerics)
    pub name: String,
    /// Region; defaults to the resource group's region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Pricing tier
    #[serde(default)]
    pub sku: RegistrySku,
    /// Whether the admin user (and therefore admin credentials) is enabled
    #[serde(default = "default_true")]
    pub admin_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl RegistrySpec {
    /// Effective region for this registry
    pub fn region<'a>(&'a self, group: &'a ResourceGroup) -> &'a str {
        self.region.as_deref().unwrap_or(&group.region)
    }

    /// Validate the registry name and region
    pub fn validate(&self) -> Result<(), Error> {
        let len_ok = (5..=50).contains(&self.name.len());
        if !len_ok || !self.name.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::validation(format!(
                "registry name '{}' must be 5-50 alphanumeric characters",
                self.name
            )));
        }
        if let Some(region) = &self.region {
            validate_region(region)?;
        }
        Ok(())
    }
}

fn validate_region(region: &str) -> Result<(), Error> {
    if region.is_empty() || !region.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::validation(format!(
            "region '{region}' must be a non-empty alphanumeric region name (e.g. 'eastus')"
        )));
    }
    Ok(())
}
