//! Cloud-side provisioning: resource group, managed cluster, registry
//!
//! Both provisioners follow the same loop: read the observed resource, issue a
//! create-or-update only when it is missing, failed or drifted, then poll the
//! cloud until the long-running operation reaches a terminal state. Re-running
//! against an up-to-date resource performs reads only.

mod cluster;
mod registry;

pub use cluster::{ClusterProvisioner, ProvisionedCluster};
pub use registry::{ProvisionedRegistry, RegistryProvisioner};

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::provider::CloudApi;
use crate::retry::{retry_transient, RetryConfig};
use crate::model::ResourceGroup;
use crate::Error;

/// Per-name mutual exclusion for cloud resource creation
///
/// Two operations on the same resource name are serialized; operations on
/// different names proceed concurrently. Clones share the same lock table.
#[derive(Clone, Default)]
pub struct NameLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl NameLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting for any current holder
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = self.locks.entry(key.to_string()).or_default().clone();
        mutex.lock_owned().await
    }
}

/// Ensure the resource group exists in the desired region
///
/// An existing group in another region is a failure: groups cannot be moved.
pub(crate) async fn ensure_resource_group(
    cloud: &dyn CloudApi,
    group: &ResourceGroup,
    locks: &NameLocks,
    retry: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let _guard = locks.lock(&format!("resourcegroup/{}", group.name)).await;

    let observed = retry_transient(retry, cancel, "get_resource_group", || {
        cloud.get_resource_group(&group.name)
    })
    .await?;

    match observed {
        Some(existing) if existing.region.eq_ignore_ascii_case(&group.region) => Ok(()),
        Some(existing) => Err(Error::ProvisioningFailed {
            resource: format!("resource group {}", group.name),
            reason: format!(
                "exists in region '{}', desired '{}'; resource groups cannot change region",
                existing.region, group.region
            ),
        }),
        None => {
            info!(group = %group.name, region = %group.region, "Creating resource group");
            retry_transient(retry, cancel, "create_or_update_resource_group", || {
                cloud.create_or_update_resource_group(group)
            })
            .await
        }
    }
}
