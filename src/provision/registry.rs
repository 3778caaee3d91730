//! Container registry provisioning

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::cluster::{settled, terminal_or_pending};
use super::{ensure_resource_group, NameLocks};
use crate::model::{RegistrySpec, ResourceGroup};
use crate::provider::{CloudApi, ObservedRegistry, ProvisioningState, RegistryCredentials};
use crate::retry::{retry_transient, RetryConfig};
use crate::wait::{poll_until, PollConfig, PollOutcome};
use crate::{ApplyAction, Error};

/// A ready registry
#[derive(Debug)]
pub struct ProvisionedRegistry {
    /// What the provisioner had to do
    pub action: ApplyAction,
    /// Host name used to push and pull images
    pub login_server: String,
    /// Admin login, present when admin is enabled
    pub credentials: Option<RegistryCredentials>,
}

/// Creates or updates a container registry in the resource group
pub struct RegistryProvisioner {
    cloud: Arc<dyn CloudApi>,
    locks: NameLocks,
    poll: PollConfig,
    retry: RetryConfig,
}

impl RegistryProvisioner {
    /// Create a provisioner
    pub fn new(
        cloud: Arc<dyn CloudApi>,
        locks: NameLocks,
        poll: PollConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            cloud,
            locks,
            poll,
            retry,
        }
    }

    /// Converge the registry to `spec` and return its login endpoint
    #[instrument(skip_all, fields(registry = %spec.name, group = %group.name))]
    pub async fn ensure(
        &self,
        group: &ResourceGroup,
        spec: &RegistrySpec,
        cancel: &CancellationToken,
    ) -> Result<ProvisionedRegistry, Error> {
        group.validate()?;
        spec.validate()?;
        if cancel.is_cancelled() {
            return Err(Error::cancelled(format!("registry {}", spec.name)));
        }

        // Registry names are global, so the lock is not scoped by group
        let _guard = self.locks.lock(&format!("registry/{}", spec.name)).await;

        let cloud = self.cloud.as_ref();
        ensure_resource_group(cloud, group, &self.locks, &self.retry, cancel).await?;

        let mut observed = self.read(group, spec, cancel).await?;
        if let Some(current) = &observed {
            if !current.provisioning_state.is_terminal() {
                info!(state = %current.provisioning_state, "Registry operation in progress, waiting");
                observed = Some(self.wait(group, spec, cancel, settled).await?);
            }
        }

        let action = match &observed {
            None => ApplyAction::Created,
            Some(current) if needs_update(current, spec) => ApplyAction::Updated,
            Some(_) => ApplyAction::Unchanged,
        };

        let ready = match observed {
            Some(current) if action == ApplyAction::Unchanged => {
                debug!("Registry matches desired state");
                current
            }
            _ => {
                info!(action = ?action, sku = spec.sku.as_str(), "Submitting registry create/update");
                retry_transient(&self.retry, cancel, "create_or_update_registry", || {
                    self.cloud.create_or_update_registry(group, spec)
                })
                .await?;
                self.wait(group, spec, cancel, terminal_or_pending).await?
            }
        };

        let credentials = if spec.admin_enabled {
            Some(
                retry_transient(&self.retry, cancel, "get_registry_credentials", || {
                    self.cloud.get_registry_credentials(&group.name, &spec.name)
                })
                .await?,
            )
        } else {
            None
        };

        info!(action = ?action, login_server = %ready.login_server, "Registry ready");
        Ok(ProvisionedRegistry {
            action,
            login_server: ready.login_server,
            credentials,
        })
    }

    async fn read(
        &self,
        group: &ResourceGroup,
        spec: &RegistrySpec,
        cancel: &CancellationToken,
    ) -> Result<Option<ObservedRegistry>, Error> {
        retry_transient(&self.retry, cancel, "get_registry", || {
            self.cloud.get_registry(&group.name, &spec.name)
        })
        .await
    }

    /// Poll the registry until `classify` accepts its state
    async fn wait(
        &self,
        group: &ResourceGroup,
        spec: &RegistrySpec,
        cancel: &CancellationToken,
        classify: fn(&str, ProvisioningState) -> Result<Option<()>, Error>,
    ) -> Result<ObservedRegistry, Error> {
        let resource = format!("registry {}", spec.name);

        let outcome = poll_until(&self.poll, &resource, cancel, || async {
            // A registry that is not visible yet is still being created
            let Some(current) = self.read(group, spec, cancel).await? else {
                return Ok(None);
            };
            Ok(classify(&resource, current.provisioning_state.clone())?.map(|()| current))
        })
        .await?;

        match outcome {
            PollOutcome::Ready(registry) => Ok(registry),
            PollOutcome::TimedOut => Err(Error::ProvisioningTimeout {
                resource,
                waited: self.poll.timeout,
            }),
        }
    }
}

fn needs_update(observed: &ObservedRegistry, desired: &RegistrySpec) -> bool {
    matches!(
        observed.provisioning_state,
        ProvisioningState::Failed(_) | ProvisioningState::Canceled
    ) || observed.sku != desired.sku
        || observed.admin_enabled != desired.admin_enabled
}
