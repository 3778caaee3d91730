//! Managed cluster provisioning

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::{ensure_resource_group, NameLocks};
use crate::cluster::ConnectionMaterial;
use crate::model::{ManagedClusterSpec, NodePool, ResourceGroup};
use crate::provider::{CloudApi, ObservedCluster, ProvisioningState};
use crate::retry::{retry_transient, RetryConfig};
use crate::wait::{poll_until, PollConfig, PollOutcome};
use crate::{ApplyAction, Error};

/// A ready cluster and the capability to connect to it
#[derive(Debug)]
pub struct ProvisionedCluster {
    /// What the provisioner had to do
    pub action: ApplyAction,
    /// Admin connection material
    pub material: ConnectionMaterial,
}

/// Creates or updates the resource group and the managed cluster
pub struct ClusterProvisioner {
    cloud: Arc<dyn CloudApi>,
    locks: NameLocks,
    poll: PollConfig,
    retry: RetryConfig,
}

impl ClusterProvisioner {
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

    /// Converge the cluster to `spec` and return its connection material
    ///
    /// Local validation runs before any remote call, and the node SKU is checked
    /// against the region before anything is created. An up-to-date cluster
    /// gets reads only.
    #[instrument(skip_all, fields(cluster = %spec.name, group = %group.name))]
    pub async fn ensure(
        &self,
        group: &ResourceGroup,
        spec: &ManagedClusterSpec,
        cancel: &CancellationToken,
    ) -> Result<ProvisionedCluster, Error> {
        group.validate()?;
        spec.validate()?;
        if cancel.is_cancelled() {
            return Err(Error::cancelled(format!("cluster {}", spec.name)));
        }

        self.check_size_offered(group, spec, cancel).await?;

        let _guard = self
            .locks
            .lock(&format!("cluster/{}/{}", group.name, spec.name))
            .await;

        let cloud = self.cloud.as_ref();
        ensure_resource_group(cloud, group, &self.locks, &self.retry, cancel).await?;

        let mut observed = self.read(group, spec, cancel).await?;
        if let Some(current) = &observed {
            if !current.provisioning_state.is_terminal() {
                info!(state = %current.provisioning_state, "Cluster operation in progress, waiting");
                self.wait(group, spec, cancel, settled).await?;
                observed = self.read(group, spec, cancel).await?;
            }
        }

        let action = match &observed {
            None => ApplyAction::Created,
            Some(current) if needs_update(current, &spec.node_pool) => ApplyAction::Updated,
            Some(_) => ApplyAction::Unchanged,
        };

        if action != ApplyAction::Unchanged {
            info!(
                action = ?action,
                nodes = spec.node_pool.node_count,
                size = %spec.node_pool.size_class,
                "Submitting cluster create/update"
            );
            retry_transient(&self.retry, cancel, "create_or_update_cluster", || {
                self.cloud.create_or_update_cluster(group, spec)
            })
            .await?;
            self.wait(group, spec, cancel, terminal_or_pending).await?;
        } else {
            debug!("Cluster matches desired state");
        }

        let material = retry_transient(&self.retry, cancel, "get_cluster_credentials", || {
            self.cloud.get_cluster_credentials(&group.name, &spec.name)
        })
        .await?;
        if !material.is_complete() {
            return Err(Error::invalid_credentials(format!(
                "cloud returned incomplete connection material for cluster {}",
                spec.name
            )));
        }

        info!(action = ?action, "Cluster ready");
        Ok(ProvisionedCluster { action, material })
    }

    async fn check_size_offered(
        &self,
        group: &ResourceGroup,
        spec: &ManagedClusterSpec,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let region = spec.region(group);
        let sizes = retry_transient(&self.retry, cancel, "list_vm_sizes", || {
            self.cloud.list_vm_sizes(region)
        })
        .await?;

        let wanted = &spec.node_pool.size_class;
        if sizes.iter().any(|s| s.eq_ignore_ascii_case(wanted)) {
            Ok(())
        } else {
            Err(Error::validation(format!(
                "size class '{wanted}' is not offered in region '{region}'"
            )))
        }
    }

    async fn read(
        &self,
        group: &ResourceGroup,
        spec: &ManagedClusterSpec,
        cancel: &CancellationToken,
    ) -> Result<Option<ObservedCluster>, Error> {
        retry_transient(&self.retry, cancel, "get_cluster", || {
            self.cloud.get_cluster(&group.name, &spec.name)
        })
        .await
    }

    /// Poll the cluster status until `classify` accepts it
    async fn wait(
        &self,
        group: &ResourceGroup,
        spec: &ManagedClusterSpec,
        cancel: &CancellationToken,
        classify: fn(&str, ProvisioningState) -> Result<Option<()>, Error>,
    ) -> Result<(), Error> {
        let resource = format!("cluster {}", spec.name);

        let outcome = poll_until(&self.poll, &resource, cancel, || async {
            let state = retry_transient(&self.retry, cancel, "get_cluster_status", || {
                self.cloud.get_cluster_status(&group.name, &spec.name)
            })
            .await?;
            debug!(state = %state, "Polled cluster status");
            classify(&resource, state)
        })
        .await?;

        match outcome {
            PollOutcome::Ready(()) => Ok(()),
            PollOutcome::TimedOut => Err(Error::ProvisioningTimeout {
                resource,
                waited: self.poll.timeout,
            }),
        }
    }
}

/// Map a polled state to ready (`Some`), keep polling (`None`) or failure
pub(crate) fn terminal_or_pending(
    resource: &str,
    state: ProvisioningState,
) -> Result<Option<()>, Error> {
    match state {
        ProvisioningState::Succeeded => Ok(Some(())),
        ProvisioningState::Failed(reason) => Err(Error::ProvisioningFailed {
            resource: resource.to_string(),
            reason,
        }),
        ProvisioningState::Canceled => Err(Error::ProvisioningFailed {
            resource: resource.to_string(),
            reason: "operation was canceled by the cloud".to_string(),
        }),
        _ => Ok(None),
    }
}

/// Any terminal state ends the wait; a failed operation is then resubmitted
pub(crate) fn settled(_resource: &str, state: ProvisioningState) -> Result<Option<()>, Error> {
    Ok(state.is_terminal().then_some(()))
}

fn needs_update(observed: &ObservedCluster, desired: &NodePool) -> bool {
    if matches!(
        observed.provisioning_state,
        ProvisioningState::Failed(_) | ProvisioningState::Canceled
    ) {
        return true;
    }
    match &observed.node_pool {
        Some(pool) => {
            pool.node_count != desired.node_count
                || !pool.size_class.eq_ignore_ascii_case(&desired.size_class)
        }
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::sample_material;
    use crate::model::IdentityMode;
    use crate::provider::MockCloudApi;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn group() -> ResourceGroup {
        ResourceGroup {
            name: "rg-demo".to_string(),
            region: "eastus".to_string(),
        }
    }

    fn spec(node_count: u32) -> ManagedClusterSpec {
        ManagedClusterSpec {
            name: "c1".to_string(),
            region: None,
            node_pool: NodePool {
                name: "default".to_string(),
                size_class: "Standard_D2_v2".to_string(),
                node_count,
            },
            identity_mode: IdentityMode::SystemAssigned,
            dns_prefix: None,
            kubernetes_version: None,
        }
    }

    fn observed(state: ProvisioningState, node_count: u32) -> ObservedCluster {
        ObservedCluster {
            provisioning_state: state,
            node_pool: Some(spec(node_count).node_pool),
            fqdn: Some("c1-dns.hcp.eastus.azmk8s.io".to_string()),
        }
    }

    fn provisioner(cloud: MockCloudApi, poll: PollConfig) -> ClusterProvisioner {
        ClusterProvisioner::new(
            Arc::new(cloud),
            NameLocks::new(),
            poll,
            RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        )
    }

    fn fast_poll() -> PollConfig {
        PollConfig::new(Duration::from_secs(5), Duration::from_millis(1))
    }

    /// Group exists and the SKU is offered
    fn with_group_and_sizes(cloud: &mut MockCloudApi) {
        cloud
            .expect_list_vm_sizes()
            .returning(|_| Ok(vec!["Standard_B2s".to_string(), "Standard_D2_v2".to_string()]));
        cloud
            .expect_get_resource_group()
            .returning(|_| Ok(Some(group())));
    }

    // ==========================================================================
    // Story Tests: Cluster Provisioning
    // ==========================================================================

    /// Story: a missing cluster is created, polled to ready, and yields credentials
    #[tokio::test]
    async fn story_missing_cluster_is_created_and_polled_to_ready() {
        let mut cloud = MockCloudApi::new();
        with_group_and_sizes(&mut cloud);
        cloud.expect_get_cluster().times(1).returning(|_, _| Ok(None));
        cloud
            .expect_create_or_update_cluster()
            .times(1)
            .withf(|_, s| s.name == "c1" && s.node_pool.node_count == 2)
            .returning(|_, _| Ok(()));

        let polls = Arc::new(AtomicU32::new(0));
        let p = polls.clone();
        cloud.expect_get_cluster_status().returning(move |_, _| {
            if p.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(ProvisioningState::Creating)
            } else {
                Ok(ProvisioningState::Succeeded)
            }
        });
        cloud
            .expect_get_cluster_credentials()
            .times(1)
            .returning(|_, _| Ok(sample_material()));

        let result = provisioner(cloud, fast_poll())
            .ensure(&group(), &spec(2), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.action, ApplyAction::Created);
        assert!(result.material.is_complete());
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    /// Story: an up-to-date cluster gets reads only
    #[tokio::test]
    async fn story_identical_cluster_makes_no_mutating_calls() {
        let mut cloud = MockCloudApi::new();
        with_group_and_sizes(&mut cloud);
        cloud
            .expect_get_cluster()
            .returning(|_, _| Ok(Some(observed(ProvisioningState::Succeeded, 2))));
        cloud.expect_create_or_update_cluster().times(0);
        cloud.expect_create_or_update_resource_group().times(0);
        cloud
            .expect_get_cluster_credentials()
            .returning(|_, _| Ok(sample_material()));

        let result = provisioner(cloud, fast_poll())
            .ensure(&group(), &spec(2), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.action, ApplyAction::Unchanged);
    }

    /// Story: a node count change issues an update and waits for it
    #[tokio::test]
    async fn story_node_count_drift_triggers_update() {
        let mut cloud = MockCloudApi::new();
        with_group_and_sizes(&mut cloud);
        cloud
            .expect_get_cluster()
            .returning(|_, _| Ok(Some(observed(ProvisioningState::Succeeded, 2))));
        cloud
            .expect_create_or_update_cluster()
            .times(1)
            .withf(|_, s| s.node_pool.node_count == 3)
            .returning(|_, _| Ok(()));
        cloud
            .expect_get_cluster_status()
            .returning(|_, _| Ok(ProvisioningState::Succeeded));
        cloud
            .expect_get_cluster_credentials()
            .returning(|_, _| Ok(sample_material()));

        let result = provisioner(cloud, fast_poll())
            .ensure(&group(), &spec(3), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.action, ApplyAction::Updated);
    }

    /// Story: the cloud's failure reason is surfaced
    #[tokio::test]
    async fn story_cloud_failure_is_provisioning_failed_with_reason() {
        let mut cloud = MockCloudApi::new();
        with_group_and_sizes(&mut cloud);
        cloud.expect_get_cluster().returning(|_, _| Ok(None));
        cloud
            .expect_create_or_update_cluster()
            .returning(|_, _| Ok(()));
        cloud
            .expect_get_cluster_status()
            .returning(|_, _| Ok(ProvisioningState::Failed("QuotaExceeded".to_string())));
        cloud.expect_get_cluster_credentials().times(0);

        let err = provisioner(cloud, fast_poll())
            .ensure(&group(), &spec(2), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            Error::ProvisioningFailed { resource, reason } => {
                assert_eq!(resource, "cluster c1");
                assert_eq!(reason, "QuotaExceeded");
            }
            other => panic!("expected ProvisioningFailed, got {other:?}"),
        }
    }

    /// Story: a cluster stuck creating past the deadline times out
    #[tokio::test(start_paused = true)]
    async fn story_stuck_cluster_times_out() {
        let mut cloud = MockCloudApi::new();
        with_group_and_sizes(&mut cloud);
        cloud.expect_get_cluster().returning(|_, _| Ok(None));
        cloud
            .expect_create_or_update_cluster()
            .returning(|_, _| Ok(()));
        cloud
            .expect_get_cluster_status()
            .returning(|_, _| Ok(ProvisioningState::Creating));

        let poll = PollConfig::new(Duration::from_secs(900), Duration::from_secs(15));
        let err = provisioner(cloud, poll)
            .ensure(&group(), &spec(2), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::ProvisioningTimeout { waited, .. } if waited == Duration::from_secs(900)
        ));
    }

    /// Story: transient status read failures are retried inside the poll loop
    #[tokio::test]
    async fn story_transient_status_errors_are_retried() {
        let mut cloud = MockCloudApi::new();
        with_group_and_sizes(&mut cloud);
        cloud.expect_get_cluster().returning(|_, _| Ok(None));
        cloud
            .expect_create_or_update_cluster()
            .returning(|_, _| Ok(()));

        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        cloud.expect_get_cluster_status().returning(move |_, _| {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::cloud(Some(503), "unavailable"))
            } else {
                Ok(ProvisioningState::Succeeded)
            }
        });
        cloud
            .expect_get_cluster_credentials()
            .returning(|_, _| Ok(sample_material()));

        provisioner(cloud, fast_poll())
            .ensure(&group(), &spec(2), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    /// Story: an in-flight operation is awaited rather than re-submitted
    #[tokio::test]
    async fn story_in_progress_cluster_is_awaited() {
        let mut cloud = MockCloudApi::new();
        with_group_and_sizes(&mut cloud);

        let reads = Arc::new(AtomicU32::new(0));
        let r = reads.clone();
        cloud.expect_get_cluster().returning(move |_, _| {
            let state = if r.fetch_add(1, Ordering::SeqCst) == 0 {
                ProvisioningState::Creating
            } else {
                ProvisioningState::Succeeded
            };
            Ok(Some(observed(state, 2)))
        });
        cloud
            .expect_get_cluster_status()
            .returning(|_, _| Ok(ProvisioningState::Succeeded));
        cloud.expect_create_or_update_cluster().times(0);
        cloud
            .expect_get_cluster_credentials()
            .returning(|_, _| Ok(sample_material()));

        let result = provisioner(cloud, fast_poll())
            .ensure(&group(), &spec(2), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.action, ApplyAction::Unchanged);
    }

    /// Story: an in-flight operation that fails is resubmitted once it settles
    #[tokio::test]
    async fn story_in_progress_cluster_that_fails_is_resubmitted() {
        let mut cloud = MockCloudApi::new();
        with_group_and_sizes(&mut cloud);

        let reads = Arc::new(AtomicU32::new(0));
        let r = reads.clone();
        cloud.expect_get_cluster().returning(move |_, _| {
            let state = if r.fetch_add(1, Ordering::SeqCst) == 0 {
                ProvisioningState::Updating
            } else {
                ProvisioningState::Failed("NodePoolUpgradeFailed".to_string())
            };
            Ok(Some(observed(state, 2)))
        });

        let statuses = Arc::new(AtomicU32::new(0));
        let st = statuses.clone();
        cloud.expect_get_cluster_status().returning(move |_, _| {
            // First poll settles the in-flight operation, the rest follow the PUT
            if st.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(ProvisioningState::Failed("NodePoolUpgradeFailed".to_string()))
            } else {
                Ok(ProvisioningState::Succeeded)
            }
        });
        cloud
            .expect_create_or_update_cluster()
            .times(1)
            .returning(|_, _| Ok(()));
        cloud
            .expect_get_cluster_credentials()
            .returning(|_, _| Ok(sample_material()));

        let result = provisioner(cloud, fast_poll())
            .ensure(&group(), &spec(2), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.action, ApplyAction::Updated);
        assert_eq!(statuses.load(Ordering::SeqCst), 2);
    }

    /// Story: a transient-failure burst during the status poll ends as cancellation
    #[tokio::test(start_paused = true)]
    async fn story_cancellation_during_retry_burst_is_not_a_cloud_failure() {
        let mut cloud = MockCloudApi::new();
        with_group_and_sizes(&mut cloud);
        cloud.expect_get_cluster().returning(|_, _| Ok(None));
        cloud
            .expect_create_or_update_cluster()
            .returning(|_, _| Ok(()));
        cloud
            .expect_get_cluster_status()
            .returning(|_, _| Err(Error::cloud(Some(503), "unavailable")));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let provisioner = ClusterProvisioner::new(
            Arc::new(cloud),
            NameLocks::new(),
            PollConfig::new(Duration::from_secs(600), Duration::from_secs(15)),
            RetryConfig::default(),
        );
        let started = tokio::time::Instant::now();
        let err = provisioner
            .ensure(&group(), &spec(2), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled(_)), "{err:?}");
        assert_eq!(err.category().exit_code(), 130);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    /// Story: invalid input fails before any remote call
    #[tokio::test]
    async fn story_zero_nodes_fails_without_remote_calls() {
        // No expectations: any call would panic
        let cloud = MockCloudApi::new();
        let err = provisioner(cloud, fast_poll())
            .ensure(&group(), &spec(0), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Validation);
    }

    /// Story: an unknown SKU is rejected before anything is created
    #[tokio::test]
    async fn story_unoffered_size_class_is_rejected_before_mutation() {
        let mut cloud = MockCloudApi::new();
        cloud
            .expect_list_vm_sizes()
            .returning(|_| Ok(vec!["Standard_B2s".to_string()]));
        cloud.expect_create_or_update_resource_group().times(0);
        cloud.expect_create_or_update_cluster().times(0);

        let err = provisioner(cloud, fast_poll())
            .ensure(&group(), &spec(2), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(msg) if msg.contains("Standard_D2_v2")));
    }

    /// Story: cancellation while waiting leaves the cloud operation running
    #[tokio::test(start_paused = true)]
    async fn story_cancellation_during_poll_is_reported() {
        let mut cloud = MockCloudApi::new();
        with_group_and_sizes(&mut cloud);
        cloud.expect_get_cluster().returning(|_, _| Ok(None));
        cloud
            .expect_create_or_update_cluster()
            .times(1)
            .returning(|_, _| Ok(()));
        cloud
            .expect_get_cluster_status()
            .returning(|_, _| Ok(ProvisioningState::Creating));
        cloud.expect_delete_resource_group().times(0);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            trigger.cancel();
        });

        let poll = PollConfig::new(Duration::from_secs(900), Duration::from_secs(15));
        let err = provisioner(cloud, poll)
            .ensure(&group(), &spec(2), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[test]
    fn sku_comparison_ignores_case() {
        let current = observed(ProvisioningState::Succeeded, 2);
        let mut desired = spec(2).node_pool;
        desired.size_class = "standard_d2_v2".to_string();
        assert!(!needs_update(&current, &desired));
    }
}
