//! Explicit destruction of what the pipeline created
//!
//! Without `infrastructure`, each app's service and workload are deleted, then
//! its namespace if kubebox created it. A namespace that existed before the
//! first deploy is kept and only the pull secret is removed from it. With
//! `infrastructure`, the resource group is deleted instead, which removes the
//! cluster, the registry and everything running in them, and the run waits
//! until the group is gone.

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::cluster::ClusterClient;
use crate::config::AppSpec;
use crate::namespace::is_managed;
use crate::pipeline::{ClusterAccess, Deleted, Pipeline, PipelineReport, Retained, Stage};
use crate::retry::{retry_transient, RetryConfig};
use crate::wait::{poll_until, PollOutcome};
use crate::Error;

impl Pipeline {
    /// Delete the apps, or the whole resource group with `infrastructure`
    #[instrument(skip(self, access, cancel))]
    pub async fn teardown(
        &self,
        access: ClusterAccess,
        infrastructure: bool,
        cancel: &CancellationToken,
    ) -> PipelineReport {
        let mut report = PipelineReport::default();

        if infrastructure {
            let group = self.config.resource_group.name.clone();
            let deleted = self.delete_resource_group(cancel).await;
            report.record(Stage::ResourceGroup, group, deleted);
            return report;
        }

        let connected = match access {
            ClusterAccess::Material(material) => self.factory.connect(material).await,
            ClusterAccess::Cloud => match self.cluster_credentials(cancel).await {
                Ok(material) => self.factory.connect(material).await,
                Err(e) => Err(e),
            },
        };
        let Some(client) = report.record(Stage::Connect, self.config.cluster.name.clone(), connected)
        else {
            return report;
        };

        let retry = self.config.timeouts.retry();
        for app in &self.config.apps {
            let app_report = delete_app(&client, app, &retry, cancel).await;
            let failed = app_report.first_failure().is_some();
            report.extend(app_report);
            if failed || cancel.is_cancelled() {
                break;
            }
        }
        report
    }

    async fn delete_resource_group(&self, cancel: &CancellationToken) -> Result<Deleted, Error> {
        let cloud = self.cloud()?;
        let timeouts = &self.config.timeouts;
        let retry = timeouts.retry();
        let name = &self.config.resource_group.name;
        if cancel.is_cancelled() {
            return Err(Error::cancelled(format!("resource group {name}")));
        }

        info!(group = %name, "Deleting resource group");
        retry_transient(&retry, cancel, "delete_resource_group", || {
            cloud.delete_resource_group(name)
        })
        .await?;

        let resource = format!("resource group {name}");
        let outcome = poll_until(&timeouts.teardown, &resource, cancel, || async {
            let current = retry_transient(&retry, cancel, "get_resource_group", || {
                cloud.get_resource_group(name)
            })
            .await?;
            Ok(current.is_none().then_some(()))
        })
        .await?;

        match outcome {
            PollOutcome::Ready(()) => Ok(Deleted),
            PollOutcome::TimedOut => Err(Error::ProvisioningTimeout {
                resource,
                waited: timeouts.teardown.timeout,
            }),
        }
    }
}

/// Delete one app in reverse dependency order, stopping at the first failure
async fn delete_app(
    client: &ClusterClient,
    app: &AppSpec,
    retry: &RetryConfig,
    cancel: &CancellationToken,
) -> PipelineReport {
    let mut report = PipelineReport::default();
    let api = client.api();
    let ns = app.namespace.as_str();

    if let Some(service) = &app.service {
        let target = format!("{ns}/{}", service.name);
        let result = if cancel.is_cancelled() {
            Err(Error::cancelled(format!("delete service {target}")))
        } else {
            api.delete_service(ns, &service.name).await.map(|()| Deleted)
        };
        if report.record(Stage::Service, target, result).is_none() {
            return report;
        }
    }

    let target = format!("{ns}/{}", app.workload.name);
    let result = if cancel.is_cancelled() {
        Err(Error::cancelled(format!("delete workload {target}")))
    } else {
        api.delete_deployment(ns, &app.workload.name)
            .await
            .map(|()| Deleted)
    };
    if report.record(Stage::Workload, target, result).is_none() {
        return report;
    }

    let namespace = retry_transient(retry, cancel, "get_namespace", || api.get_namespace(ns)).await;
    let namespace = match namespace {
        Ok(namespace) => namespace,
        Err(e) => {
            report.record::<Deleted>(Stage::Namespace, ns, Err(e));
            return report;
        }
    };

    match namespace {
        // Already gone, and the pull secret with it
        None => {
            report.record(Stage::Namespace, ns, Ok(Deleted));
        }
        Some(namespace) if is_managed(&namespace) => {
            let result = if cancel.is_cancelled() {
                Err(Error::cancelled(format!("delete namespace {ns}")))
            } else {
                api.delete_namespace(ns).await.map(|()| Deleted)
            };
            report.record(Stage::Namespace, ns, result);
        }
        Some(_) => {
            info!(namespace = %ns, "Namespace was not created by kubebox, keeping it");
            if let Some(secret) = &app.pull_secret {
                let target = format!("{ns}/{}", secret.name);
                let result = if cancel.is_cancelled() {
                    Err(Error::cancelled(format!("delete pull secret {target}")))
                } else {
                    api.delete_secret(ns, &secret.name).await.map(|()| Deleted)
                };
                if report.record(Stage::PullSecret, target, result).is_none() {
                    return report;
                }
            }
            report.record(Stage::Namespace, ns, Ok(Retained));
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{sample_material, ClientFactory, ConnectionMaterial, MockClusterApi};
    use crate::config::PipelineConfig;
    use crate::model::ResourceGroup;
    use crate::namespace::NamespaceManager;
    use crate::pipeline::{StageOutcome, StageStatus};
    use k8s_openapi::api::core::v1::Namespace;
    use kube::api::ObjectMeta;
    use crate::provider::MockCloudApi;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    const CONFIG: &str = r#"
resourceGroup: { name: rg-demo, region: eastus }
cluster:
  name: c1
  nodePool: { sizeClass: Standard_D2_v2, nodeCount: 2 }
timeouts:
  teardown: { timeout: 60, interval: 1 }
apps:
  - namespace: myapp
    workload:
      name: web
      selectorLabels: { app: web }
      podTemplate:
        labels: { app: web }
        image: nginx:1.27
        containerPort: 80
    service:
      name: web
      selectorLabels: { app: web }
      portMapping: { listenPort: 80, targetPort: 80 }
"#;

    struct StaticFactory(Arc<MockClusterApi>);

    #[async_trait]
    impl ClientFactory for StaticFactory {
        async fn connect(&self, _material: ConnectionMaterial) -> Result<ClusterClient, Error> {
            Ok(ClusterClient::new(self.0.clone()))
        }
    }

    fn pipeline(api: MockClusterApi) -> Pipeline {
        Pipeline::new(
            PipelineConfig::from_yaml(CONFIG).unwrap(),
            Arc::new(StaticFactory(Arc::new(api))),
        )
    }

    #[tokio::test]
    async fn story_apps_are_deleted_service_first() {
        let mut api = MockClusterApi::new();
        let mut seq = mockall::Sequence::new();
        api.expect_get_namespace()
            .returning(|name| Ok(Some(NamespaceManager::build(name))));
        api.expect_delete_service()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        api.expect_delete_deployment()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        api.expect_delete_namespace()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|ns| ns == "myapp")
            .returning(|_| Ok(()));

        let report = pipeline(api)
            .teardown(
                ClusterAccess::Material(sample_material()),
                false,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.stages.len(), 4);
    }

    /// Story: a namespace that existed before kubebox is kept; only the pull secret goes
    #[tokio::test]
    async fn story_unmanaged_namespace_is_kept() {
        let mut api = MockClusterApi::new();
        api.expect_delete_service().returning(|_, _| Ok(()));
        api.expect_delete_deployment().returning(|_, _| Ok(()));
        api.expect_get_namespace().returning(|name| {
            Ok(Some(Namespace {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            }))
        });
        api.expect_delete_secret()
            .times(1)
            .withf(|ns, name| ns == "shared-team-ns" && name == "regcred")
            .returning(|_, _| Ok(()));
        api.expect_delete_namespace().times(0);

        let config = CONFIG.replace("namespace: myapp", "namespace: shared-team-ns").replace(
            "    workload:\n",
            "    pullSecret: { name: regcred, registryHost: docker.io }\n    workload:\n",
        );
        let pipeline = Pipeline::new(
            PipelineConfig::from_yaml(&config).unwrap(),
            Arc::new(StaticFactory(Arc::new(api))),
        );
        let report = pipeline
            .teardown(
                ClusterAccess::Material(sample_material()),
                false,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(report.exit_code(), 0);
        let last = report.stages.last().unwrap();
        assert_eq!(last.stage, Stage::Namespace);
        assert_eq!(last.status, Retained.status());
        assert!(report.stages.iter().any(|s| s.stage == Stage::PullSecret));
    }

    #[tokio::test]
    async fn story_namespace_already_gone_counts_as_deleted() {
        let mut api = MockClusterApi::new();
        api.expect_delete_service().returning(|_, _| Ok(()));
        api.expect_delete_deployment().returning(|_, _| Ok(()));
        api.expect_get_namespace().returning(|_| Ok(None));
        api.expect_delete_namespace().times(0);

        let report = pipeline(api)
            .teardown(
                ClusterAccess::Material(sample_material()),
                false,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.stages.len(), 4);
    }

    #[tokio::test]
    async fn story_failed_delete_stops_the_app() {
        let mut api = MockClusterApi::new();
        api.expect_delete_service()
            .returning(|_, _| Err(Error::apply_conflict("Service", "web", "finalizer")));
        api.expect_delete_deployment().times(0);
        api.expect_delete_namespace().times(0);

        let report = pipeline(api)
            .teardown(
                ClusterAccess::Material(sample_material()),
                false,
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(report.exit_code(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn story_infrastructure_teardown_waits_for_group_deletion() {
        let mut cloud = MockCloudApi::new();
        cloud
            .expect_delete_resource_group()
            .times(1)
            .withf(|name| name == "rg-demo")
            .returning(|_| Ok(()));

        let reads = Arc::new(AtomicU32::new(0));
        let r = reads.clone();
        cloud.expect_get_resource_group().returning(move |_| {
            Ok((r.fetch_add(1, Ordering::SeqCst) < 3).then(|| ResourceGroup {
                name: "rg-demo".to_string(),
                region: "eastus".to_string(),
            }))
        });

        let report = pipeline(MockClusterApi::new())
            .with_cloud(Arc::new(cloud))
            .teardown(ClusterAccess::Cloud, true, &CancellationToken::new())
            .await;

        assert_eq!(report.exit_code(), 0);
        assert_eq!(reads.load(Ordering::SeqCst), 4);
        assert_eq!(report.stages[0].stage, Stage::ResourceGroup);
    }

    #[tokio::test(start_paused = true)]
    async fn story_group_that_never_disappears_times_out() {
        let mut cloud = MockCloudApi::new();
        cloud.expect_delete_resource_group().returning(|_| Ok(()));
        cloud.expect_get_resource_group().returning(|_| {
            Ok(Some(ResourceGroup {
                name: "rg-demo".to_string(),
                region: "eastus".to_string(),
            }))
        });

        let report = pipeline(MockClusterApi::new())
            .with_cloud(Arc::new(cloud))
            .teardown(ClusterAccess::Cloud, true, &CancellationToken::new())
            .await;

        assert_eq!(report.exit_code(), 3);
        assert!(matches!(report.stages[0].status, StageStatus::Failed { .. }));
    }
}
