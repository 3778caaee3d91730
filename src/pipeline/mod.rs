//! Stage ordering, concurrency and cancellation
//!
//! The pipeline is a fixed DAG:
//!
//! ```text
//! [Cluster] ──┐
//!             ├──► [Connect] ──► per app, concurrently:
//! [Registry] ─┘                  [Namespace] ──► [PullSecret] ──► [Workload] ──► [Service]
//! ```
//!
//! Cluster and registry provisioning run concurrently. Apps in different
//! namespaces run concurrently and share only the cluster client. A stage
//! starts only after the stages it depends on succeeded; otherwise it is
//! reported as skipped, or as cancelled once the run's cancellation token has
//! fired. Remote state created by earlier stages is left in place on failure.

mod report;

pub use report::{
    Deleted, PipelineReport, Retained, Stage, StageOutcome, StageReport, StageStatus,
};

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::cluster::{ClientFactory, ClusterClient, ConnectionMaterial};
use crate::config::{AppSpec, PipelineConfig, PullSecretSpec, RegistryLogin};
use crate::namespace::NamespaceManager;
use crate::provider::{CloudApi, RegistryCredentials};
use crate::provision::{ClusterProvisioner, NameLocks, RegistryProvisioner};
use crate::pull_secret::PullSecretAssembler;
use crate::retry::retry_transient;
use crate::service::{ServiceExposer, ServiceStatus};
use crate::workload::{WorkloadDeployer, WorkloadStatus};
use crate::Error;

/// Where the connection material for an existing cluster comes from
pub enum ClusterAccess {
    /// Read admin credentials from the cloud
    Cloud,
    /// Material parsed from a kubeconfig or Terraform state file
    Material(ConnectionMaterial),
}

/// The provisioning-to-deployment pipeline for one configuration
pub struct Pipeline {
    pub(crate) config: PipelineConfig,
    pub(crate) factory: Arc<dyn ClientFactory>,
    pub(crate) cloud: Option<Arc<dyn CloudApi>>,
    registry_login: Option<RegistryLogin>,
    locks: NameLocks,
}

/// Outputs of the provisioning stages that deployment consumes
struct Provisioned {
    material: ConnectionMaterial,
    registry: Option<RegistryCredentials>,
}

impl Pipeline {
    /// Create a pipeline; cloud access and registry login are optional
    pub fn new(config: PipelineConfig, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            config,
            factory,
            cloud: None,
            registry_login: None,
            locks: NameLocks::new(),
        }
    }

    /// Use `cloud` for provisioning and credential reads
    pub fn with_cloud(mut self, cloud: Arc<dyn CloudApi>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    /// Use `login` for pull secrets that name an explicit registry host
    pub fn with_registry_login(mut self, login: RegistryLogin) -> Self {
        self.registry_login = Some(login);
        self
    }

    /// The pipeline definition
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub(crate) fn cloud(&self) -> Result<&Arc<dyn CloudApi>, Error> {
        self.cloud.as_ref().ok_or_else(|| {
            Error::config(
                "cloud credentials (AZURE_SUBSCRIPTION_ID, AZURE_TENANT_ID, AZURE_CLIENT_ID, AZURE_CLIENT_SECRET) are required for this command",
            )
        })
    }

    /// Provision the cluster and registry
    #[instrument(skip_all, fields(cluster = %self.config.cluster.name))]
    pub async fn provision(&self, cancel: &CancellationToken) -> PipelineReport {
        let mut report = PipelineReport::default();
        self.provision_stages(&mut report, cancel).await;
        report
    }

    /// Deploy every app onto an existing cluster
    #[instrument(skip_all, fields(cluster = %self.config.cluster.name))]
    pub async fn deploy(&self, access: ClusterAccess, cancel: &CancellationToken) -> PipelineReport {
        let mut report = PipelineReport::default();

        let registry = if self.needs_provisioned_registry() {
            let credentials = self.registry_credentials(cancel).await;
            let Some(credentials) = report.record(Stage::Registry, self.registry_target(), credentials)
            else {
                self.skip_deploy(&mut report, cancel);
                return report;
            };
            Some(credentials)
        } else {
            None
        };

        let material = match access {
            ClusterAccess::Material(material) => Ok(material),
            ClusterAccess::Cloud => self.cluster_credentials(cancel).await,
        };

        self.deploy_stages(&mut report, material, registry, cancel).await;
        report
    }

    /// Provision, then deploy with the material provisioning produced
    #[instrument(skip_all, fields(cluster = %self.config.cluster.name))]
    pub async fn apply(&self, cancel: &CancellationToken) -> PipelineReport {
        let mut report = PipelineReport::default();
        match self.provision_stages(&mut report, cancel).await {
            Some(provisioned) => {
                self.deploy_stages(
                    &mut report,
                    Ok(provisioned.material),
                    provisioned.registry,
                    cancel,
                )
                .await
            }
            None => self.skip_deploy(&mut report, cancel),
        }
        report
    }

    /// Observe every app's workload and service without changing anything
    pub async fn status(
        &self,
        access: ClusterAccess,
        cancel: &CancellationToken,
    ) -> Result<Vec<AppStatus>, Error> {
        let material = match access {
            ClusterAccess::Material(material) => material,
            ClusterAccess::Cloud => self.cluster_credentials(cancel).await?,
        };
        let client = self.factory.connect(material).await?;

        let observed = join_all(self.config.apps.iter().map(|app| observe_app(&client, app))).await;
        observed.into_iter().collect()
    }

    async fn provision_stages(
        &self,
        report: &mut PipelineReport,
        cancel: &CancellationToken,
    ) -> Option<Provisioned> {
        let cluster_target = self.config.cluster.name.clone();
        let cloud = match self.cloud() {
            Ok(cloud) => cloud.clone(),
            Err(e) => {
                report.record::<ClusterClient>(Stage::Cluster, cluster_target, Err(e));
                if self.config.registry.is_some() {
                    report.not_run(Stage::Registry, self.registry_target(), cancel.is_cancelled());
                }
                return None;
            }
        };

        let timeouts = &self.config.timeouts;
        let group = &self.config.resource_group;
        let clusters = ClusterProvisioner::new(
            cloud.clone(),
            self.locks.clone(),
            timeouts.cluster,
            timeouts.retry(),
        );
        let registries = RegistryProvisioner::new(
            cloud,
            self.locks.clone(),
            timeouts.registry,
            timeouts.retry(),
        );

        let (cluster, registry) = tokio::join!(
            clusters.ensure(group, &self.config.cluster, cancel),
            async {
                match &self.config.registry {
                    Some(spec) => Some(registries.ensure(group, spec, cancel).await),
                    None => None,
                }
            }
        );

        let cluster = report.record(Stage::Cluster, cluster_target, cluster);
        let registry = match registry {
            Some(result) => match report.record(Stage::Registry, self.registry_target(), result) {
                Some(provisioned) => Some(provisioned),
                None => return None,
            },
            None => None,
        };

        Some(Provisioned {
            material: cluster?.material,
            registry: registry.and_then(|r| r.credentials),
        })
    }

    async fn deploy_stages(
        &self,
        report: &mut PipelineReport,
        material: Result<ConnectionMaterial, Error>,
        registry: Option<RegistryCredentials>,
        cancel: &CancellationToken,
    ) {
        let connected = if cancel.is_cancelled() {
            Err(Error::cancelled("connect"))
        } else {
            match material {
                Ok(material) => self.factory.connect(material).await,
                Err(e) => Err(e),
            }
        };

        let Some(client) = report.record(Stage::Connect, self.config.cluster.name.clone(), connected)
        else {
            for app in &self.config.apps {
                skip_app(report, app, cancel.is_cancelled());
            }
            return;
        };

        info!(apps = self.config.apps.len(), "Deploying apps");
        let reports = join_all(
            self.config
                .apps
                .iter()
                .map(|app| self.deploy_app(&client, app, registry.as_ref(), cancel)),
        )
        .await;

        for app_report in reports {
            report.extend(app_report);
        }
    }

    #[instrument(skip_all, fields(namespace = %app.namespace))]
    async fn deploy_app(
        &self,
        client: &ClusterClient,
        app: &AppSpec,
        registry: Option<&RegistryCredentials>,
        cancel: &CancellationToken,
    ) -> PipelineReport {
        let mut report = PipelineReport::default();
        let ns = app.namespace.as_str();
        let timeouts = &self.config.timeouts;

        let namespace = NamespaceManager::new(timeouts.retry())
            .ensure(client, ns, cancel)
            .await;
        if report.record(Stage::Namespace, ns, namespace).is_none() {
            skip_after_namespace(&mut report, app, cancel.is_cancelled());
            return report;
        }

        if let Some(secret) = &app.pull_secret {
            let target = format!("{ns}/{}", secret.name);
            let result = match self.pull_credentials(secret, registry) {
                Ok((host, login)) => {
                    PullSecretAssembler::new(timeouts.retry())
                        .ensure(client, ns, &secret.name, &host, &login, cancel)
                        .await
                }
                Err(e) => Err(e),
            };
            if report.record(Stage::PullSecret, target, result).is_none() {
                let cancelled = cancel.is_cancelled();
                report.not_run(Stage::Workload, workload_target(app), cancelled);
                if let Some(service) = &app.service {
                    report.not_run(Stage::Service, format!("{ns}/{}", service.name), cancelled);
                }
                return report;
            }
        }

        let mut deployer = WorkloadDeployer::new(timeouts.retry());
        if app.wait_for_ready {
            deployer = deployer.wait_for_ready(timeouts.readiness);
        }
        let workload = deployer.ensure(client, ns, &app.workload, cancel).await;
        if report.record(Stage::Workload, workload_target(app), workload).is_none() {
            if let Some(service) = &app.service {
                report.not_run(Stage::Service, format!("{ns}/{}", service.name), cancel.is_cancelled());
            }
            return report;
        }

        if let Some(service) = &app.service {
            let mut exposer = ServiceExposer::new(timeouts.retry());
            if app.wait_for_external_address {
                exposer = exposer.wait_for_external_address(timeouts.external_address);
            }
            let exposed = exposer.ensure(client, ns, service, cancel).await;
            report.record(Stage::Service, format!("{ns}/{}", service.name), exposed);
        }

        report
    }

    /// Registry host and login for a pull secret
    fn pull_credentials(
        &self,
        secret: &PullSecretSpec,
        registry: Option<&RegistryCredentials>,
    ) -> Result<(String, RegistryLogin), Error> {
        if let Some(host) = &secret.registry_host {
            let login = self.registry_login.clone().ok_or_else(|| {
                Error::config(format!(
                    "REGISTRY_USERNAME and REGISTRY_PASSWORD are required for pull secret '{}'",
                    secret.name
                ))
            })?;
            return Ok((host.clone(), login));
        }

        let credentials = registry.ok_or_else(|| {
            Error::config(format!(
                "pull secret '{}' needs the registry's admin credentials; enable adminEnabled or set registryHost",
                secret.name
            ))
        })?;
        let mut login = RegistryLogin::new(credentials.username.clone(), credentials.password.clone());
        login.email = self.registry_login.as_ref().and_then(|l| l.email.clone());
        Ok((credentials.login_server.clone(), login))
    }

    fn needs_provisioned_registry(&self) -> bool {
        self.config
            .apps
            .iter()
            .filter_map(|a| a.pull_secret.as_ref())
            .any(|s| s.registry_host.is_none())
    }

    fn registry_target(&self) -> String {
        self.config
            .registry
            .as_ref()
            .map(|r| r.name.clone())
            .unwrap_or_default()
    }

    pub(crate) async fn cluster_credentials(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ConnectionMaterial, Error> {
        let cloud = self.cloud()?;
        let group = &self.config.resource_group.name;
        let name = &self.config.cluster.name;
        let retry = self.config.timeouts.retry();
        let material = retry_transient(&retry, cancel, "get_cluster_credentials", || {
            cloud.get_cluster_credentials(group, name)
        })
        .await?;
        if !material.is_complete() {
            return Err(Error::invalid_credentials(format!(
                "cloud returned incomplete connection material for cluster {name}"
            )));
        }
        Ok(material)
    }

    async fn registry_credentials(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RegistryCredentials, Error> {
        let cloud = self.cloud()?;
        let spec = self
            .config
            .registry
            .as_ref()
            .ok_or_else(|| Error::validation("pull secret without registryHost needs a registry"))?;
        retry_transient(&self.config.timeouts.retry(), cancel, "get_registry_credentials", || {
            cloud.get_registry_credentials(&self.config.resource_group.name, &spec.name)
        })
        .await
    }

    fn skip_deploy(&self, report: &mut PipelineReport, cancel: &CancellationToken) {
        let cancelled = cancel.is_cancelled();
        report.not_run(Stage::Connect, self.config.cluster.name.clone(), cancelled);
        for app in &self.config.apps {
            skip_app(report, app, cancelled);
        }
    }
}

fn workload_target(app: &AppSpec) -> String {
    format!("{}/{}", app.namespace, app.workload.name)
}

fn skip_app(report: &mut PipelineReport, app: &AppSpec, cancelled: bool) {
    report.not_run(Stage::Namespace, app.namespace.clone(), cancelled);
    skip_after_namespace(report, app, cancelled);
}

fn skip_after_namespace(report: &mut PipelineReport, app: &AppSpec, cancelled: bool) {
    let ns = &app.namespace;
    if let Some(secret) = &app.pull_secret {
        report.not_run(Stage::PullSecret, format!("{ns}/{}", secret.name), cancelled);
    }
    report.not_run(Stage::Workload, workload_target(app), cancelled);
    if let Some(service) = &app.service {
        report.not_run(Stage::Service, format!("{ns}/{}", service.name), cancelled);
    }
}

// =============================================================================
// Status
// =============================================================================

/// Observed state of one app
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppStatus {
    /// Namespace
    pub namespace: String,
    /// Workload name
    pub workload: String,
    /// Replica counts, `None` if the workload does not exist
    pub workload_status: Option<WorkloadStatus>,
    /// Service name, if the app declares one
    pub service: Option<String>,
    /// Service state, `None` if missing or not declared
    pub service_status: Option<ServiceStatus>,
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: ", self.namespace, self.workload)?;
        match &self.workload_status {
            Some(status) => write!(
                f,
                "{}/{} ready",
                status.ready_replicas, status.desired_replicas
            )?,
            None => write!(f, "not deployed")?,
        }
        if let Some(service) = &self.service {
            write!(f, ", service {service}: ")?;
            match &self.service_status {
                Some(ServiceStatus {
                    external_address: Some(address),
                    ..
                }) => write!(f, "{address}")?,
                Some(status) if status.service_type == "LoadBalancer" => {
                    write!(f, "external address pending")?
                }
                Some(status) => write!(f, "{}", status.service_type)?,
                None => write!(f, "not deployed")?,
            }
        }
        Ok(())
    }
}

async fn observe_app(client: &ClusterClient, app: &AppSpec) -> Result<AppStatus, Error> {
    let workload_status =
        WorkloadDeployer::observe(client, &app.namespace, &app.workload.name).await?;
    let service_status = match &app.service {
        Some(service) => ServiceExposer::observe(client, &app.namespace, &service.name).await?,
        None => None,
    };
    Ok(AppStatus {
        namespace: app.namespace.clone(),
        workload: app.workload.name.clone(),
        workload_status,
        service: app.service.as_ref().map(|s| s.name.clone()),
        service_status,
    })
}

// =============================================================================
// Render
// =============================================================================

/// The Namespace, Deployment and Service manifests the pipeline would apply,
/// as a multi-document YAML stream. Pull secrets are never rendered.
pub fn render(config: &PipelineConfig) -> Result<String, Error> {
    let yaml = |value: Result<String, serde_yaml::Error>| {
        value.map_err(|e| Error::serialization(format!("failed to render manifest: {e}")))
    };

    let mut documents = Vec::new();
    for app in &config.apps {
        documents.push(yaml(serde_yaml::to_string(&NamespaceManager::build(&app.namespace)))?);
        documents.push(yaml(serde_yaml::to_string(&WorkloadDeployer::build(
            &app.namespace,
            &app.workload,
        )))?);
        if let Some(service) = &app.service {
            documents.push(yaml(serde_yaml::to_string(&ServiceExposer::build(
                &app.namespace,
                service,
            )))?);
        }
    }
    Ok(documents.join("---\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{sample_material, MockClusterApi};
    use crate::provider::MockCloudApi;
    use crate::sensitive::Sensitive;
    use async_trait::async_trait;

    const CONFIG: &str = r#"
resourceGroup: { name: rg-demo, region: eastus }
cluster:
  name: c1
  nodePool: { sizeClass: Standard_D2_v2, nodeCount: 2 }
apps:
  - namespace: myapp
    pullSecret: { name: regcred, registryHost: docker.io }
    waitForReady: false
    waitForExternalAddress: false
    workload:
      name: web
      replicaCount: 2
      selectorLabels: { app: web }
      podTemplate:
        labels: { app: web }
        image: nginx:1.27
        containerPort: 80
        pullSecretRef: regcred
    service:
      name: web
      selectorLabels: { app: web }
      portMapping: { listenPort: 80, targetPort: 80 }
"#;

    fn config() -> PipelineConfig {
        PipelineConfig::from_yaml(CONFIG).unwrap()
    }

    /// Factory handing out a fixed mock API
    struct StaticFactory(Arc<MockClusterApi>);

    #[async_trait]
    impl ClientFactory for StaticFactory {
        async fn connect(&self, _material: ConnectionMaterial) -> Result<ClusterClient, Error> {
            Ok(ClusterClient::new(self.0.clone()))
        }
    }

    struct RejectingFactory;

    #[async_trait]
    impl ClientFactory for RejectingFactory {
        async fn connect(&self, _material: ConnectionMaterial) -> Result<ClusterClient, Error> {
            Err(Error::invalid_credentials("api host unreachable"))
        }
    }

    fn login() -> RegistryLogin {
        RegistryLogin::new("user", Sensitive::new("pass"))
    }

    // =========================================================================
    // Story Tests: Deploy
    // =========================================================================

    #[tokio::test]
    async fn story_deploy_runs_stages_in_order() {
        let mut api = MockClusterApi::new();
        api.expect_get_namespace().returning(|_| Ok(None));
        api.expect_create_namespace().returning(|ns| Ok(ns.clone()));
        api.expect_get_secret().returning(|_, _| Ok(None));
        api.expect_create_secret().returning(|_, s| Ok(s.clone()));
        api.expect_get_deployment().returning(|_, _| Ok(None));
        api.expect_create_deployment().returning(|_, d| Ok(d.clone()));
        api.expect_get_service().returning(|_, _| Ok(None));
        api.expect_create_service().returning(|_, s| Ok(s.clone()));

        let pipeline = Pipeline::new(config(), Arc::new(StaticFactory(Arc::new(api))))
            .with_registry_login(login());
        let report = pipeline
            .deploy(ClusterAccess::Material(sample_material()), &CancellationToken::new())
            .await;

        let stages: Vec<Stage> = report.stages.iter().map(|s| s.stage).collect();
        assert_eq!(
            stages,
            vec![
                Stage::Connect,
                Stage::Namespace,
                Stage::PullSecret,
                Stage::Workload,
                Stage::Service
            ]
        );
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn story_unreachable_cluster_skips_every_app_stage() {
        let pipeline = Pipeline::new(config(), Arc::new(RejectingFactory)).with_registry_login(login());
        let report = pipeline
            .deploy(ClusterAccess::Material(sample_material()), &CancellationToken::new())
            .await;

        assert_eq!(report.exit_code(), 4);
        assert!(report.stages[1..]
            .iter()
            .all(|s| s.status == StageStatus::Skipped));
    }

    #[tokio::test]
    async fn story_missing_registry_login_fails_pull_secret_and_skips_dependents() {
        let mut api = MockClusterApi::new();
        api.expect_get_namespace()
            .returning(|name| Ok(Some(NamespaceManager::build(name))));
        api.expect_create_secret().times(0);
        api.expect_create_deployment().times(0);

        let pipeline = Pipeline::new(config(), Arc::new(StaticFactory(Arc::new(api))));
        let report = pipeline
            .deploy(ClusterAccess::Material(sample_material()), &CancellationToken::new())
            .await;

        assert_eq!(report.exit_code(), 2);
        assert_eq!(report.first_failure().unwrap().stage, Stage::PullSecret);
        assert_eq!(report.stages.last().unwrap().status, StageStatus::Skipped);
    }

    #[tokio::test]
    async fn story_cancelled_run_marks_unstarted_stages_cancelled() {
        let api = MockClusterApi::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let pipeline = Pipeline::new(config(), Arc::new(StaticFactory(Arc::new(api))))
            .with_registry_login(login());
        let report = pipeline
            .deploy(ClusterAccess::Material(sample_material()), &cancel)
            .await;

        assert_eq!(report.exit_code(), 130);
        assert!(report
            .stages
            .iter()
            .all(|s| s.status == StageStatus::Cancelled));
    }

    // =========================================================================
    // Story Tests: Provision
    // =========================================================================

    #[tokio::test]
    async fn story_provision_without_cloud_credentials_is_a_config_failure() {
        let pipeline = Pipeline::new(config(), Arc::new(RejectingFactory));
        let report = pipeline.provision(&CancellationToken::new()).await;

        assert_eq!(report.exit_code(), 2);
        assert_eq!(report.stages[0].stage, Stage::Cluster);
    }

    #[tokio::test]
    async fn story_provisioning_failure_skips_deployment() {
        let mut cloud = MockCloudApi::new();
        cloud
            .expect_list_vm_sizes()
            .returning(|_| Ok(vec!["Standard_D2_v2".to_string()]));
        cloud.expect_get_resource_group().returning(|_| {
            Err(Error::cloud(Some(403), "AuthorizationFailed"))
        });

        let pipeline = Pipeline::new(config(), Arc::new(RejectingFactory))
            .with_cloud(Arc::new(cloud))
            .with_registry_login(login());
        let report = pipeline.apply(&CancellationToken::new()).await;

        assert_eq!(report.exit_code(), 3);
        assert_eq!(report.stages[1].stage, Stage::Connect);
        assert!(report.stages[1..]
            .iter()
            .all(|s| s.status == StageStatus::Skipped));
    }

    // =========================================================================
    // Story Tests: Render
    // =========================================================================

    #[test]
    fn story_render_emits_manifests_without_secrets() {
        let rendered = render(&config()).unwrap();

        assert_eq!(rendered.matches("---\n").count(), 2);
        assert!(rendered.contains("kind: Namespace"));
        assert!(rendered.contains("kind: Deployment"));
        assert!(rendered.contains("kind: Service"));
        assert!(!rendered.contains("kind: Secret"));
        assert!(!rendered.contains("dockerconfigjson"));
    }
}
