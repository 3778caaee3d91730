//! Replicated workload stage
//!
//! A [`WorkloadSpec`] is rendered to an `apps/v1` Deployment and converged with
//! whole-object create/replace. Updates roll out with `maxUnavailable: 0` and
//! `maxSurge: 1`, so a replica change or a new image never takes the ready
//! count below what was serving before the update.
//!
//! Readiness is optional and bounded: a rollout that is still partial when the
//! readiness deadline passes is reported as `degraded`, not as a failure.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, LocalObjectReference, PodSpec, PodTemplateSpec,
    ResourceRequirements as KubeResources,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cluster::ClusterClient;
use crate::model::{
    parse_cpu_millis, parse_memory_bytes, validate_dns_label, ResourceQuantity, WorkloadSpec,
};
use crate::retry::{retry_transient, RetryConfig};
use crate::wait::{poll_until, PollConfig, PollOutcome};
use crate::{ApplyAction, Error, FIELD_MANAGER, MANAGED_BY_LABEL};

/// Name of the container port, matched by the service's primary port
pub const CONTAINER_PORT_NAME: &str = "http";

// =============================================================================
// Outcome Types
// =============================================================================

/// Result of ensuring a workload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeployedWorkload {
    /// Workload name
    pub name: String,
    /// Namespace holding the workload
    pub namespace: String,
    /// What had to be done
    pub action: ApplyAction,
    /// Desired replica count
    pub desired_replicas: i32,
    /// Ready replicas at the last observation
    pub ready_replicas: i32,
    /// True if the readiness wait ended before the rollout completed
    pub degraded: bool,
}

/// Observed replica counts of an existing workload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkloadStatus {
    /// Replicas requested in the deployment spec
    pub desired_replicas: i32,
    /// Replicas passing readiness checks
    pub ready_replicas: i32,
    /// Replicas running the current pod template
    pub updated_replicas: i32,
    /// True once the controller has observed the latest spec and every
    /// desired replica is updated, ready and available
    pub rolled_out: bool,
}

impl WorkloadStatus {
    /// Read replica counts from a deployment
    pub fn from_deployment(deployment: &Deployment) -> Self {
        let desired = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(1);
        let status = deployment.status.clone().unwrap_or_default();
        let ready = status.ready_replicas.unwrap_or(0);
        let updated = status.updated_replicas.unwrap_or(0);
        let available = status.available_replicas.unwrap_or(0);
        let total = status.replicas.unwrap_or(0);

        let observed_latest = match (deployment.metadata.generation, status.observed_generation) {
            (Some(generation), Some(observed)) => observed >= generation,
            (Some(_), None) => false,
            (None, _) => true,
        };

        Self {
            desired_replicas: desired,
            ready_replicas: ready,
            updated_replicas: updated,
            rolled_out: observed_latest
                && updated >= desired
                && ready >= desired
                && available >= desired
                && total <= desired,
        }
    }
}

// =============================================================================
// Deployer
// =============================================================================

/// Ensures a replicated workload exists and matches its spec
#[derive(Clone, Debug)]
pub struct WorkloadDeployer {
    readiness: Option<PollConfig>,
    retry: RetryConfig,
}

impl WorkloadDeployer {
    /// Create a deployer that does not wait for readiness
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            readiness: None,
            retry,
        }
    }

    /// Wait up to `poll.timeout` for the rollout to complete
    pub fn wait_for_ready(mut self, poll: PollConfig) -> Self {
        self.readiness = Some(poll);
        self
    }

    /// Render the deployment for `spec` in `namespace`
    pub fn build(namespace: &str, spec: &WorkloadSpec) -> Deployment {
        let template = &spec.pod_template;

        let mut labels = template.labels.clone();
        labels.insert(MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string());

        let resources = &template.resources;
        let container = Container {
            name: spec.name.clone(),
            image: Some(template.image.clone()),
            ports: Some(vec![ContainerPort {
                name: Some(CONTAINER_PORT_NAME.to_string()),
                container_port: i32::from(template.container_port),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            resources: (!resources.requests.is_empty() || !resources.limits.is_empty()).then(
                || KubeResources {
                    requests: quantity_map(&resources.requests),
                    limits: quantity_map(&resources.limits),
                    ..Default::default()
                },
            ),
            ..Default::default()
        };

        Deployment {
            metadata: ObjectMeta {
                name: Some(spec.name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(spec.replica_count),
                selector: LabelSelector {
                    match_labels: Some(spec.selector_labels.clone()),
                    ..Default::default()
                },
                strategy: Some(DeploymentStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    rolling_update: Some(RollingUpdateDeployment {
                        max_unavailable: Some(IntOrString::Int(0)),
                        max_surge: Some(IntOrString::Int(1)),
                    }),
                }),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(template.labels.clone()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        image_pull_secrets: template.pull_secret_ref.as_ref().map(|name| {
                            vec![LocalObjectReference { name: name.clone() }]
                        }),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Create the workload, roll it forward if it differs, or leave it
    #[instrument(skip(self, client, spec, cancel), fields(workload = %spec.name))]
    pub async fn ensure(
        &self,
        client: &ClusterClient,
        namespace: &str,
        spec: &WorkloadSpec,
        cancel: &CancellationToken,
    ) -> Result<DeployedWorkload, Error> {
        spec.validate()?;
        validate_dns_label(namespace, "namespace")?;
        if cancel.is_cancelled() {
            return Err(Error::cancelled(format!("workload {}", spec.name)));
        }

        let api = client.api();
        let desired = Self::build(namespace, spec);

        let existing = retry_transient(&self.retry, cancel, "get_deployment", || {
            api.get_deployment(namespace, &spec.name)
        })
        .await?;

        let (action, applied) = match existing {
            None => {
                let created = api.create_deployment(namespace, &desired).await?;
                info!(replicas = spec.replica_count, image = %spec.pod_template.image, "Created workload");
                (ApplyAction::Created, created)
            }
            Some(current) => {
                check_selector(&current, spec)?;
                let changes = changed_fields(&current, spec);
                if changes.is_empty() {
                    debug!("Workload matches desired state");
                    (ApplyAction::Unchanged, current)
                } else {
                    let mut replacement = desired;
                    replacement.metadata.resource_version = current.metadata.resource_version;
                    let replaced = api.replace_deployment(namespace, &replacement).await?;
                    info!(changed = ?changes, replicas = spec.replica_count, "Rolling workload forward");
                    (ApplyAction::Updated, replaced)
                }
            }
        };

        let mut status = WorkloadStatus::from_deployment(&applied);
        let mut degraded = false;

        if let Some(poll) = &self.readiness {
            match self.wait_rolled_out(client, namespace, spec, poll, cancel).await? {
                PollOutcome::Ready(ready) => status = ready,
                PollOutcome::TimedOut => {
                    if let Some(latest) = Self::observe(client, namespace, &spec.name).await? {
                        status = latest;
                    }
                    degraded = true;
                    warn!(
                        ready = status.ready_replicas,
                        desired = spec.replica_count,
                        waited = ?poll.timeout,
                        "Workload not fully ready before deadline"
                    );
                }
            }
        }

        Ok(DeployedWorkload {
            name: spec.name.clone(),
            namespace: namespace.to_string(),
            action,
            desired_replicas: spec.replica_count,
            ready_replicas: status.ready_replicas,
            degraded,
        })
    }

    /// Current replica counts, or `None` if the workload does not exist
    pub async fn observe(
        client: &ClusterClient,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkloadStatus>, Error> {
        Ok(client
            .api()
            .get_deployment(namespace, name)
            .await?
            .as_ref()
            .map(WorkloadStatus::from_deployment))
    }

    async fn wait_rolled_out(
        &self,
        client: &ClusterClient,
        namespace: &str,
        spec: &WorkloadSpec,
        poll: &PollConfig,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome<WorkloadStatus>, Error> {
        let api = client.api();
        let operation = format!("workload {} readiness", spec.name);

        poll_until(poll, &operation, cancel, || async {
            let current = retry_transient(&self.retry, cancel, "get_deployment", || {
                api.get_deployment(namespace, &spec.name)
            })
            .await?;
            let Some(current) = current else {
                return Ok(None);
            };
            let status = WorkloadStatus::from_deployment(&current);
            debug!(
                ready = status.ready_replicas,
                updated = status.updated_replicas,
                desired = status.desired_replicas,
                "Waiting for rollout"
            );
            Ok(status.rolled_out.then_some(status))
        })
        .await
    }
}

fn quantity_map(quantity: &ResourceQuantity) -> Option<BTreeMap<String, Quantity>> {
    let map = quantity.to_map();
    (!map.is_empty()).then(|| map.into_iter().map(|(k, v)| (k, Quantity(v))).collect())
}

/// The selector of an existing deployment cannot be changed in place
fn check_selector(current: &Deployment, spec: &WorkloadSpec) -> Result<(), Error> {
    let existing = current
        .spec
        .as_ref()
        .and_then(|s| s.selector.match_labels.as_ref());
    if existing != Some(&spec.selector_labels) {
        return Err(Error::apply_conflict(
            "Deployment",
            &spec.name,
            format!(
                "selector is immutable: existing {:?}, desired {:?}",
                existing.cloned().unwrap_or_default(),
                spec.selector_labels
            ),
        ));
    }
    Ok(())
}

/// Fields of `current` that differ from `spec`, empty when up to date
fn changed_fields(current: &Deployment, spec: &WorkloadSpec) -> Vec<&'static str> {
    let mut changes = Vec::new();
    let deployment_spec = current.spec.as_ref();

    if deployment_spec.and_then(|s| s.replicas).unwrap_or(1) != spec.replica_count {
        changes.push("replicas");
    }

    let pod = deployment_spec.and_then(|s| s.template.spec.as_ref());
    let container = pod.and_then(|p| {
        p.containers
            .iter()
            .find(|c| c.name == spec.name)
            .or_else(|| p.containers.first())
    });

    if container.and_then(|c| c.image.as_deref()) != Some(spec.pod_template.image.as_str()) {
        changes.push("image");
    }

    let port = container
        .and_then(|c| c.ports.as_ref())
        .and_then(|ports| ports.first())
        .map(|p| p.container_port);
    if port != Some(i32::from(spec.pod_template.container_port)) {
        changes.push("containerPort");
    }

    let resources = container.and_then(|c| c.resources.as_ref());
    let requests = resources.and_then(|r| r.requests.as_ref());
    let limits = resources.and_then(|r| r.limits.as_ref());
    if normalized(requests) != normalized_desired(&spec.pod_template.resources.requests)
        || normalized(limits) != normalized_desired(&spec.pod_template.resources.limits)
    {
        changes.push("resources");
    }

    let pull_secrets: Vec<&str> = pod
        .and_then(|p| p.image_pull_secrets.as_ref())
        .map(|refs| refs.iter().map(|r| r.name.as_str()).collect())
        .unwrap_or_default();
    let desired_secrets: Vec<&str> = spec.pod_template.pull_secret_ref.iter().map(String::as_str).collect();
    if pull_secrets != desired_secrets {
        changes.push("pullSecret");
    }

    let template_labels = deployment_spec
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.labels.as_ref());
    if template_labels != Some(&spec.pod_template.labels) {
        changes.push("podLabels");
    }

    changes
}

/// (cpu millicores, memory bytes); an unparseable server value differs from any valid one
type NormalizedResources = (Option<Result<u64, String>>, Option<Result<u64, String>>);

fn normalized(map: Option<&BTreeMap<String, Quantity>>) -> NormalizedResources {
    let get = |key: &str| map.and_then(|m| m.get(key)).map(|q| q.0.as_str());
    (
        get("cpu").map(parse_cpu_millis),
        get("memory").map(parse_memory_bytes),
    )
}

fn normalized_desired(quantity: &ResourceQuantity) -> NormalizedResources {
    (
        quantity.cpu.as_deref().map(parse_cpu_millis),
        quantity.memory.as_deref().map(parse_memory_bytes),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterApi;
    use crate::model::{PodTemplate, ResourceRequirements};
    use k8s_openapi::api::apps::v1::DeploymentStatus;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn labels() -> BTreeMap<String, String> {
        BTreeMap::from([("app".to_string(), "myapp".to_string())])
    }

    fn spec(replicas: i32) -> WorkloadSpec {
        WorkloadSpec {
            name: "myapp-deployment".to_string(),
            replica_count: replicas,
            selector_labels: labels(),
            pod_template: PodTemplate {
                labels: labels(),
                image: "myregistry.azurecr.io/myapp:1.0".to_string(),
                container_port: 8080,
                resources: ResourceRequirements {
                    requests: ResourceQuantity {
                        cpu: Some("250m".to_string()),
                        memory: Some("128Mi".to_string()),
                    },
                    limits: ResourceQuantity {
                        cpu: Some("1".to_string()),
                        memory: Some("256Mi".to_string()),
                    },
                },
                pull_secret_ref: Some("acr-secret".to_string()),
            },
        }
    }

    /// A deployment as the server would return it after a completed rollout
    fn live(spec: &WorkloadSpec, ready: i32) -> Deployment {
        let mut deployment = WorkloadDeployer::build("myapp", spec);
        deployment.metadata.resource_version = Some("7".to_string());
        deployment.metadata.generation = Some(3);
        deployment.status = Some(DeploymentStatus {
            observed_generation: Some(3),
            replicas: Some(spec.replica_count),
            updated_replicas: Some(ready),
            ready_replicas: Some(ready),
            available_replicas: Some(ready),
            ..Default::default()
        });
        deployment
    }

    fn client(api: MockClusterApi) -> ClusterClient {
        ClusterClient::new(Arc::new(api))
    }

    fn deployer() -> WorkloadDeployer {
        WorkloadDeployer::new(RetryConfig::with_max_attempts(1))
    }

    // =========================================================================
    // Story Tests: Rendering
    // =========================================================================

    #[test]
    fn story_rendered_deployment_never_drops_below_ready() {
        let deployment = WorkloadDeployer::build("myapp", &spec(2));
        let strategy = deployment.spec.as_ref().unwrap().strategy.clone().unwrap();
        let rolling = strategy.rolling_update.unwrap();

        assert_eq!(strategy.type_.as_deref(), Some("RollingUpdate"));
        assert_eq!(rolling.max_unavailable, Some(IntOrString::Int(0)));
        assert_eq!(rolling.max_surge, Some(IntOrString::Int(1)));
    }

    #[test]
    fn story_rendered_pod_carries_image_port_resources_and_pull_secret() {
        let deployment = WorkloadDeployer::build("myapp", &spec(2));
        let dspec = deployment.spec.unwrap();
        let pod = dspec.template.spec.unwrap();
        let container = &pod.containers[0];

        assert_eq!(dspec.selector.match_labels, Some(labels()));
        assert_eq!(dspec.template.metadata.unwrap().labels, Some(labels()));
        assert_eq!(container.image.as_deref(), Some("myregistry.azurecr.io/myapp:1.0"));
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 8080);
        let resources = container.resources.as_ref().unwrap();
        assert_eq!(
            resources.requests.as_ref().unwrap()["cpu"],
            Quantity("250m".to_string())
        );
        assert_eq!(
            resources.limits.as_ref().unwrap()["memory"],
            Quantity("256Mi".to_string())
        );
        assert_eq!(pod.image_pull_secrets.unwrap()[0].name, "acr-secret");
        assert_eq!(
            deployment.metadata.labels.unwrap().get(MANAGED_BY_LABEL).map(String::as_str),
            Some(FIELD_MANAGER)
        );
    }

    #[test]
    fn story_workload_without_resources_or_secret_renders_none() {
        let mut spec = spec(1);
        spec.pod_template.resources = ResourceRequirements::default();
        spec.pod_template.pull_secret_ref = None;

        let pod = WorkloadDeployer::build("myapp", &spec)
            .spec
            .unwrap()
            .template
            .spec
            .unwrap();
        assert!(pod.containers[0].resources.is_none());
        assert!(pod.image_pull_secrets.is_none());
    }

    // =========================================================================
    // Story Tests: Diffing
    // =========================================================================

    #[test]
    fn story_server_normalized_quantities_are_not_a_change() {
        let mut current = live(&spec(2), 2);
        let container = &mut current.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers[0];
        let resources = container.resources.as_mut().unwrap();
        resources
            .limits
            .as_mut()
            .unwrap()
            .insert("cpu".to_string(), Quantity("1000m".to_string()));

        assert!(changed_fields(&current, &spec(2)).is_empty());
    }

    #[test]
    fn story_each_tracked_field_is_detected() {
        let current = live(&spec(2), 2);

        assert_eq!(changed_fields(&current, &spec(3)), vec!["replicas"]);

        let mut image = spec(2);
        image.pod_template.image = "myregistry.azurecr.io/myapp:2.0".to_string();
        assert_eq!(changed_fields(&current, &image), vec!["image"]);

        let mut resources = spec(2);
        resources.pod_template.resources.limits.memory = Some("512Mi".to_string());
        assert_eq!(changed_fields(&current, &resources), vec!["resources"]);

        let mut secret = spec(2);
        secret.pod_template.pull_secret_ref = Some("other-secret".to_string());
        assert_eq!(changed_fields(&current, &secret), vec!["pullSecret"]);
    }

    // =========================================================================
    // Story Tests: Ensure
    // =========================================================================

    #[tokio::test]
    async fn story_missing_workload_is_created() {
        let mut api = MockClusterApi::new();
        api.expect_get_deployment().returning(|_, _| Ok(None));
        api.expect_create_deployment()
            .times(1)
            .withf(|ns, d| ns == "myapp" && d.metadata.name.as_deref() == Some("myapp-deployment"))
            .returning(|_, d| Ok(d.clone()));

        let result = deployer()
            .ensure(&client(api), "myapp", &spec(2), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.action, ApplyAction::Created);
        assert_eq!(result.desired_replicas, 2);
        assert!(!result.degraded);
    }

    /// Story: a second identical ensure performs zero mutating calls
    #[tokio::test]
    async fn story_identical_workload_is_not_touched() {
        let mut api = MockClusterApi::new();
        api.expect_get_deployment()
            .returning(|_, _| Ok(Some(live(&spec(2), 2))));
        api.expect_create_deployment().times(0);
        api.expect_replace_deployment().times(0);

        let result = deployer()
            .ensure(&client(api), "myapp", &spec(2), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.action, ApplyAction::Unchanged);
        assert_eq!(result.ready_replicas, 2);
    }

    /// Story: scaling 2 -> 3 replaces the object with a surge-only rollout
    #[tokio::test]
    async fn story_scale_up_rolls_forward_without_unavailability() {
        let mut api = MockClusterApi::new();
        api.expect_get_deployment()
            .returning(|_, _| Ok(Some(live(&spec(2), 2))));
        api.expect_replace_deployment()
            .times(1)
            .withf(|_, d| {
                let s = d.spec.as_ref().unwrap();
                let rolling = s.strategy.as_ref().unwrap().rolling_update.as_ref().unwrap();
                s.replicas == Some(3)
                    && rolling.max_unavailable == Some(IntOrString::Int(0))
                    && d.metadata.resource_version.as_deref() == Some("7")
            })
            .returning(|_, d| Ok(d.clone()));

        let result = deployer()
            .ensure(&client(api), "myapp", &spec(3), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.action, ApplyAction::Updated);
        assert_eq!(result.desired_replicas, 3);
    }

    #[tokio::test]
    async fn story_changed_selector_is_a_conflict() {
        let mut api = MockClusterApi::new();
        api.expect_get_deployment().returning(|_, _| {
            let mut current = live(&spec(2), 2);
            current.spec.as_mut().unwrap().selector.match_labels =
                Some(BTreeMap::from([("app".to_string(), "legacy".to_string())]));
            Ok(Some(current))
        });
        api.expect_replace_deployment().times(0);

        let err = deployer()
            .ensure(&client(api), "myapp", &spec(2), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ApplyConflict { .. }));
    }

    /// Story: selector mismatch is detected before any remote call
    #[tokio::test]
    async fn story_selector_mismatch_makes_no_calls() {
        let api = MockClusterApi::new();
        let mut spec = spec(2);
        spec.selector_labels.insert("tier".to_string(), "web".to_string());

        let err = deployer()
            .ensure(&client(api), "myapp", &spec, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SelectorMismatch { .. }));
    }

    #[tokio::test]
    async fn story_requests_above_limits_make_no_calls() {
        let api = MockClusterApi::new();
        let mut spec = spec(2);
        spec.pod_template.resources.requests.cpu = Some("2".to_string());

        let err = deployer()
            .ensure(&client(api), "myapp", &spec, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidResourceSpec(_)));
    }

    // =========================================================================
    // Story Tests: Readiness
    // =========================================================================

    #[tokio::test]
    async fn story_wait_returns_once_rollout_completes() {
        let reads = Arc::new(AtomicU32::new(0));
        let r = reads.clone();

        let mut api = MockClusterApi::new();
        api.expect_get_deployment().returning(move |_, _| {
            Ok(Some(match r.fetch_add(1, Ordering::SeqCst) {
                0 => live(&spec(2), 2),
                1 => live(&spec(3), 2),
                _ => live(&spec(3), 3),
            }))
        });
        api.expect_replace_deployment()
            .times(1)
            .returning(|_, d| Ok(d.clone()));

        let result = deployer()
            .wait_for_ready(PollConfig::new(Duration::from_secs(5), Duration::from_millis(1)))
            .ensure(&client(api), "myapp", &spec(3), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.ready_replicas, 3);
        assert!(!result.degraded);
    }

    /// Story: partial readiness after the deadline is degraded success
    #[tokio::test(start_paused = true)]
    async fn story_partial_readiness_is_degraded_not_failed() {
        let reads = Arc::new(AtomicU32::new(0));
        let r = reads.clone();

        let mut api = MockClusterApi::new();
        api.expect_get_deployment().returning(move |_, _| {
            Ok(match r.fetch_add(1, Ordering::SeqCst) {
                0 => None,
                _ => Some(live(&spec(3), 1)),
            })
        });
        api.expect_create_deployment()
            .times(1)
            .returning(|_, d| Ok(d.clone()));

        let result = deployer()
            .wait_for_ready(PollConfig::new(Duration::from_secs(300), Duration::from_secs(5)))
            .ensure(&client(api), "myapp", &spec(3), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.degraded);
        assert_eq!(result.ready_replicas, 1);
        assert_eq!(result.action, ApplyAction::Created);
    }

    #[tokio::test]
    async fn story_cancelled_wait_reports_cancellation() {
        let mut api = MockClusterApi::new();
        api.expect_get_deployment()
            .returning(|_, _| Ok(Some(live(&spec(2), 2))));

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = deployer()
            .wait_for_ready(PollConfig::new(Duration::from_secs(5), Duration::from_millis(1)))
            .ensure(&client(api), "myapp", &spec(2), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[test]
    fn story_stale_generation_is_not_rolled_out() {
        let mut deployment = live(&spec(2), 2);
        deployment.metadata.generation = Some(4);
        assert!(!WorkloadStatus::from_deployment(&deployment).rolled_out);
    }
}
