//! Service exposure stage
//!
//! Renders a [`ServiceSpec`] as a core/v1 Service and converges it with
//! whole-object create/replace. Server-allocated fields (cluster IPs, node
//! ports, health check port) are carried over on replace so an update never
//! reallocates them. For load balancers, the external address wait is bounded
//! and an unassigned address is reported as pending rather than failing.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec as KubeServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cluster::ClusterClient;
use crate::model::{validate_dns_label, ExposureMode, ServiceSpec};
use crate::retry::{retry_transient, RetryConfig};
use crate::wait::{poll_until, PollConfig, PollOutcome};
use crate::{ApplyAction, Error, FIELD_MANAGER, MANAGED_BY_LABEL};

/// Result of ensuring a service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExposedService {
    /// Service name
    pub name: String,
    /// Namespace holding the service
    pub namespace: String,
    /// What had to be done
    pub action: ApplyAction,
    /// Load balancer IP or hostname, once assigned
    pub external_address: Option<String>,
    /// True for a load balancer whose address was not assigned in time
    pub pending_external_address: bool,
}

/// Observed state of an existing service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceStatus {
    /// Kubernetes service type
    pub service_type: String,
    /// Load balancer IP or hostname, if assigned
    pub external_address: Option<String>,
}

/// Ensures a service selecting a workload's pods exists and matches its spec
#[derive(Clone, Debug)]
pub struct ServiceExposer {
    address_wait: Option<PollConfig>,
    retry: RetryConfig,
}

impl ServiceExposer {
    /// Create an exposer that does not wait for an external address
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            address_wait: None,
            retry,
        }
    }

    /// Poll up to `poll.timeout` for a load balancer address
    pub fn wait_for_external_address(mut self, poll: PollConfig) -> Self {
        self.address_wait = Some(poll);
        self
    }

    /// Render the service for `spec` in `namespace`
    pub fn build(namespace: &str, spec: &ServiceSpec) -> Service {
        let ports = spec
            .named_ports()
            .into_iter()
            .map(|(name, mapping)| ServicePort {
                name: Some(name),
                port: i32::from(mapping.listen_port),
                target_port: Some(IntOrString::Int(i32::from(mapping.target_port))),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            })
            .collect();

        Service {
            metadata: ObjectMeta {
                name: Some(spec.name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    MANAGED_BY_LABEL.to_string(),
                    FIELD_MANAGER.to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(KubeServiceSpec {
                type_: Some(spec.exposure_mode.as_str().to_string()),
                selector: Some(spec.selector_labels.clone()),
                ports: Some(ports),
                load_balancer_source_ranges: (!spec.allowed_source_cidrs.is_empty())
                    .then(|| spec.allowed_source_cidrs.clone()),
                external_traffic_policy: spec
                    .external_traffic_policy
                    .map(|p| p.as_str().to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Create the service, replace it if it differs, or leave it
    #[instrument(skip(self, client, spec, cancel), fields(service = %spec.name))]
    pub async fn ensure(
        &self,
        client: &ClusterClient,
        namespace: &str,
        spec: &ServiceSpec,
        cancel: &CancellationToken,
    ) -> Result<ExposedService, Error> {
        spec.validate()?;
        validate_dns_label(namespace, "namespace")?;
        if cancel.is_cancelled() {
            return Err(Error::cancelled(format!("service {}", spec.name)));
        }

        let api = client.api();
        let desired = Self::build(namespace, spec);

        let existing = retry_transient(&self.retry, cancel, "get_service", || {
            api.get_service(namespace, &spec.name)
        })
        .await?;

        let (action, applied) = match existing {
            None => {
                let created = api.create_service(namespace, &desired).await?;
                info!(mode = spec.exposure_mode.as_str(), "Created service");
                (ApplyAction::Created, created)
            }
            Some(current) => {
                let changes = changed_fields(&current, spec);
                if changes.is_empty() {
                    debug!("Service matches desired state");
                    (ApplyAction::Unchanged, current)
                } else {
                    let replacement = carry_allocated(&current, desired, spec.exposure_mode);
                    let replaced = api.replace_service(namespace, &replacement).await?;
                    info!(changed = ?changes, "Replaced service");
                    (ApplyAction::Updated, replaced)
                }
            }
        };

        let mut external_address = external_address(&applied);
        if spec.exposure_mode.has_external_address() && external_address.is_none() {
            if let Some(poll) = &self.address_wait {
                external_address = self.wait_for_address(client, namespace, spec, poll, cancel).await?;
            }
        }

        let pending = spec.exposure_mode.has_external_address() && external_address.is_none();
        match &external_address {
            Some(address) => info!(address = %address, "Service reachable"),
            None if pending => warn!("External address not assigned yet"),
            None => {}
        }

        Ok(ExposedService {
            name: spec.name.clone(),
            namespace: namespace.to_string(),
            action,
            external_address,
            pending_external_address: pending,
        })
    }

    /// Current type and address, or `None` if the service does not exist
    pub async fn observe(
        client: &ClusterClient,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceStatus>, Error> {
        Ok(client
            .api()
            .get_service(namespace, name)
            .await?
            .map(|service| ServiceStatus {
                service_type: service
                    .spec
                    .as_ref()
                    .and_then(|s| s.type_.clone())
                    .unwrap_or_else(|| ExposureMode::ClusterIP.as_str().to_string()),
                external_address: external_address(&service),
            }))
    }

    async fn wait_for_address(
        &self,
        client: &ClusterClient,
        namespace: &str,
        spec: &ServiceSpec,
        poll: &PollConfig,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, Error> {
        let api = client.api();
        let operation = format!("service {} external address", spec.name);

        let outcome = poll_until(poll, &operation, cancel, || async {
            let current = retry_transient(&self.retry, cancel, "get_service", || {
                api.get_service(namespace, &spec.name)
            })
            .await?;
            Ok(current.as_ref().and_then(external_address))
        })
        .await?;

        Ok(match outcome {
            PollOutcome::Ready(address) => Some(address),
            PollOutcome::TimedOut => None,
        })
    }
}

/// First load balancer ingress IP or hostname
pub fn external_address(service: &Service) -> Option<String> {
    service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .iter()
        .find_map(|ingress| ingress.ip.clone().or_else(|| ingress.hostname.clone()))
        .filter(|address| !address.is_empty())
}

/// Fields of `current` that differ from `spec`, empty when up to date
fn changed_fields(current: &Service, spec: &ServiceSpec) -> Vec<&'static str> {
    let mut changes = Vec::new();
    let Some(live) = current.spec.as_ref() else {
        return vec!["spec"];
    };

    let live_type = live.type_.as_deref().unwrap_or(ExposureMode::ClusterIP.as_str());
    if live_type != spec.exposure_mode.as_str() {
        changes.push("exposureMode");
    }

    if live.selector.as_ref() != Some(&spec.selector_labels) {
        changes.push("selector");
    }

    let live_ports: BTreeSet<(String, i32, Option<i32>)> = live
        .ports
        .iter()
        .flatten()
        .map(|p| {
            let target = match &p.target_port {
                Some(IntOrString::Int(port)) => Some(*port),
                Some(IntOrString::String(_)) => None,
                None => Some(p.port),
            };
            (p.name.clone().unwrap_or_default(), p.port, target)
        })
        .collect();
    let desired_ports: BTreeSet<(String, i32, Option<i32>)> = spec
        .named_ports()
        .into_iter()
        .map(|(name, m)| {
            (
                name,
                i32::from(m.listen_port),
                Some(i32::from(m.target_port)),
            )
        })
        .collect();
    if live_ports != desired_ports {
        changes.push("ports");
    }

    let live_ranges: BTreeSet<&str> = live
        .load_balancer_source_ranges
        .iter()
        .flatten()
        .map(String::as_str)
        .collect();
    let desired_ranges: BTreeSet<&str> =
        spec.allowed_source_cidrs.iter().map(String::as_str).collect();
    if live_ranges != desired_ranges {
        changes.push("allowedSourceCidrs");
    }

    if let Some(policy) = spec.external_traffic_policy {
        if live.external_traffic_policy.as_deref() != Some(policy.as_str()) {
            changes.push("externalTrafficPolicy");
        }
    }

    changes
}

/// Copy server-allocated fields from `current` into `desired`
fn carry_allocated(current: &Service, mut desired: Service, mode: ExposureMode) -> Service {
    desired.metadata.resource_version = current.metadata.resource_version.clone();

    let (Some(live), Some(spec)) = (current.spec.as_ref(), desired.spec.as_mut()) else {
        return desired;
    };

    spec.cluster_ip = live.cluster_ip.clone();
    spec.cluster_ips = live.cluster_ips.clone();
    spec.ip_families = live.ip_families.clone();
    spec.ip_family_policy = live.ip_family_policy.clone();

    if mode != ExposureMode::ClusterIP {
        let node_ports: BTreeMap<i32, i32> = live
            .ports
            .iter()
            .flatten()
            .filter_map(|p| p.node_port.map(|node| (p.port, node)))
            .collect();
        for port in spec.ports.iter_mut().flatten() {
            port.node_port = node_ports.get(&port.port).copied();
        }
    }

    if mode == ExposureMode::LoadBalancer && spec.external_traffic_policy.as_deref() == Some("Local") {
        spec.health_check_node_port = live.health_check_node_port;
    }

    desired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterApi;
    use crate::model::{ExternalTrafficPolicy, PortMapping};
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, ServiceStatus as KubeServiceStatus,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn spec() -> ServiceSpec {
        ServiceSpec {
            name: "myapp-service".to_string(),
            selector_labels: BTreeMap::from([("app".to_string(), "myapp".to_string())]),
            port_mapping: PortMapping {
                listen_port: 80,
                target_port: 8080,
            },
            extra_ports: vec![],
            exposure_mode: ExposureMode::LoadBalancer,
            allowed_source_cidrs: vec![],
            external_traffic_policy: None,
        }
    }

    /// A service as the server returns it: allocated IPs, node ports and maybe an address
    fn live(spec: &ServiceSpec, address: Option<&str>) -> Service {
        let mut service = ServiceExposer::build("myapp", spec);
        service.metadata.resource_version = Some("11".to_string());
        let s = service.spec.as_mut().unwrap();
        s.cluster_ip = Some("10.0.12.7".to_string());
        s.cluster_ips = Some(vec!["10.0.12.7".to_string()]);
        for (i, port) in s.ports.iter_mut().flatten().enumerate() {
            port.node_port = Some(30080 + i as i32);
        }
        service.status = Some(KubeServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: address.map(|ip| {
                    vec![LoadBalancerIngress {
                        ip: Some(ip.to_string()),
                        ..Default::default()
                    }]
                }),
            }),
            ..Default::default()
        });
        service
    }

    fn client(api: MockClusterApi) -> ClusterClient {
        ClusterClient::new(Arc::new(api))
    }

    fn exposer() -> ServiceExposer {
        ServiceExposer::new(RetryConfig::with_max_attempts(1))
    }

    // =========================================================================
    // Story Tests: Rendering
    // =========================================================================

    #[test]
    fn story_rendered_service_names_primary_and_extra_ports() {
        let mut spec = spec();
        spec.extra_ports = vec![PortMapping {
            listen_port: 5678,
            target_port: 5678,
        }];
        spec.allowed_source_cidrs = vec!["203.0.113.0/24".to_string()];
        spec.external_traffic_policy = Some(ExternalTrafficPolicy::Local);

        let rendered = ServiceExposer::build("myapp", &spec).spec.unwrap();
        let ports = rendered.ports.unwrap();

        assert_eq!(rendered.type_.as_deref(), Some("LoadBalancer"));
        assert_eq!(ports[0].name.as_deref(), Some("http"));
        assert_eq!(ports[0].port, 80);
        assert_eq!(ports[0].target_port, Some(IntOrString::Int(8080)));
        assert_eq!(ports[1].name.as_deref(), Some("dev-5678"));
        assert_eq!(
            rendered.load_balancer_source_ranges,
            Some(vec!["203.0.113.0/24".to_string()])
        );
        assert_eq!(rendered.external_traffic_policy.as_deref(), Some("Local"));
    }

    #[test]
    fn story_hostname_ingress_counts_as_address() {
        let mut service = live(&spec(), None);
        service.status.as_mut().unwrap().load_balancer = Some(LoadBalancerStatus {
            ingress: Some(vec![LoadBalancerIngress {
                hostname: Some("myapp.eastus.cloudapp.azure.com".to_string()),
                ..Default::default()
            }]),
        });
        assert_eq!(
            external_address(&service).as_deref(),
            Some("myapp.eastus.cloudapp.azure.com")
        );
    }

    // =========================================================================
    // Story Tests: Ensure
    // =========================================================================

    #[tokio::test]
    async fn story_missing_service_is_created() {
        let mut api = MockClusterApi::new();
        api.expect_get_service().returning(|_, _| Ok(None));
        api.expect_create_service()
            .times(1)
            .returning(|_, s| Ok(s.clone()));

        let result = exposer()
            .ensure(&client(api), "myapp", &spec(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.action, ApplyAction::Created);
        assert!(result.pending_external_address);
    }

    #[tokio::test]
    async fn story_identical_service_is_not_touched() {
        let mut api = MockClusterApi::new();
        api.expect_get_service()
            .returning(|_, _| Ok(Some(live(&spec(), Some("20.1.2.3")))));
        api.expect_create_service().times(0);
        api.expect_replace_service().times(0);

        let result = exposer()
            .ensure(&client(api), "myapp", &spec(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.action, ApplyAction::Unchanged);
        assert_eq!(result.external_address.as_deref(), Some("20.1.2.3"));
        assert!(!result.pending_external_address);
    }

    /// Story: a port change keeps the allocated cluster IP and node ports
    #[tokio::test]
    async fn story_port_change_preserves_allocated_fields() {
        let mut api = MockClusterApi::new();
        api.expect_get_service()
            .returning(|_, _| Ok(Some(live(&spec(), Some("20.1.2.3")))));
        api.expect_replace_service()
            .times(1)
            .withf(|_, s| {
                let spec = s.spec.as_ref().unwrap();
                let port = &spec.ports.as_ref().unwrap()[0];
                s.metadata.resource_version.as_deref() == Some("11")
                    && spec.cluster_ip.as_deref() == Some("10.0.12.7")
                    && port.target_port == Some(IntOrString::Int(9090))
                    && port.node_port == Some(30080)
            })
            .returning(|_, s| Ok(s.clone()));

        let mut changed = spec();
        changed.port_mapping.target_port = 9090;
        let result = exposer()
            .ensure(&client(api), "myapp", &changed, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.action, ApplyAction::Updated);
    }

    #[tokio::test]
    async fn story_address_is_polled_until_assigned() {
        let reads = Arc::new(AtomicU32::new(0));
        let r = reads.clone();

        let mut api = MockClusterApi::new();
        api.expect_get_service().returning(move |_, _| {
            let n = r.fetch_add(1, Ordering::SeqCst);
            Ok(Some(live(&spec(), (n >= 3).then_some("20.1.2.3"))))
        });

        let result = exposer()
            .wait_for_external_address(PollConfig::new(
                Duration::from_secs(5),
                Duration::from_millis(1),
            ))
            .ensure(&client(api), "myapp", &spec(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.external_address.as_deref(), Some("20.1.2.3"));
        assert!(!result.pending_external_address);
    }

    /// Story: no address after 30s is success with the address pending
    #[tokio::test(start_paused = true)]
    async fn story_unassigned_address_is_pending_not_failed() {
        let mut api = MockClusterApi::new();
        api.expect_get_service()
            .returning(|_, _| Ok(Some(live(&spec(), None))));

        let result = exposer()
            .wait_for_external_address(PollConfig::new(
                Duration::from_secs(30),
                Duration::from_secs(2),
            ))
            .ensure(&client(api), "myapp", &spec(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.pending_external_address);
        assert!(result.external_address.is_none());
    }

    #[tokio::test]
    async fn story_cluster_ip_service_never_waits_for_address() {
        let mut internal = spec();
        internal.exposure_mode = ExposureMode::ClusterIP;
        let stored = live(&internal, None);

        let mut api = MockClusterApi::new();
        api.expect_get_service()
            .times(1)
            .returning(move |_, _| Ok(Some(stored.clone())));

        let result = exposer()
            .wait_for_external_address(PollConfig::new(
                Duration::from_secs(30),
                Duration::from_secs(2),
            ))
            .ensure(&client(api), "myapp", &internal, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.action, ApplyAction::Unchanged);
        assert!(!result.pending_external_address);
    }

    #[tokio::test]
    async fn story_invalid_service_makes_no_calls() {
        let api = MockClusterApi::new();
        let mut invalid = spec();
        invalid.allowed_source_cidrs = vec!["not-a-cidr".to_string()];

        let err = exposer()
            .ensure(&client(api), "myapp", &invalid, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
