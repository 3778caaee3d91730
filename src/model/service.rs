//! Load-balanced service desired state

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::validate_dns_label;
use crate::Error;

/// How the service is reachable
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExposureMode {
    /// Cloud load balancer with an external address
    #[default]
    LoadBalancer,
    /// Cluster-internal address only
    ClusterIP,
    /// Port on every node
    NodePort,
}

impl ExposureMode {
    /// Kubernetes service type
    pub fn as_str(&self) -> &'static str {
        match self {
            ExposureMode::LoadBalancer => "LoadBalancer",
            ExposureMode::ClusterIP => "ClusterIP",
            ExposureMode::NodePort => "NodePort",
        }
    }

    /// Whether this mode gets an external address assigned
    pub fn has_external_address(&self) -> bool {
        matches!(self, ExposureMode::LoadBalancer)
    }
}

/// Routing of external traffic to node-local or cluster-wide endpoints
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExternalTrafficPolicy {
    /// Preserve client source IPs; only nodes with ready pods receive traffic
    Local,
    /// Any node forwards traffic
    Cluster,
}

impl ExternalTrafficPolicy {
    /// Kubernetes wire value
    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalTrafficPolicy::Local => "Local",
            ExternalTrafficPolicy::Cluster => "Cluster",
        }
    }
}

/// A listen port forwarded to a container port
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    /// Port the service listens on
    pub listen_port: u16,
    /// Port on the selected pods
    pub target_port: u16,
}

/// Desired service in front of a workload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Service name
    pub name: String,
    /// Labels selecting the backing pods
    pub selector_labels: BTreeMap<String, String>,
    /// Primary port
    pub port_mapping: PortMapping,
    /// Additional ports, exposed as `dev-<listen port>`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_ports: Vec<PortMapping>,
    /// Service type
    #[serde(default)]
    pub exposure_mode: ExposureMode,
    /// Source ranges allowed through the load balancer; empty means any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_source_cidrs: Vec<String>,
    /// External traffic policy; the cluster default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_traffic_policy: Option<ExternalTrafficPolicy>,
}

/// Name of the primary service port
pub const PRIMARY_PORT_NAME: &str = "http";

impl ServiceSpec {
    /// All ports with their names, primary first
    pub fn named_ports(&self) -> Vec<(String, PortMapping)> {
        std::iter::once((PRIMARY_PORT_NAME.to_string(), self.port_mapping))
            .chain(
                self.extra_ports
                    .iter()
                    .map(|p| (format!("dev-{}", p.listen_port), *p)),
            )
            .collect()
    }

    /// Validate the service without any remote call
    pub fn validate(&self) -> Result<(), Error> {
        validate_dns_label(&self.name, "service name")?;

        if self.selector_labels.is_empty() {
            return Err(Error::validation(format!(
                "service '{}' must declare at least one selector label",
                self.name
            )));
        }

        let mut seen = BTreeSet::new();
        for (name, port) in self.named_ports() {
            if port.listen_port == 0 || port.target_port == 0 {
                return Err(Error::validation(format!(
                    "service '{}' port '{}': ports must be between 1 and 65535",
                    self.name, name
                )));
            }
            if !seen.insert(port.listen_port) {
                return Err(Error::validation(format!(
                    "service '{}' declares listen port {} more than once",
                    self.name, port.listen_port
                )));
            }
        }

        for cidr in &self.allowed_source_cidrs {
            validate_cidr(cidr)?;
        }

        if !self.exposure_mode.has_external_address()
            && (!self.allowed_source_cidrs.is_empty() || self.external_traffic_policy.is_some())
        {
            return Err(Error::validation(format!(
                "service '{}': allowedSourceCidrs and externalTrafficPolicy require exposure mode LoadBalancer",
                self.name
            )));
        }

        Ok(())
    }

    /// True if every selector label is present with the same value in `pod_labels`
    pub fn selects(&self, pod_labels: &BTreeMap<String, String>) -> bool {
        self.selector_labels
            .iter()
            .all(|(k, v)| pod_labels.get(k) == Some(v))
    }
}

fn validate_cidr(cidr: &str) -> Result<(), Error> {
    let invalid = || Error::validation(format!("'{cidr}' is not a valid CIDR"));

    let (addr, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(invalid());
    }
    Ok(())
}
