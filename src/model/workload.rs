//! Replicated workload desired state

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::quantity::{parse_cpu_millis, parse_memory_bytes};
use super::validate_dns_label;
use crate::Error;

/// CPU and memory amounts, as Kubernetes quantity strings
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceQuantity {
    /// CPU (e.g. "250m", "1")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Memory (e.g. "128Mi", "1Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

impl ResourceQuantity {
    /// True if neither CPU nor memory is set
    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.memory.is_none()
    }

    /// As a Kubernetes resource map, omitting unset entries
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        if let Some(cpu) = &self.cpu {
            map.insert("cpu".to_string(), cpu.clone());
        }
        if let Some(memory) = &self.memory {
            map.insert("memory".to_string(), memory.clone());
        }
        map
    }
}

/// Container resource requests and limits
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    /// Guaranteed resources
    #[serde(default)]
    pub requests: ResourceQuantity,
    /// Maximum resources
    #[serde(default)]
    pub limits: ResourceQuantity,
}

impl ResourceRequirements {
    /// Check that every quantity parses and requests do not exceed limits
    ///
    /// A component missing from either side is not compared.
    pub fn validate(&self) -> Result<(), Error> {
        let cpu = |q: &Option<String>| {
            q.as_deref()
                .map(parse_cpu_millis)
                .transpose()
                .map_err(Error::invalid_resource_spec)
        };
        let memory = |q: &Option<String>| {
            q.as_deref()
                .map(parse_memory_bytes)
                .transpose()
                .map_err(Error::invalid_resource_spec)
        };

        if let (Some(request), Some(limit)) = (cpu(&self.requests.cpu)?, cpu(&self.limits.cpu)?) {
            if request > limit {
                return Err(Error::invalid_resource_spec(format!(
                    "cpu request {}m exceeds cpu limit {}m",
                    request, limit
                )));
            }
        }

        if let (Some(request), Some(limit)) = (
            memory(&self.requests.memory)?,
            memory(&self.limits.memory)?,
        ) {
            if request > limit {
                return Err(Error::invalid_resource_spec(format!(
                    "memory request {} exceeds memory limit {}",
                    self.requests.memory.as_deref().unwrap_or_default(),
                    self.limits.memory.as_deref().unwrap_or_default()
                )));
            }
        }

        Ok(())
    }
}

/// Template for the workload's pods
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplate {
    /// Labels applied to every pod
    pub labels: BTreeMap<String, String>,
    /// Container image reference
    pub image: String,
    /// Port the container listens on
    pub container_port: u16,
    /// Resource requests and limits
    #[serde(default)]
    pub resources: ResourceRequirements,
    /// Name of the pull secret used to fetch the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secret_ref: Option<String>,
}

/// Desired replicated workload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    /// Workload name
    pub name: String,
    /// Desired number of pods
    #[serde(default = "default_replicas")]
    pub replica_count: i32,
    /// Labels selecting the workload's pods; must equal the template labels
    pub selector_labels: BTreeMap<String, String>,
    /// Pod template
    pub pod_template: PodTemplate,
}

fn default_replicas() -> i32 {
    1
}

impl WorkloadSpec {
    /// Validate the workload without any remote call
    ///
    /// Selector consistency is checked first, then resource quantities.
    pub fn validate(&self) -> Result<(), Error> {
        if self.selector_labels != self.pod_template.labels {
            return Err(Error::SelectorMismatch {
                workload: self.name.clone(),
                selector: self.selector_labels.clone(),
                labels: self.pod_template.labels.clone(),
            });
        }

        validate_dns_label(&self.name, "workload name")?;

        if self.selector_labels.is_empty() {
            return Err(Error::validation(format!(
                "workload '{}' must declare at least one selector label",
                self.name
            )));
        }
        if self.replica_count < 0 {
            return Err(Error::validation(format!(
                "workload '{}': replica_count must not be negative",
                self.name
            )));
        }
        if self.pod_template.image.trim().is_empty() {
            return Err(Error::validation(format!(
                "workload '{}': image is required",
                self.name
            )));
        }
        if self.pod_template.container_port == 0 {
            return Err(Error::validation(format!(
                "workload '{}': container_port must be between 1 and 65535",
                self.name
            )));
        }
        if let Some(secret) = &self.pod_template.pull_secret_ref {
            validate_dns_label(secret, "pull secret name")?;
        }

        self.pod_template.resources.validate()
    }
}
