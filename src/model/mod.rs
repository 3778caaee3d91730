//! Desired-state types for the pipeline
//!
//! These are the inputs the pipeline converges the cloud account and the
//! cluster towards. All of them validate locally, without any remote call, so
//! that misconfigurations fail before partial state is created.

mod cluster;
mod quantity;
mod service;
mod workload;

pub use cluster::{
    IdentityMode, ManagedClusterSpec, NodePool, RegistrySku, RegistrySpec, ResourceGroup,
};
pub use quantity::{parse_cpu_millis, parse_memory_bytes};
pub use service::{ExposureMode, ExternalTrafficPolicy, PortMapping, ServiceSpec};
pub use workload::{PodTemplate, ResourceQuantity, ResourceRequirements, WorkloadSpec};

use crate::Error;

/// Validate a DNS-1123 label (namespaces, object names, label-safe identifiers)
///
/// Lowercase alphanumerics and '-', starting and ending with an alphanumeric,
/// at most 63 characters.
pub fn validate_dns_label(value: &str, what: &str) -> Result<(), Error> {
    if value.is_empty() || value.len() > 63 {
        return Err(Error::validation(format!(
            "{what} '{value}' must be between 1 and 63 characters"
        )));
    }

    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let starts_ok = value.starts_with(|c: char| c.is_ascii_alphanumeric());
    let ends_ok = value.ends_with(|c: char| c.is_ascii_alphanumeric());

    if !(valid_chars && starts_ok && ends_ok) {
        return Err(Error::validation(format!(
            "{what} '{value}' must consist of lowercase alphanumerics or '-', and start and end with an alphanumeric"
        )));
    }

    Ok(())
}
