//! Error types for the kubebox pipeline
//!
//! Every failure the pipeline can surface is a variant of [`Error`]. Variants are
//! grouped into an [`ErrorCategory`] which decides the process exit code and
//! whether the failure happened before or after any remote call was made.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

/// Main error type for kubebox operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The cloud API could not be reached (connect failure or timeout)
    #[error("cloud API unreachable: {0}")]
    CloudUnreachable(String),

    /// Cloud provisioning API returned an error that is not a terminal
    /// provisioning state (HTTP failure, throttling, malformed response).
    /// Without a status the response was unusable and retrying will not help.
    #[error("cloud API error{}: {message}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Cloud {
        /// HTTP status, if the request reached the API
        status: Option<u16>,
        /// Description of what failed
        message: String,
    },

    /// Cluster or registry did not reach a terminal state before the deadline
    #[error("provisioning of {resource} timed out after {waited:?}")]
    ProvisioningTimeout {
        /// Resource being provisioned (e.g. "cluster c1")
        resource: String,
        /// How long the pipeline waited
        waited: Duration,
    },

    /// Cloud reported a terminal failure for a provisioning operation
    #[error("provisioning of {resource} failed: {reason}")]
    ProvisioningFailed {
        /// Resource being provisioned
        resource: String,
        /// Reason reported by the cloud API
        reason: String,
    },

    /// Connection material could not be decoded or the API host was unreachable
    #[error("invalid cluster credentials: {0}")]
    InvalidCredentials(String),

    /// Workload selector does not equal its pod template labels
    #[error("workload '{workload}' selector {selector:?} does not match pod template labels {labels:?}")]
    SelectorMismatch {
        /// Workload name
        workload: String,
        /// Declared selector labels
        selector: BTreeMap<String, String>,
        /// Declared pod template labels
        labels: BTreeMap<String, String>,
    },

    /// Resource requests/limits are malformed or requests exceed limits
    #[error("invalid resource spec: {0}")]
    InvalidResourceSpec(String),

    /// Object was modified concurrently or an immutable field differs
    #[error("apply conflict on {kind} '{name}': {message}")]
    ApplyConflict {
        /// Object kind
        kind: String,
        /// Object name
        name: String,
        /// Description of the conflict
        message: String,
    },

    /// Operation was cancelled before completion
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Validation error for pipeline inputs
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration could not be loaded or a required input is missing
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Coarse failure class used for exit codes and pipeline reporting
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Detected locally before any remote call; no partial state exists
    Validation,
    /// Cloud-side provisioning failed
    Provisioning,
    /// In-cluster configuration failed
    Deployment,
    /// Cancelled by the caller
    Cancelled,
}

impl ErrorCategory {
    /// Process exit code for this category
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Validation => 2,
            Self::Provisioning => 3,
            Self::Deployment => 4,
            Self::Cancelled => 130,
        }
    }
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an invalid-resource-spec error with the given message
    pub fn invalid_resource_spec(msg: impl Into<String>) -> Self {
        Self::InvalidResourceSpec(msg.into())
    }

    /// Create an invalid-credentials error with the given message
    pub fn invalid_credentials(msg: impl Into<String>) -> Self {
        Self::InvalidCredentials(msg.into())
    }

    /// Create a cloud API error
    pub fn cloud(status: Option<u16>, msg: impl Into<String>) -> Self {
        Self::Cloud {
            status,
            message: msg.into(),
        }
    }

    /// Create an error for a cloud request that never got a response
    pub fn cloud_unreachable(msg: impl Into<String>) -> Self {
        Self::CloudUnreachable(msg.into())
    }

    /// Create an apply conflict error
    pub fn apply_conflict(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::ApplyConflict {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a cancellation error for the named operation
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled(operation.into())
    }

    /// Failure class of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Validation(_)
            | Error::Config(_)
            | Error::SelectorMismatch { .. }
            | Error::InvalidResourceSpec(_) => ErrorCategory::Validation,
            Error::Cloud { .. }
            | Error::CloudUnreachable(_)
            | Error::ProvisioningTimeout { .. }
            | Error::ProvisioningFailed { .. } => ErrorCategory::Provisioning,
            Error::Kube(_)
            | Error::InvalidCredentials(_)
            | Error::ApplyConflict { .. }
            | Error::Serialization(_) => ErrorCategory::Deployment,
            Error::Cancelled(_) => ErrorCategory::Cancelled,
        }
    }

    /// Check if this error is transient and the operation may be retried
    ///
    /// Connection failures, throttling (429) and server errors (5xx) are
    /// transient. Everything else, including a malformed cloud response,
    /// requires a config or state change.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(ae)) => is_transient_status(ae.code),
            Error::Kube(kube::Error::HyperError(_)) | Error::Kube(kube::Error::Service(_)) => true,
            Error::Kube(_) => false,
            Error::Cloud { status, .. } => status.is_some_and(is_transient_status),
            Error::CloudUnreachable(_) => true,
            _ => false,
        }
    }
}

fn is_transient_status(code: u16) -> bool {
    code == 429 || (500..600).contains(&code)
}
