//! kubebox - provision a managed Kubernetes cluster and deploy onto it
//!
//! kubebox runs a two-phase pipeline: it provisions a managed cluster (and
//! optionally a container registry) in a cloud account, then configures
//! workloads inside that cluster using the credentials provisioning produced.
//!
//! # Pipeline
//!
//! ```text
//! ClusterProvisioner ──► ClientFactory ──► NamespaceManager ──► PullSecretAssembler
//!                                                                      │
//! RegistryProvisioner ────────────────────────────────────────────────┘
//!                                                                      ▼
//!                                          ServiceExposer ◄── WorkloadDeployer
//! ```
//!
//! Every stage is idempotent: re-running converges to the same end state
//! without duplicating resources, and an up-to-date stage performs reads only.
//!
//! # Modules
//!
//! - [`config`] - Pipeline definition (YAML) and credentials
//! - [`model`] - Desired-state types and local validation
//! - [`provider`] - Cloud provisioning API (Azure Resource Manager)
//! - [`provision`] - Cluster and registry provisioners
//! - [`cluster`] - Connection material, cluster API and client factory
//! - [`namespace`], [`pull_secret`], [`workload`], [`service`] - In-cluster stages
//! - [`pipeline`] - Stage ordering, concurrency and reporting
//! - [`teardown`] - Explicit destruction
//! - [`error`] - Error taxonomy and exit codes

#![deny(missing_docs)]

pub mod cluster;
pub mod config;
pub mod error;
pub mod model;
pub mod namespace;
pub mod pipeline;
pub mod provider;
pub mod provision;
pub mod pull_secret;
pub mod retry;
pub mod sensitive;
pub mod service;
pub mod teardown;
pub mod wait;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager recorded on every object kubebox writes
pub const FIELD_MANAGER: &str = "kubebox";

/// Label marking objects created by kubebox
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// What an `ensure` operation had to do to reach the desired state
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum ApplyAction {
    /// The object did not exist and was created
    Created,
    /// The object existed and differed, and was updated
    Updated,
    /// The object already matched; only reads were performed
    Unchanged,
}

impl ApplyAction {
    /// True if a mutating call was made
    pub fn mutated(&self) -> bool {
        !matches!(self, ApplyAction::Unchanged)
    }
}
