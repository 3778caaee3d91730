//! Per-stage outcomes and the process exit code derived from them

use std::fmt;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::ErrorCategory;
use crate::namespace::EnsuredNamespace;
use crate::provider::RegistryCredentials;
use crate::provision::{ProvisionedCluster, ProvisionedRegistry};
use crate::pull_secret::EnsuredPullSecret;
use crate::service::ExposedService;
use crate::workload::DeployedWorkload;
use crate::{ApplyAction, Error};

/// A step of the pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Stage {
    /// Resource group and managed cluster
    Cluster,
    /// Container registry, or its credentials when deploying
    Registry,
    /// Authenticated cluster client
    Connect,
    /// App namespace
    Namespace,
    /// Registry pull credential
    PullSecret,
    /// Replicated workload
    Workload,
    /// Service in front of the workload
    Service,
    /// Resource group deletion
    ResourceGroup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Cluster => "cluster",
            Stage::Registry => "registry",
            Stage::Connect => "connect",
            Stage::Namespace => "namespace",
            Stage::PullSecret => "pull-secret",
            Stage::Workload => "workload",
            Stage::Service => "service",
            Stage::ResourceGroup => "resource-group",
        };
        f.write_str(name)
    }
}

/// How a stage ended
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum StageStatus {
    /// Desired state reached
    Succeeded {
        /// What had to be done, for stages that converge an object
        action: Option<ApplyAction>,
        /// Extra information such as an external address
        detail: Option<String>,
    },
    /// Applied, but a bounded wait ended before the object was fully ready
    Degraded {
        /// What had to be done
        action: ApplyAction,
        /// What is not ready yet
        detail: String,
    },
    /// The stage failed
    Failed {
        /// Failure class
        #[serde(skip)]
        category: ErrorCategory,
        /// Error message
        message: String,
    },
    /// Not started because a stage it depends on failed
    Skipped,
    /// Interrupted, or not started because the run was cancelled
    Cancelled,
}

/// Outcome of one stage for one target
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StageReport {
    /// The step
    pub stage: Stage,
    /// What the step acted on (e.g. `myapp/myapp-deployment`)
    pub target: String,
    /// How it ended
    #[serde(flatten)]
    pub status: StageStatus,
}

impl fmt::Display for StageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<14} {:<40} ", self.stage.to_string(), self.target)?;
        match &self.status {
            StageStatus::Succeeded { action, detail } => {
                match action {
                    Some(action) => write!(f, "{action:?}")?,
                    None => write!(f, "Ok")?,
                }
                if let Some(detail) = detail {
                    write!(f, " ({detail})")?;
                }
                Ok(())
            }
            StageStatus::Degraded { action, detail } => write!(f, "{action:?}, degraded ({detail})"),
            StageStatus::Failed { message, .. } => write!(f, "FAILED: {message}"),
            StageStatus::Skipped => write!(f, "skipped"),
            StageStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Stage outcomes in the order the stages finished
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PipelineReport {
    /// One entry per stage and target
    pub stages: Vec<StageReport>,
}

impl PipelineReport {
    /// Record a stage result, returning the value on success
    pub fn record<T: StageOutcome>(
        &mut self,
        stage: Stage,
        target: impl Into<String>,
        result: Result<T, Error>,
    ) -> Option<T> {
        let target = target.into();
        let status = match &result {
            Ok(value) => value.status(),
            Err(Error::Cancelled(_)) => StageStatus::Cancelled,
            Err(e) => StageStatus::Failed {
                category: e.category(),
                message: e.to_string(),
            },
        };

        match &status {
            StageStatus::Succeeded { action, .. } => {
                info!(stage = %stage, target = %target, action = ?action, "Stage succeeded")
            }
            StageStatus::Degraded { detail, .. } => {
                warn!(stage = %stage, target = %target, detail = %detail, "Stage degraded")
            }
            StageStatus::Failed { message, .. } => {
                error!(stage = %stage, target = %target, error = %message, "Stage failed")
            }
            StageStatus::Cancelled => warn!(stage = %stage, target = %target, "Stage cancelled"),
            StageStatus::Skipped => {}
        }

        self.stages.push(StageReport {
            stage,
            target,
            status,
        });
        result.ok()
    }

    /// Record a stage that did not run because an upstream stage did not succeed
    pub fn not_run(&mut self, stage: Stage, target: impl Into<String>, cancelled: bool) {
        self.stages.push(StageReport {
            stage,
            target: target.into(),
            status: if cancelled {
                StageStatus::Cancelled
            } else {
                StageStatus::Skipped
            },
        });
    }

    /// Append another report's stages
    pub fn extend(&mut self, other: PipelineReport) {
        self.stages.extend(other.stages);
    }

    /// The first failed stage, if any
    pub fn first_failure(&self) -> Option<&StageReport> {
        self.stages
            .iter()
            .find(|s| matches!(s.status, StageStatus::Failed { .. }))
    }

    /// True if no stage failed or was cancelled
    pub fn succeeded(&self) -> bool {
        self.stages.iter().all(|s| {
            matches!(
                s.status,
                StageStatus::Succeeded { .. } | StageStatus::Degraded { .. }
            )
        })
    }

    /// True if every stage that converges an object left it untouched
    pub fn is_unchanged(&self) -> bool {
        self.stages.iter().all(|s| match &s.status {
            StageStatus::Succeeded { action, .. } => action.map_or(true, |a| !a.mutated()),
            StageStatus::Degraded { action, .. } => !action.mutated(),
            _ => false,
        })
    }

    /// Process exit code: 0 on success, else the first failure's category code
    pub fn exit_code(&self) -> i32 {
        if let Some(StageReport {
            status: StageStatus::Failed { category, .. },
            ..
        }) = self.first_failure()
        {
            return category.exit_code();
        }
        if self
            .stages
            .iter()
            .any(|s| s.status == StageStatus::Cancelled)
        {
            return ErrorCategory::Cancelled.exit_code();
        }
        0
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for stage in &self.stages {
            writeln!(f, "{stage}")?;
        }
        Ok(())
    }
}

/// A stage result that can be summarized in a report
pub trait StageOutcome {
    /// Status of a successful stage
    fn status(&self) -> StageStatus;
}

fn converged(action: ApplyAction, detail: Option<String>) -> StageStatus {
    StageStatus::Succeeded {
        action: Some(action),
        detail,
    }
}

impl StageOutcome for ProvisionedCluster {
    fn status(&self) -> StageStatus {
        converged(self.action, None)
    }
}

impl StageOutcome for ProvisionedRegistry {
    fn status(&self) -> StageStatus {
        converged(self.action, Some(self.login_server.clone()))
    }
}

impl StageOutcome for RegistryCredentials {
    fn status(&self) -> StageStatus {
        StageStatus::Succeeded {
            action: None,
            detail: Some(self.login_server.clone()),
        }
    }
}

impl StageOutcome for crate::cluster::ClusterClient {
    fn status(&self) -> StageStatus {
        StageStatus::Succeeded {
            action: None,
            detail: None,
        }
    }
}

impl StageOutcome for EnsuredNamespace {
    fn status(&self) -> StageStatus {
        converged(self.action, None)
    }
}

impl StageOutcome for EnsuredPullSecret {
    fn status(&self) -> StageStatus {
        converged(self.action, Some(self.registry_host.clone()))
    }
}

impl StageOutcome for DeployedWorkload {
    fn status(&self) -> StageStatus {
        let ready = format!("{}/{} ready", self.ready_replicas, self.desired_replicas);
        if self.degraded {
            StageStatus::Degraded {
                action: self.action,
                detail: ready,
            }
        } else {
            converged(self.action, Some(ready))
        }
    }
}

impl StageOutcome for ExposedService {
    fn status(&self) -> StageStatus {
        match &self.external_address {
            Some(address) => converged(self.action, Some(address.clone())),
            None if self.pending_external_address => StageStatus::Degraded {
                action: self.action,
                detail: "external address pending".to_string(),
            },
            None => converged(self.action, None),
        }
    }
}

/// Outcome of a deletion
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deleted;

impl StageOutcome for Deleted {
    fn status(&self) -> StageStatus {
        StageStatus::Succeeded {
            action: None,
            detail: Some("deleted".to_string()),
        }
    }
}

/// An object teardown left in place because kubebox did not create it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Retained;

impl StageOutcome for Retained {
    fn status(&self) -> StageStatus {
        StageStatus::Succeeded {
            action: None,
            detail: Some("kept, not managed by kubebox".to_string()),
        }
    }
}
