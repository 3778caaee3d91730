//! Namespace stage

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::ObjectMeta;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::cluster::ClusterClient;
use crate::model::validate_dns_label;
use crate::retry::{retry_transient, RetryConfig};
use crate::{ApplyAction, Error, FIELD_MANAGER, MANAGED_BY_LABEL};

/// Result of ensuring a namespace
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnsuredNamespace {
    /// Namespace name
    pub name: String,
    /// What had to be done
    pub action: ApplyAction,
}

/// Ensures target namespaces exist
#[derive(Clone, Debug, Default)]
pub struct NamespaceManager {
    retry: RetryConfig,
}

/// True if kubebox created the namespace and may delete it
///
/// Namespaces that existed before the first deploy are adopted without the
/// label and are never deleted by teardown.
pub fn is_managed(namespace: &Namespace) -> bool {
    namespace
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(MANAGED_BY_LABEL))
        .is_some_and(|value| value == FIELD_MANAGER)
}

impl NamespaceManager {
    /// Create a manager that retries transient read failures with `retry`
    pub fn new(retry: RetryConfig) -> Self {
        Self { retry }
    }

    /// Build the namespace object kubebox creates
    pub fn build(name: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([(
                    MANAGED_BY_LABEL.to_string(),
                    FIELD_MANAGER.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Return the namespace unchanged if it exists, otherwise create it
    #[instrument(skip(self, client, cancel))]
    pub async fn ensure(
        &self,
        client: &ClusterClient,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<EnsuredNamespace, Error> {
        validate_dns_label(name, "namespace")?;
        let api = client.api();
        let read = || {
            retry_transient(&self.retry, cancel, "get_namespace", || api.get_namespace(name))
        };

        if read().await?.is_some() {
            debug!("Namespace exists");
            return Ok(EnsuredNamespace {
                name: name.to_string(),
                action: ApplyAction::Unchanged,
            });
        }

        match api.create_namespace(&Self::build(name)).await {
            Ok(_) => {
                info!("Created namespace");
                Ok(EnsuredNamespace {
                    name: name.to_string(),
                    action: ApplyAction::Created,
                })
            }
            // Created concurrently by someone else between our read and create
            Err(conflict @ Error::ApplyConflict { .. }) => match read().await? {
                Some(_) => Ok(EnsuredNamespace {
                    name: name.to_string(),
                    action: ApplyAction::Unchanged,
                }),
                None => Err(conflict),
            },
            Err(e) => Err(e),
        }
    }
}
