//! Cluster control-plane operations

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Secret, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::{Error, FIELD_MANAGER};

/// Namespace, secret, deployment and service operations, scoped by namespace and name
///
/// `get_*` returns `Ok(None)` for missing objects and `delete_*` succeeds for
/// objects that are already gone. `replace_*` sends the whole object, including
/// its `resourceVersion`; a concurrent modification or a rejected immutable
/// field change surfaces as [`Error::ApplyConflict`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Read a namespace
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error>;
    /// Create a namespace
    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, Error>;
    /// Delete a namespace and everything in it
    async fn delete_namespace(&self, name: &str) -> Result<(), Error>;

    /// Read a secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;
    /// Create a secret
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, Error>;
    /// Replace a secret as a whole object
    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, Error>;
    /// Delete a secret; a missing secret is not an error
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Read a deployment
    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Option<Deployment>, Error>;
    /// Create a deployment
    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, Error>;
    /// Replace a deployment as a whole object
    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, Error>;
    /// Delete a deployment
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Read a service
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;
    /// Create a service
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service, Error>;
    /// Replace a service as a whole object
    async fn replace_service(&self, namespace: &str, service: &Service) -> Result<Service, Error>;
    /// Delete a service
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// [`ClusterApi`] backed by a kube-rs client
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn post_params() -> PostParams {
    PostParams {
        dry_run: false,
        field_manager: Some(FIELD_MANAGER.to_string()),
    }
}

fn object_name<K: Resource>(obj: &K) -> Result<String, Error> {
    obj.meta()
        .name
        .clone()
        .ok_or_else(|| Error::validation("object has no metadata.name"))
}

/// Map write failures: 409 (stale resourceVersion, already exists) and 422
/// (immutable field changed) become apply conflicts
fn write_error(err: kube::Error, kind: &str, name: &str) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 409 || ae.code == 422 => {
            Error::apply_conflict(kind, name, ae.message)
        }
        other => Error::Kube(other),
    }
}

async fn create<K>(api: &Api<K>, kind: &str, obj: &K) -> Result<K, Error>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    let name = object_name(obj)?;
    debug!(kind = %kind, name = %name, "creating");
    api.create(&post_params(), obj)
        .await
        .map_err(|e| write_error(e, kind, &name))
}

async fn replace<K>(api: &Api<K>, kind: &str, obj: &K) -> Result<K, Error>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    let name = object_name(obj)?;
    debug!(kind = %kind, name = %name, "replacing");
    api.replace(&name, &post_params(), obj)
        .await
        .map_err(|e| write_error(e, kind, &name))
}

async fn delete<K>(api: &Api<K>, kind: &str, name: &str) -> Result<(), Error>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    debug!(kind = %kind, name = %name, "deleting");
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        create(&api, "Namespace", namespace).await
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        delete(&api, "Namespace", name).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        Ok(self.namespaced::<Secret>(namespace).get_opt(name).await?)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, Error> {
        create(&self.namespaced(namespace), "Secret", secret).await
    }

    async fn replace_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, Error> {
        replace(&self.namespaced(namespace), "Secret", secret).await
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), Error> {
        delete(&self.namespaced::<Secret>(namespace), "Secret", name).await
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        Ok(self.namespaced::<Deployment>(namespace).get_opt(name).await?)
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, Error> {
        create(&self.namespaced(namespace), "Deployment", deployment).await
    }

    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, Error> {
        replace(&self.namespaced(namespace), "Deployment", deployment).await
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), Error> {
        delete(&self.namespaced::<Deployment>(namespace), "Deployment", name).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        Ok(self.namespaced::<Service>(namespace).get_opt(name).await?)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service, Error> {
        create(&self.namespaced(namespace), "Service", service).await
    }

    async fn replace_service(&self, namespace: &str, service: &Service) -> Result<Service, Error> {
        replace(&self.namespaced(namespace), "Service", service).await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error> {
        delete(&self.namespaced::<Service>(namespace), "Service", name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code,
        })
    }

    #[test]
    fn conflicts_and_invalid_updates_map_to_apply_conflict() {
        assert!(matches!(
            write_error(api_error(409), "Deployment", "web"),
            Error::ApplyConflict { kind, name, .. } if kind == "Deployment" && name == "web"
        ));
        assert!(matches!(
            write_error(api_error(422), "Deployment", "web"),
            Error::ApplyConflict { .. }
        ));
        assert!(matches!(
            write_error(api_error(500), "Deployment", "web"),
            Error::Kube(_)
        ));
    }

    #[test]
    fn objects_without_names_are_rejected() {
        let secret = Secret::default();
        assert!(object_name(&secret).is_err());
    }
}
