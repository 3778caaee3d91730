//! Azure Resource Manager implementation of [`CloudApi`]
//!
//! Authenticates with a service principal (client credentials grant) and keeps
//! the bearer token cached until shortly before it expires.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, instrument};

use super::{CloudApi, ObservedCluster, ObservedRegistry, ProvisioningState, RegistryCredentials};
use crate::cluster::ConnectionMaterial;
use crate::config::AzureCredentials;
use crate::model::{ManagedClusterSpec, NodePool, RegistrySpec, ResourceGroup};
use crate::sensitive::Sensitive;
use crate::Error;

const RESOURCE_GROUP_API_VERSION: &str = "2021-04-01";
const CLUSTER_API_VERSION: &str = "2024-02-01";
const REGISTRY_API_VERSION: &str = "2023-07-01";
const COMPUTE_API_VERSION: &str = "2021-07-01";

/// Tokens are refreshed this long before they expire
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(120);

/// Base URLs of the identity and management endpoints
#[derive(Clone, Debug)]
pub struct AzureEndpoints {
    /// Identity platform (token) endpoint
    pub login: String,
    /// Resource Manager endpoint
    pub management: String,
}

impl Default for AzureEndpoints {
    fn default() -> Self {
        Self {
            login: "https://login.microsoftonline.com".to_string(),
            management: "https://management.azure.com".to_string(),
        }
    }
}

struct CachedToken {
    access_token: Sensitive,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct ArmErrorBody {
    error: ArmError,
}

#[derive(Deserialize)]
struct ArmError {
    code: String,
    message: String,
}

/// Cloud API client for Azure Resource Manager
pub struct AzureCloud {
    http: reqwest::Client,
    credentials: AzureCredentials,
    endpoints: AzureEndpoints,
    token: Arc<RwLock<Option<CachedToken>>>,
}

impl AzureCloud {
    /// Create a client for the public cloud endpoints
    pub fn new(credentials: AzureCredentials) -> Result<Self, Error> {
        Self::with_endpoints(credentials, AzureEndpoints::default())
    }

    /// Create a client for custom endpoints (sovereign clouds, test servers)
    pub fn with_endpoints(
        credentials: AzureCredentials,
        endpoints: AzureEndpoints,
    ) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            credentials,
            endpoints,
            token: Arc::new(RwLock::new(None)),
        })
    }

    async fn bearer_token(&self) -> Result<Sensitive, Error> {
        if let Some(cached) = self.token.read().await.as_ref() {
            if Instant::now() + TOKEN_REFRESH_MARGIN < cached.expires_at {
                return Ok(cached.access_token.clone());
            }
        }

        let mut slot = self.token.write().await;
        // Another task may have refreshed while we waited for the lock
        if let Some(cached) = slot.as_ref() {
            if Instant::now() + TOKEN_REFRESH_MARGIN < cached.expires_at {
                return Ok(cached.access_token.clone());
            }
        }

        debug!(tenant = %self.credentials.tenant_id, "Requesting management token");
        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.endpoints.login, self.credentials.tenant_id
        );
        let scope = format!("{}/.default", self.endpoints.management);
        let response = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.expose()),
                ("scope", scope.as_str()),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            // The identity endpoint's error body may echo request details; keep only the status
            return Err(Error::cloud(
                Some(status.as_u16()),
                "service principal authentication failed",
            ));
        }

        let token: TokenResponse = response.json().await.map_err(transport_error)?;
        let access_token = Sensitive::new(token.access_token);
        *slot = Some(CachedToken {
            access_token: access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(access_token)
    }

    fn subscription_url(&self, path: &str, api_version: &str) -> String {
        format!(
            "{}/subscriptions/{}{}?api-version={}",
            self.endpoints.management, self.credentials.subscription_id, path, api_version
        )
    }

    fn cluster_path(group: &str, name: &str) -> String {
        format!(
            "/resourcegroups/{group}/providers/Microsoft.ContainerService/managedClusters/{name}"
        )
    }

    fn registry_path(group: &str, name: &str) -> String {
        format!("/resourcegroups/{group}/providers/Microsoft.ContainerRegistry/registries/{name}")
    }

    /// Send a request; `Ok(None)` for 404, the parsed body for other successes
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Option<T>, Error> {
        let token = self.bearer_token().await?;
        let mut request = self
            .http
            .request(method.clone(), url)
            .bearer_auth(token.expose());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        debug!(method = %method, url = %url, status = status.as_u16(), "ARM response");

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::cloud(Some(status.as_u16()), arm_error_message(&text)));
        }

        // Accepted long-running operations and deletes may have an empty body
        let bytes = response.bytes().await.map_err(transport_error)?;
        let slice: &[u8] = if bytes.is_empty() { b"null" } else { &bytes };
        serde_json::from_slice(slice)
            .map(Some)
            .map_err(|e| Error::cloud(Some(status.as_u16()), format!("unexpected response: {e}")))
    }

    async fn get_json(&self, url: &str) -> Result<Option<Value>, Error> {
        self.request(Method::GET, url, None).await
    }

    async fn post_json(&self, url: &str) -> Result<Value, Error> {
        self.request(Method::POST, url, None)
            .await?
            .ok_or_else(|| Error::cloud(Some(404), format!("{url} not found")))
    }

    async fn put_json(&self, url: &str, body: &Value) -> Result<(), Error> {
        self.request::<Value>(Method::PUT, url, Some(body))
            .await?
            .map(|_| ())
            .ok_or_else(|| Error::cloud(Some(404), format!("{url} not found")))
    }
}

/// Only failures to reach the API are retryable; a body that cannot be read
/// or decoded is reported without a status and surfaces immediately
fn transport_error(err: reqwest::Error) -> Error {
    if err.is_connect() || err.is_timeout() {
        Error::cloud_unreachable(err.to_string())
    } else {
        Error::cloud(err.status().map(|s| s.as_u16()), err.to_string())
    }
}

fn arm_error_message(body: &str) -> String {
    match serde_json::from_str::<ArmErrorBody>(body) {
        Ok(parsed) => format!("{}: {}", parsed.error.code, parsed.error.message),
        Err(_) if body.is_empty() => "empty error response".to_string(),
        Err(_) => body.chars().take(512).collect(),
    }
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn provisioning_state(resource: &Value) -> ProvisioningState {
    let state = str_at(resource, "/properties/provisioningState").unwrap_or("Unknown");
    let reason = str_at(resource, "/properties/status/provisioningError/message")
        .or_else(|| str_at(resource, "/properties/status/provisioningError/code"))
        .map(str::to_string);
    ProvisioningState::parse(state, reason)
}

pub(crate) fn cluster_body(group: &ResourceGroup, spec: &ManagedClusterSpec) -> Value {
    let mut properties = json!({
        "dnsPrefix": spec.dns_prefix(),
        "agentPoolProfiles": [{
            "name": spec.node_pool.name,
            "count": spec.node_pool.node_count,
            "vmSize": spec.node_pool.size_class,
            "mode": "System",
            "osType": "Linux",
            "type": "VirtualMachineScaleSets",
        }],
    });
    if let Some(version) = &spec.kubernetes_version {
        properties["kubernetesVersion"] = json!(version);
    }

    let mut body = json!({
        "location": spec.region(group),
        "properties": properties,
    });
    if spec.identity_mode != crate::model::IdentityMode::None {
        body["identity"] = json!({ "type": spec.identity_mode.as_str() });
    }
    body
}

pub(crate) fn parse_cluster(resource: &Value) -> ObservedCluster {
    let node_pool = resource
        .pointer("/properties/agentPoolProfiles")
        .and_then(Value::as_array)
        .and_then(|pools| {
            pools
                .iter()
                .find(|p| p.get("mode").and_then(Value::as_str) == Some("System"))
                .or_else(|| pools.first())
        })
        .and_then(|pool| {
            Some(NodePool {
                name: pool.get("name")?.as_str()?.to_string(),
                size_class: pool.get("vmSize")?.as_str()?.to_string(),
                node_count: u32::try_from(pool.get("count")?.as_u64()?).ok()?,
            })
        });

    ObservedCluster {
        provisioning_state: provisioning_state(resource),
        node_pool,
        fqdn: str_at(resource, "/properties/fqdn").map(str::to_string),
    }
}

pub(crate) fn parse_registry(resource: &Value) -> Result<ObservedRegistry, Error> {
    let sku = str_at(resource, "/sku/name").unwrap_or("Basic").parse()?;
    Ok(ObservedRegistry {
        provisioning_state: provisioning_state(resource),
        login_server: str_at(resource, "/properties/loginServer")
            .unwrap_or_default()
            .to_string(),
        sku,
        admin_enabled: resource
            .pointer("/properties/adminUserEnabled")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

pub(crate) fn parse_admin_kubeconfig(response: &Value) -> Result<ConnectionMaterial, Error> {
    let encoded = response
        .pointer("/kubeconfigs/0/value")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::cloud(None, "credential response has no kubeconfig"))?;
    let decoded = zeroize::Zeroizing::new(
        STANDARD
            .decode(encoded)
            .map_err(|_| Error::invalid_credentials("kubeconfig is not valid base64"))?,
    );
    let yaml = std::str::from_utf8(&decoded)
        .map_err(|_| Error::invalid_credentials("kubeconfig is not valid UTF-8"))?;
    ConnectionMaterial::from_kubeconfig_yaml(yaml)
}

#[async_trait]
impl CloudApi for AzureCloud {
    async fn get_resource_group(&self, name: &str) -> Result<Option<ResourceGroup>, Error> {
        let url = self.subscription_url(&format!("/resourcegroups/{name}"), RESOURCE_GROUP_API_VERSION);
        Ok(self.get_json(&url).await?.map(|rg| ResourceGroup {
            name: str_at(&rg, "/name").unwrap_or(name).to_string(),
            region: str_at(&rg, "/location").unwrap_or_default().to_string(),
        }))
    }

    #[instrument(skip(self, group), fields(group = %group.name))]
    async fn create_or_update_resource_group(&self, group: &ResourceGroup) -> Result<(), Error> {
        let url = self.subscription_url(
            &format!("/resourcegroups/{}", group.name),
            RESOURCE_GROUP_API_VERSION,
        );
        self.put_json(&url, &json!({ "location": group.region })).await
    }

    #[instrument(skip(self))]
    async fn delete_resource_group(&self, name: &str) -> Result<(), Error> {
        let url = self.subscription_url(&format!("/resourcegroups/{name}"), RESOURCE_GROUP_API_VERSION);
        // Missing group is already deleted
        self.request::<Value>(Method::DELETE, &url, None).await?;
        Ok(())
    }

    async fn list_vm_sizes(&self, region: &str) -> Result<Vec<String>, Error> {
        let url = self.subscription_url(
            &format!("/providers/Microsoft.Compute/locations/{region}/vmSizes"),
            COMPUTE_API_VERSION,
        );
        let sizes = self
            .get_json(&url)
            .await?
            .ok_or_else(|| Error::cloud(Some(404), format!("region '{region}' not found")))?;

        Ok(sizes
            .get("value")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|size| size.get("name").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    async fn get_cluster(&self, group: &str, name: &str) -> Result<Option<ObservedCluster>, Error> {
        let url = self.subscription_url(&Self::cluster_path(group, name), CLUSTER_API_VERSION);
        Ok(self.get_json(&url).await?.as_ref().map(parse_cluster))
    }

    #[instrument(skip(self, group, spec), fields(cluster = %spec.name))]
    async fn create_or_update_cluster(
        &self,
        group: &ResourceGroup,
        spec: &ManagedClusterSpec,
    ) -> Result<(), Error> {
        let url = self.subscription_url(&Self::cluster_path(&group.name, &spec.name), CLUSTER_API_VERSION);
        self.put_json(&url, &cluster_body(group, spec)).await
    }

    async fn get_cluster_status(&self, group: &str, name: &str) -> Result<ProvisioningState, Error> {
        self.get_cluster(group, name)
            .await?
            .map(|c| c.provisioning_state)
            .ok_or_else(|| Error::cloud(Some(404), format!("cluster '{name}' not found")))
    }

    async fn get_cluster_credentials(
        &self,
        group: &str,
        name: &str,
    ) -> Result<ConnectionMaterial, Error> {
        let url = self.subscription_url(
            &format!("{}/listClusterAdminCredential", Self::cluster_path(group, name)),
            CLUSTER_API_VERSION,
        );
        let response = self.post_json(&url).await?;
        parse_admin_kubeconfig(&response)
    }

    async fn get_registry(
        &self,
        group: &str,
        name: &str,
    ) -> Result<Option<ObservedRegistry>, Error> {
        let url = self.subscription_url(&Self::registry_path(group, name), REGISTRY_API_VERSION);
        self.get_json(&url)
            .await?
            .as_ref()
            .map(parse_registry)
            .transpose()
    }

    #[instrument(skip(self, group, spec), fields(registry = %spec.name))]
    async fn create_or_update_registry(
        &self,
        group: &ResourceGroup,
        spec: &RegistrySpec,
    ) -> Result<(), Error> {
        let url = self.subscription_url(&Self::registry_path(&group.name, &spec.name), REGISTRY_API_VERSION);
        let body = json!({
            "location": spec.region(group),
            "sku": { "name": spec.sku.as_str() },
            "properties": { "adminUserEnabled": spec.admin_enabled },
        });
        self.put_json(&url, &body).await
    }

    async fn get_registry_credentials(
        &self,
        group: &str,
        name: &str,
    ) -> Result<RegistryCredentials, Error> {
        let login_server = self
            .get_registry(group, name)
            .await?
            .map(|r| r.login_server)
            .ok_or_else(|| Error::cloud(Some(404), format!("registry '{name}' not found")))?;

        let url = self.subscription_url(
            &format!("{}/listCredentials", Self::registry_path(group, name)),
            REGISTRY_API_VERSION,
        );
        let response = self.post_json(&url).await?;

        let username = str_at(&response, "/username")
            .ok_or_else(|| Error::cloud(None, "registry credential response has no username"))?
            .to_string();
        let password = str_at(&response, "/passwords/0/value")
            .ok_or_else(|| Error::cloud(None, "registry credential response has no password"))?;

        Ok(RegistryCredentials {
            login_server,
            username,
            password: Sensitive::new(password),
        })
    }
}
