//! Credentials sourced from the environment
//!
//! Each credential is required only by the commands that use it; a missing
//! value is reported by the environment variable name that supplies it.

use crate::sensitive::Sensitive;
use crate::Error;

/// Environment variable holding the cloud subscription id
pub const ENV_SUBSCRIPTION_ID: &str = "AZURE_SUBSCRIPTION_ID";
/// Environment variable holding the directory (tenant) id
pub const ENV_TENANT_ID: &str = "AZURE_TENANT_ID";
/// Environment variable holding the service principal's client id
pub const ENV_CLIENT_ID: &str = "AZURE_CLIENT_ID";
/// Environment variable holding the service principal's secret
pub const ENV_CLIENT_SECRET: &str = "AZURE_CLIENT_SECRET";
/// Environment variable holding the registry username
pub const ENV_REGISTRY_USERNAME: &str = "REGISTRY_USERNAME";
/// Environment variable holding the registry password
pub const ENV_REGISTRY_PASSWORD: &str = "REGISTRY_PASSWORD";
/// Environment variable holding the optional registry email
pub const ENV_REGISTRY_EMAIL: &str = "REGISTRY_EMAIL";

fn required<T>(value: Option<T>, env: &str, is_empty: impl Fn(&T) -> bool) -> Result<T, Error> {
    match value {
        Some(v) if !is_empty(&v) => Ok(v),
        _ => Err(Error::config(format!("{env} is required for this command"))),
    }
}

/// Service principal credentials for the cloud provisioning API
#[derive(Clone, Debug)]
pub struct AzureCredentials {
    /// Subscription the resources are created in
    pub subscription_id: String,
    /// Directory the service principal belongs to
    pub tenant_id: String,
    /// Service principal client id
    pub client_id: String,
    /// Service principal secret
    pub client_secret: Sensitive,
}

impl AzureCredentials {
    /// Assemble credentials, failing on the first missing value
    pub fn from_parts(
        subscription_id: Option<String>,
        tenant_id: Option<String>,
        client_id: Option<String>,
        client_secret: Option<Sensitive>,
    ) -> Result<Self, Error> {
        Ok(Self {
            subscription_id: required(subscription_id, ENV_SUBSCRIPTION_ID, String::is_empty)?,
            tenant_id: required(tenant_id, ENV_TENANT_ID, String::is_empty)?,
            client_id: required(client_id, ENV_CLIENT_ID, String::is_empty)?,
            client_secret: required(client_secret, ENV_CLIENT_SECRET, Sensitive::is_empty)?,
        })
    }
}

/// Username/password login for a container registry
#[derive(Clone, Debug)]
pub struct RegistryLogin {
    /// Registry username
    pub username: String,
    /// Registry password
    pub password: Sensitive,
    /// Optional email recorded alongside the credential
    pub email: Option<String>,
}

impl RegistryLogin {
    /// Create a login without email
    pub fn new(username: impl Into<String>, password: impl Into<Sensitive>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            email: None,
        }
    }

    /// Assemble a login from explicit inputs; email may be absent
    pub fn from_parts(
        username: Option<String>,
        password: Option<Sensitive>,
        email: Option<String>,
    ) -> Result<Self, Error> {
        Ok(Self {
            username: required(username, ENV_REGISTRY_USERNAME, String::is_empty)?,
            password: required(password, ENV_REGISTRY_PASSWORD, Sensitive::is_empty)?,
            email: email.filter(|e| !e.is_empty()),
        })
    }
}
