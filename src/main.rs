//! kubebox - provision a managed Kubernetes cluster and deploy onto it

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kubebox::cluster::{ConnectionMaterial, KubeClientFactory};
use kubebox::config::{AzureCredentials, PipelineConfig, RegistryLogin};
use kubebox::error::ErrorCategory;
use kubebox::pipeline::{render, ClusterAccess, Pipeline, PipelineReport};
use kubebox::provider::AzureCloud;
use kubebox::sensitive::Sensitive;
use kubebox::Error;

/// kubebox - provision a managed cluster and registry, then deploy workloads onto it
#[derive(Parser, Debug)]
#[command(name = "kubebox", version, about, long_about = None)]
struct Cli {
    /// Path to the pipeline YAML definition
    #[arg(short = 'f', long = "config", global = true, default_value = "kubebox.yaml")]
    config_file: PathBuf,

    /// Log output format
    #[arg(long, value_enum, global = true, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(flatten)]
    cloud: CloudArgs,

    #[command(flatten)]
    registry: RegistryArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Service principal used for the cloud provisioning API
#[derive(Args, Debug)]
struct CloudArgs {
    /// Subscription the resources live in
    #[arg(long, env = "AZURE_SUBSCRIPTION_ID", global = true)]
    subscription_id: Option<String>,

    /// Directory (tenant) id
    #[arg(long, env = "AZURE_TENANT_ID", global = true)]
    tenant_id: Option<String>,

    /// Service principal client id
    #[arg(long, env = "AZURE_CLIENT_ID", global = true)]
    client_id: Option<String>,

    /// Service principal secret
    #[arg(long, env = "AZURE_CLIENT_SECRET", hide_env_values = true, global = true)]
    client_secret: Option<String>,
}

/// Login for pull secrets that name an explicit registry host
#[derive(Args, Debug)]
struct RegistryArgs {
    /// Registry username
    #[arg(long, env = "REGISTRY_USERNAME", global = true)]
    registry_username: Option<String>,

    /// Registry password
    #[arg(long, env = "REGISTRY_PASSWORD", hide_env_values = true, global = true)]
    registry_password: Option<String>,

    /// Registry email (optional)
    #[arg(long, env = "REGISTRY_EMAIL", global = true)]
    registry_email: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision the resource group, managed cluster and registry
    Provision,

    /// Deploy every app onto an existing cluster
    Deploy(AccessArgs),

    /// Provision, then deploy with the credentials provisioning produced
    Apply,

    /// Delete the apps, or the whole resource group
    Teardown {
        /// Delete the resource group (cluster, registry and all apps) instead of the apps
        #[arg(long)]
        infrastructure: bool,

        #[command(flatten)]
        access: AccessArgs,
    },

    /// Show replica counts and service addresses per app
    Status(AccessArgs),

    /// Print the Namespace, Deployment and Service manifests that would be applied
    Render,
}

/// Connection material source for commands that talk to an existing cluster
///
/// Admin credentials are read from the cloud when neither file is given.
#[derive(Args, Debug)]
struct AccessArgs {
    /// Kubeconfig file for the cluster
    #[arg(long, conflicts_with = "terraform_state")]
    kubeconfig: Option<PathBuf>,

    /// Terraform state file containing the cluster resource
    #[arg(long)]
    terraform_state: Option<PathBuf>,
}

impl AccessArgs {
    fn uses_cloud(&self) -> bool {
        self.kubeconfig.is_none() && self.terraform_state.is_none()
    }

    async fn load(&self) -> anyhow::Result<ClusterAccess> {
        let material = match (&self.kubeconfig, &self.terraform_state) {
            (Some(path), _) => ConnectionMaterial::from_kubeconfig_yaml(&read(path).await?)?,
            (None, Some(path)) => ConnectionMaterial::from_terraform_state(&read(path).await?)?,
            (None, None) => return Ok(ClusterAccess::Cloud),
        };
        Ok(ClusterAccess::Material(material))
    }
}

async fn read(path: &Path) -> anyhow::Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))
}

#[tokio::main]
async fn main() {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("kubebox failed: {e:#}");
            eprintln!("error: {e:#}");
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,kubebox=debug"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer().with_writer(std::io::stderr)).init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

/// Exit code for a failure outside the stage pipeline
fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<Error>() {
        Some(e) => e.category().exit_code(),
        // Unreadable input files
        None => ErrorCategory::Validation.exit_code(),
    }
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = PipelineConfig::load(&cli.config_file).await?;

    if let Commands::Render = cli.command {
        print!("{}", render(&config)?);
        return Ok(0);
    }

    let needs_cloud = match &cli.command {
        Commands::Provision | Commands::Apply => true,
        Commands::Deploy(access) | Commands::Status(access) => access.uses_cloud(),
        Commands::Teardown {
            infrastructure,
            access,
        } => *infrastructure || access.uses_cloud(),
        Commands::Render => false,
    };

    let factory = Arc::new(KubeClientFactory::new(config.timeouts.connect));
    let mut pipeline = Pipeline::new(config, factory);

    if needs_cloud {
        let credentials = AzureCredentials::from_parts(
            cli.cloud.subscription_id,
            cli.cloud.tenant_id,
            cli.cloud.client_id,
            cli.cloud.client_secret.map(Sensitive::new),
        )?;
        pipeline = pipeline.with_cloud(Arc::new(AzureCloud::new(credentials)?));
    }

    let deploys = matches!(cli.command, Commands::Deploy(_) | Commands::Apply);
    if deploys && pipeline.config().needs_registry_login() {
        let login = RegistryLogin::from_parts(
            cli.registry.registry_username,
            cli.registry.registry_password.map(Sensitive::new),
            cli.registry.registry_email,
        )?;
        pipeline = pipeline.with_registry_login(login);
    } else if let (Some(username), Some(password)) =
        (cli.registry.registry_username, cli.registry.registry_password)
    {
        let mut login = RegistryLogin::new(username, Sensitive::new(password));
        login.email = cli.registry.registry_email.filter(|e| !e.is_empty());
        pipeline = pipeline.with_registry_login(login);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling; remote resources are left as they are");
            on_signal.cancel();
        }
    });

    let report = match cli.command {
        Commands::Provision => pipeline.provision(&cancel).await,
        Commands::Apply => pipeline.apply(&cancel).await,
        Commands::Deploy(access) => pipeline.deploy(access.load().await?, &cancel).await,
        Commands::Teardown {
            infrastructure,
            access,
        } => {
            let access = if infrastructure {
                ClusterAccess::Cloud
            } else {
                access.load().await?
            };
            pipeline.teardown(access, infrastructure, &cancel).await
        }
        Commands::Status(access) => {
            for app in pipeline.status(access.load().await?, &cancel).await? {
                println!("{app}");
            }
            return Ok(0);
        }
        Commands::Render => PipelineReport::default(),
    };

    print!("{report}");
    Ok(report.exit_code())
}
