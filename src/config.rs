//! Command line and configuration file handling

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use tracing::debug;

use crate::error::{Error, Result};
use crate::migrator::MigratorConfig;

/// Default metrics port
pub const DEFAULT_METRICS_PORT: u16 = 8080;

#[derive(Parser, Debug)]
#[command(name = "storage-version-migrator")]
#[command(about = "Rewrite stored Kubernetes objects under the current storage version", long_about = None)]
pub struct Cli {
    /// Path to a kubeconfig file
    #[arg(long, global = true, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long, global = true)]
    pub context: Option<String>,

    /// YAML file with migrator settings
    #[arg(long, global = true, env = "MIGRATOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Migrate every eligible resource type once and print the report
    Run(RunArgs),
    /// Create a StorageVersionMigration for every eligible resource type
    Launch(SelectionArgs),
    /// Watch StorageVersionMigration objects and migrate what they request
    Controller(ControllerArgs),
}

/// Resource type selection, shared by `run` and `launch`
#[derive(Args, Debug, Default, Clone)]
pub struct SelectionArgs {
    /// Only migrate these resources (`resource.group`, or `resource` for the core group)
    #[arg(long = "include", value_delimiter = ',')]
    pub include: Vec<String>,

    /// Never migrate these resources (`resource.group`)
    #[arg(long = "exclude", value_delimiter = ',')]
    pub exclude: Vec<String>,

    /// Skip every resource of these API groups
    #[arg(long = "exclude-group", value_delimiter = ',')]
    pub exclude_groups: Vec<String>,

    /// Resource names that are never migrated, replacing the configured deny list
    #[arg(long = "deny", value_delimiter = ',')]
    pub deny: Option<Vec<String>>,

    /// Skip resources served from CustomResourceDefinitions
    #[arg(long)]
    pub exclude_custom_resources: bool,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Concurrent rewrites per page
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Objects requested per list call
    #[arg(long)]
    pub chunk_size: Option<u32>,

    /// Keep checkpoints in this file so an interrupted run resumes
    #[arg(long)]
    pub progress_file: Option<PathBuf>,

    /// Report format
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    pub output: OutputFormat,

    #[command(flatten)]
    pub selection: SelectionArgs,
}

#[derive(Args, Debug)]
pub struct ControllerArgs {
    /// Port for the metrics and health endpoints
    #[arg(long, env = "METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Concurrent rewrites per page
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Objects requested per list call
    #[arg(long)]
    pub chunk_size: Option<u32>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Yaml,
}

/// Read the YAML settings file, or start from defaults when there is none
pub fn load_config(path: Option<&Path>) -> Result<MigratorConfig> {
    let Some(path) = path else {
        return Ok(MigratorConfig::default());
    };

    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
    let config: MigratorConfig = serde_yaml::from_str(&contents)?;
    debug!(path = %path.display(), "Loaded migrator configuration");
    Ok(config)
}

/// Apply command line overrides on top of the file values
pub fn apply_overrides(
    mut config: MigratorConfig,
    concurrency: Option<usize>,
    chunk_size: Option<u32>,
    selection: Option<&SelectionArgs>,
) -> Result<MigratorConfig> {
    if let Some(concurrency) = concurrency {
        config.concurrency = concurrency;
    }
    if let Some(chunk_size) = chunk_size {
        config.chunk_size = chunk_size;
    }

    if let Some(selection) = selection {
        let eligibility = &mut config.eligibility;
        eligibility.include_resources.extend(selection.include.iter().cloned());
        eligibility.exclude_resources.extend(selection.exclude.iter().cloned());
        eligibility.exclude_groups.extend(selection.exclude_groups.iter().cloned());
        if let Some(deny) = &selection.deny {
            eligibility.denied_resources = deny.iter().cloned().collect();
        }
        if selection.exclude_custom_resources {
            eligibility.exclude_custom_resources = true;
        }
    }

    config.validate()?;
    Ok(config)
}

/// Build a client from an explicit kubeconfig/context, or infer one
/// (in-cluster service account, then `$HOME/.kube/config`)
pub async fn kube_client(kubeconfig: Option<&Path>, context: Option<&str>) -> Result<Client> {
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };

    let config = match (kubeconfig, context) {
        (Some(path), _) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| Error::config(format!("cannot read kubeconfig {}: {}", path.display(), e)))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|e| Error::config(format!("invalid kubeconfig: {}", e)))?
        }
        (None, Some(_)) => kube::Config::from_kubeconfig(&options)
            .await
            .map_err(|e| Error::config(format!("invalid kubeconfig: {}", e)))?,
        (None, None) => kube::Config::infer()
            .await
            .map_err(|e| Error::config(format!("cannot infer cluster configuration: {}", e)))?,
    };

    Ok(Client::try_from(config)?)
}
