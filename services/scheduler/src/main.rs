//! tesbatch - offline tools for the batch scheduler
//!
//! Runs the pure parts of the scheduler against local files: VM selection
//! for a task against a catalog, and the batch script a task would get.
//! Configuration comes from the same `TESBATCH_*` variables the scheduler
//! reads.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use tesbatch_model::{Task, VmInfo};
use tesbatch_reconcile::RetryTracker;
use tesbatch_scheduler::{PoolOrTaskBuilder, SchedulerConfig, VmSelector};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Batch scheduler tools.
#[derive(Debug, Parser)]
#[command(name = "tesbatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Select the VM the next attempt of a task would use.
    SelectVm {
        /// JSON array of catalog entries.
        #[arg(long, env = "TESBATCH_CATALOG_FILE")]
        catalog: PathBuf,

        /// JSON task, including its attempt logs.
        #[arg(long)]
        task: PathBuf,
    },

    /// Print the batch script generated for a task.
    BatchScript {
        #[arg(long)]
        task: PathBuf,

        /// Treat executor images as coming from a private registry.
        #[arg(long)]
        private_registry: bool,

        /// URL the node uploads its metrics file to.
        #[arg(long, default_value = "https://example.invalid/metrics.txt")]
        metrics_url: String,
    },

    /// Load and validate configuration.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SchedulerConfig::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::SelectVm { catalog, task } => {
            let catalog: Vec<VmInfo> = read_json(&catalog)?;
            let mut task: Task = read_json(&task)?;
            task.resources.apply_backend_parameters();

            let tracker = RetryTracker::from_attempts(&task.logs, config.max_allocation_retries);
            let selection =
                VmSelector::new(&config).select(&task.resources, &catalog, tracker.excluded())?;

            match selection {
                Some(selection) => {
                    info!(task_id = %task.id, vm_size = %selection.vm.vm_size, "Selected VM");
                    let output = serde_json::json!({
                        "vm": selection.vm,
                        "warning": selection.warning,
                    });
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                None => {
                    let detail = tesbatch_scheduler::vm_selector::no_vm_available_detail(
                        &task.resources,
                        catalog.len(),
                        tracker.excluded(),
                    );
                    anyhow::bail!("NoVmSizeAvailable: {detail}");
                }
            }
        }
        Commands::BatchScript {
            task,
            private_registry,
            metrics_url,
        } => {
            let task: Task = read_json(&task)?;
            let script = PoolOrTaskBuilder::new(&config).batch_script(
                &task.executors,
                private_registry,
                &metrics_url,
            );
            print!("{script}");
        }
        Commands::CheckConfig => {
            info!(
                region = %config.region,
                default_storage_account = %config.storage.default_account,
                external_containers = config.storage.external_containers.len(),
                pool_id_prefix = %config.pool_id_prefix,
                "Configuration loaded"
            );
            println!("configuration ok");
        }
    }

    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}
