//! Pool and task specifications handed to the compute backend.
//!
//! The batch script run on the node pulls images, downloads inputs, runs the
//! executors, uploads outputs and records node metrics as `Key=Value` lines.

use serde::{Deserialize, Serialize};
use tesbatch_id::{JobId, PoolId, TaskId};
use tesbatch_model::{Executor, ResourceRequirement, VmInfo};

use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, SchedulerResult};

/// Scheduler files placed next to each other in the task's working directory.
pub const BATCH_SCRIPT: &str = "batch_script";
pub const DOWNLOAD_MANIFEST: &str = "download_manifest.json";
pub const UPLOAD_MANIFEST: &str = "upload_manifest.json";
pub const METRICS_FILE: &str = "metrics.txt";

/// Credentials for a private registry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRegistryInfo {
    pub registry_server: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for ContainerRegistryInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerRegistryInfo")
            .field("registry_server", &self.registry_server)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfiguration {
    /// Images pulled by the pool when nodes start.
    pub container_image_names: Vec<String>,
    pub registries: Vec<ContainerRegistryInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublicIpProvisioning {
    BatchManaged,
    NoPublicIpAddresses,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfiguration {
    pub subnet_id: String,
    pub public_ip: PublicIpProvisioning,
}

/// A pool to run one attempt on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSpec {
    /// Set for named pools only. Ephemeral pools are named by the backend.
    pub pool_id: Option<PoolId>,
    pub id_prefix: String,
    pub vm_size: String,
    pub low_priority: bool,
    pub target_dedicated_nodes: u32,
    pub target_low_priority_nodes: u32,
    pub container: Option<ContainerConfiguration>,
    pub network: Option<NetworkConfiguration>,

    /// Workflow execution identity assigned to the nodes.
    pub identity: Option<String>,
}

/// Where a job runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolRef {
    /// A pool that lives and dies with its job.
    Ephemeral(PoolSpec),

    /// A pool created beforehand and referenced by id.
    Named(PoolId),
}

impl PoolRef {
    pub fn pool_id(&self) -> Option<&PoolId> {
        match self {
            Self::Ephemeral(_) => None,
            Self::Named(id) => Some(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFile {
    /// Relative to the task's working directory.
    pub file_path: String,
    pub http_url: String,
}

/// The backend task for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: TaskId,
    pub command_line: String,
    pub resource_files: Vec<ResourceFile>,
}

/// Builds pool and task specifications.
pub struct PoolOrTaskBuilder<'a> {
    config: &'a SchedulerConfig,
}

impl<'a> PoolOrTaskBuilder<'a> {
    pub fn new(config: &'a SchedulerConfig) -> Self {
        Self { config }
    }

    /// Pool for an attempt. Tasks with a workflow execution identity get a
    /// named pool, everything else an ephemeral one.
    pub fn pool_spec(
        &self,
        job_id: &JobId,
        vm: &VmInfo,
        requirement: &ResourceRequirement,
        executors: &[Executor],
        registry: Option<&ContainerRegistryInfo>,
    ) -> SchedulerResult<PoolSpec> {
        let pool_id = match requirement.workflow_execution_identity {
            Some(_) => Some(
                PoolId::for_job(&self.config.pool_id_prefix, job_id)
                    .map_err(|e| SchedulerError::InvalidConfig(e.to_string()))?,
            ),
            None => None,
        };

        let container = registry.map(|registry| ContainerConfiguration {
            container_image_names: executors.iter().map(|e| e.image.clone()).collect(),
            registries: vec![registry.clone()],
        });

        let network = self
            .config
            .nodes_subnet_id
            .as_ref()
            .map(|subnet_id| NetworkConfiguration {
                subnet_id: subnet_id.clone(),
                public_ip: if self.config.disable_nodes_public_ip {
                    PublicIpProvisioning::NoPublicIpAddresses
                } else {
                    PublicIpProvisioning::BatchManaged
                },
            });

        Ok(PoolSpec {
            pool_id,
            id_prefix: self.config.pool_id_prefix.clone(),
            vm_size: vm.vm_size.clone(),
            low_priority: vm.low_priority,
            target_dedicated_nodes: u32::from(!vm.low_priority),
            target_low_priority_nodes: u32::from(vm.low_priority),
            container,
            network,
            identity: requirement.workflow_execution_identity.clone(),
        })
    }

    /// Shell script run on the node. Images from a private registry are
    /// pulled by the pool, so the script only verifies and runs them.
    pub fn batch_script(
        &self,
        executors: &[Executor],
        private_registry: bool,
        metrics_url: &str,
    ) -> String {
        let transfer = shell_quote(&self.config.transfer_image);
        let mounts = self.mounts();
        let roots: Vec<String> = self
            .config
            .storage
            .execution_roots
            .iter()
            .map(|root| format!("\"$AZ_BATCH_TASK_WORKING_DIR\"{}", shell_quote(root)))
            .collect();
        let roots = roots.join(" ");

        let mut s = String::new();
        s.push_str("#!/bin/sh\n");
        s.push_str("metrics=\"$AZ_BATCH_TASK_WORKING_DIR/metrics.txt\"\n");
        s.push_str("write_kv() { echo \"$1=$2\" >> \"$metrics\"; }\n");
        s.push_str("write_ts() { write_kv \"$1\" \"$(date -Iseconds)\"; }\n");
        s.push_str("dir_bytes() { du -sbc \"$@\" 2>/dev/null | tail -n 1 | cut -f1; }\n");
        s.push_str("cd \"$AZ_BATCH_TASK_WORKING_DIR\" || exit 1\n");
        s.push_str(&format!("mkdir -p {roots}\n"));

        s.push_str("write_ts BlobXferPullStart\n");
        s.push_str(&format!("docker pull --quiet {transfer} || exit 1\n"));
        s.push_str("write_ts BlobXferPullEnd\n");

        s.push_str("write_ts ExecutorPullStart\n");
        for executor in executors {
            let image = shell_quote(&executor.image);
            if !private_registry {
                s.push_str(&format!("docker pull --quiet {image} || exit 1\n"));
            }
            s.push_str(&format!(
                "write_kv ExecutorImageSizeInBytes \
                 \"$(docker image inspect {image} --format '{{{{.Size}}}}')\" || exit 1\n"
            ));
        }
        s.push_str("write_ts ExecutorPullEnd\n");

        s.push_str("write_ts DownloadStart\n");
        s.push_str(&format!(
            "docker run --rm {mounts} -v \"$AZ_BATCH_TASK_WORKING_DIR\":/tes {transfer} \
             download --manifest /tes/{DOWNLOAD_MANIFEST} || exit 1\n"
        ));
        s.push_str("write_ts DownloadEnd\n");
        s.push_str(&format!("write_kv FileDownloadSizeInBytes \"$(dir_bytes {roots})\"\n"));

        s.push_str("write_ts ExecutorStart\n");
        s.push_str("rc=0\n");
        for executor in executors {
            s.push_str(&format!(
                "[ \"$rc\" -eq 0 ] && {{ {} || rc=$?; }}\n",
                run_command(executor, &mounts)
            ));
        }
        s.push_str("write_ts ExecutorEnd\n");

        s.push_str("write_ts UploadStart\n");
        s.push_str(&format!(
            "docker run --rm {mounts} -v \"$AZ_BATCH_TASK_WORKING_DIR\":/tes {transfer} \
             upload --manifest /tes/{UPLOAD_MANIFEST} || rc=1\n"
        ));
        s.push_str("write_ts UploadEnd\n");
        s.push_str(&format!("write_kv FileUploadSizeInBytes \"$(dir_bytes {roots})\"\n"));

        for (key, column) in [("DiskSizeInKiB", 2), ("DiskUsedInKiB", 3)] {
            s.push_str(&format!(
                "write_kv {key} \"$(df -k \"$AZ_BATCH_TASK_WORKING_DIR\" | \
                 awk 'NR==2 {{print ${column}}}')\"\n"
            ));
        }
        s.push_str(&format!(
            "docker run --rm -v \"$AZ_BATCH_TASK_WORKING_DIR\":/tes {transfer} \
             upload-file /tes/{METRICS_FILE} {}\n",
            shell_quote(metrics_url)
        ));
        s.push_str("exit \"$rc\"\n");
        s
    }

    /// Task that runs the batch script with the scheduler files staged
    /// alongside it.
    pub fn task_spec(
        &self,
        task_id: &TaskId,
        batch_script_url: String,
        download_url: String,
        upload_url: String,
    ) -> TaskSpec {
        TaskSpec {
            task_id: task_id.clone(),
            command_line: format!("/bin/sh {BATCH_SCRIPT}"),
            resource_files: vec![
                ResourceFile {
                    file_path: BATCH_SCRIPT.to_string(),
                    http_url: batch_script_url,
                },
                ResourceFile {
                    file_path: DOWNLOAD_MANIFEST.to_string(),
                    http_url: download_url,
                },
                ResourceFile {
                    file_path: UPLOAD_MANIFEST.to_string(),
                    http_url: upload_url,
                },
            ],
        }
    }

    fn mounts(&self) -> String {
        self.config
            .storage
            .execution_roots
            .iter()
            .map(|root| {
                let root = shell_quote(root);
                format!("-v \"$AZ_BATCH_TASK_WORKING_DIR\"{root}:{root}")
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn run_command(executor: &Executor, mounts: &str) -> String {
    let mut parts = vec!["docker run --rm".to_string(), mounts.to_string()];
    if let Some(workdir) = &executor.workdir {
        parts.push(format!("-w {}", shell_quote(workdir)));
    }
    parts.push("--entrypoint=".to_string());
    parts.push(shell_quote(&executor.image));
    parts.extend(executor.command.iter().map(|arg| shell_quote(arg)));
    parts.join(" ")
}

/// Quotes `s` for a POSIX shell. Plain words are left as they are.
pub fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}
