//! Configuration for the scheduler.

use std::str::FromStr;

use tesbatch_storage::{ExternalStorageContainer, StorageConfig, MAX_SAS_LIFETIME_HOURS};

use crate::error::{SchedulerError, SchedulerResult};

/// Default image that moves files between storage and the node.
pub const DEFAULT_TRANSFER_IMAGE: &str = "mcr.microsoft.com/blobxfer";

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Region used for catalog lookups.
    pub region: String,

    pub storage: StorageConfig,

    /// Sizes or families allowed account-wide. Empty means no restriction.
    pub allowed_vm_sizes: Vec<String>,

    /// Forces low-priority VMs for every task.
    pub use_preemptible_vms_only: bool,

    /// A dedicated VM priced above this multiple of the cheapest
    /// low-priority VM is swapped for the low-priority one.
    pub low_priority_fallback_ratio: f64,

    /// Allocation failures tolerated before a task fails.
    pub max_allocation_retries: u32,

    pub pool_id_prefix: String,

    /// Subnet for pool nodes.
    pub nodes_subnet_id: Option<String>,

    pub disable_nodes_public_ip: bool,

    pub transfer_image: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl SchedulerConfig {
    /// Defaults for everything except the default storage account.
    pub fn new(default_storage_account: impl Into<String>) -> Self {
        Self {
            region: "eastus".to_string(),
            storage: StorageConfig::new(default_storage_account),
            allowed_vm_sizes: Vec::new(),
            use_preemptible_vms_only: false,
            low_priority_fallback_ratio: 2.0,
            max_allocation_retries: tesbatch_reconcile::DEFAULT_MAX_RETRIES,
            pool_id_prefix: "TES".to_string(),
            nodes_subnet_id: None,
            disable_nodes_public_ip: false,
            transfer_image: DEFAULT_TRANSFER_IMAGE.to_string(),
            log_level: "info".to_string(),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> SchedulerResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> SchedulerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let default_account = get("TESBATCH_DEFAULT_STORAGE_ACCOUNT").ok_or_else(|| {
            SchedulerError::InvalidConfig(
                "TESBATCH_DEFAULT_STORAGE_ACCOUNT must be set".to_string(),
            )
        })?;
        let mut config = Self::new(default_account);

        if let Some(region) = get("TESBATCH_REGION") {
            config.region = region;
        }

        // Storage
        if let Some(host) = get("TESBATCH_BLOB_SERVICE_HOST") {
            config.storage.blob_service_host = host;
        }
        if let Some(roots) = get("TESBATCH_EXECUTION_ROOTS") {
            config.storage.execution_roots = split_list(&roots);
        }
        if let Some(dir) = get("TESBATCH_STAGING_DIR") {
            config.storage.staging_dir = dir;
        }
        if let Some(container) = get("TESBATCH_INTERNAL_CONTAINER") {
            config.storage.internal_container = container;
        }
        if let Some(list) = get("TESBATCH_EXTERNAL_STORAGE_CONTAINERS") {
            config.storage.external_containers = ExternalStorageContainer::parse_list(&list)
                .map_err(|e| SchedulerError::InvalidConfig(e.to_string()))?;
        }
        if let Some(hours) = parse::<i64>(
            get("TESBATCH_SAS_LIFETIME_HOURS"),
            "TESBATCH_SAS_LIFETIME_HOURS",
        )? {
            config.storage.sas_lifetime = chrono::TimeDelta::try_hours(hours).ok_or_else(|| {
                SchedulerError::InvalidConfig(format!(
                    "TESBATCH_SAS_LIFETIME_HOURS is out of range: {hours}"
                ))
            })?;
        }

        // VM selection
        if let Some(sizes) = get("TESBATCH_ALLOWED_VM_SIZES") {
            config.allowed_vm_sizes = split_list(&sizes);
        }
        if let Some(flag) = parse(
            get("TESBATCH_USE_PREEMPTIBLE_VMS_ONLY"),
            "TESBATCH_USE_PREEMPTIBLE_VMS_ONLY",
        )? {
            config.use_preemptible_vms_only = flag;
        }
        if let Some(ratio) = parse::<f64>(
            get("TESBATCH_LOW_PRIORITY_FALLBACK_RATIO"),
            "TESBATCH_LOW_PRIORITY_FALLBACK_RATIO",
        )? {
            config.low_priority_fallback_ratio = ratio;
        }
        if let Some(retries) = parse(
            get("TESBATCH_MAX_ALLOCATION_RETRIES"),
            "TESBATCH_MAX_ALLOCATION_RETRIES",
        )? {
            config.max_allocation_retries = retries;
        }

        // Pools
        if let Some(prefix) = get("TESBATCH_POOL_ID_PREFIX") {
            config.pool_id_prefix = prefix;
        }
        config.nodes_subnet_id = get("TESBATCH_NODES_SUBNET_ID");
        if let Some(flag) = parse(
            get("TESBATCH_DISABLE_NODES_PUBLIC_IP"),
            "TESBATCH_DISABLE_NODES_PUBLIC_IP",
        )? {
            config.disable_nodes_public_ip = flag;
        }
        if let Some(image) = get("TESBATCH_TRANSFER_IMAGE") {
            config.transfer_image = image;
        }

        if let Some(level) = get("TESBATCH_LOG_LEVEL") {
            config.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if !self.low_priority_fallback_ratio.is_finite() || self.low_priority_fallback_ratio < 1.0 {
            return Err(SchedulerError::InvalidConfig(format!(
                "low priority fallback ratio must be at least 1.0, got {}",
                self.low_priority_fallback_ratio
            )));
        }
        if self.storage.execution_roots.is_empty() {
            return Err(SchedulerError::InvalidConfig(
                "at least one execution root is required".to_string(),
            ));
        }
        if self.storage.sas_lifetime <= chrono::Duration::zero() {
            return Err(SchedulerError::InvalidConfig(
                "SAS lifetime must be positive".to_string(),
            ));
        }
        if self.storage.sas_lifetime > chrono::Duration::hours(MAX_SAS_LIFETIME_HOURS) {
            return Err(SchedulerError::InvalidConfig(format!(
                "SAS lifetime must be at most {MAX_SAS_LIFETIME_HOURS} hours, got {}",
                self.storage.sas_lifetime.num_hours()
            )));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(value: Option<String>, key: &str) -> SchedulerResult<Option<T>> {
    value
        .map(|v| {
            v.parse::<T>().map_err(|_| {
                SchedulerError::InvalidConfig(format!("{key} has an invalid value '{v}'"))
            })
        })
        .transpose()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split([',', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::from_lookup(lookup(&[(
            "TESBATCH_DEFAULT_STORAGE_ACCOUNT",
            "defaultstorageaccount",
        )]))
        .unwrap();
        assert_eq!(config.storage.default_account, "defaultstorageaccount");
        assert_eq!(config.low_priority_fallback_ratio, 2.0);
        assert_eq!(config.max_allocation_retries, 3);
        assert_eq!(config.pool_id_prefix, "TES");
        assert!(config.nodes_subnet_id.is_none());
        assert!(!config.use_preemptible_vms_only);
    }

    #[test]
    fn test_default_account_required() {
        let err = SchedulerConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidConfig(_)));
    }

    #[test]
    fn test_overrides() {
        let config = SchedulerConfig::from_lookup(lookup(&[
            ("TESBATCH_DEFAULT_STORAGE_ACCOUNT", "acct"),
            ("TESBATCH_ALLOWED_VM_SIZES", "VmSize1, VmFamily2"),
            ("TESBATCH_USE_PREEMPTIBLE_VMS_ONLY", "true"),
            ("TESBATCH_LOW_PRIORITY_FALLBACK_RATIO", "1.5"),
            ("TESBATCH_MAX_ALLOCATION_RETRIES", "5"),
            ("TESBATCH_NODES_SUBNET_ID", "subnet1"),
            ("TESBATCH_DISABLE_NODES_PUBLIC_IP", "true"),
            ("TESBATCH_SAS_LIFETIME_HOURS", "12"),
            ("TESBATCH_EXTERNAL_STORAGE_CONTAINERS", "https://ext.blob.core.windows.net/c?sas"),
        ]))
        .unwrap();

        assert_eq!(config.allowed_vm_sizes, vec!["VmSize1", "VmFamily2"]);
        assert!(config.use_preemptible_vms_only);
        assert_eq!(config.low_priority_fallback_ratio, 1.5);
        assert_eq!(config.max_allocation_retries, 5);
        assert_eq!(config.nodes_subnet_id.as_deref(), Some("subnet1"));
        assert!(config.disable_nodes_public_ip);
        assert_eq!(config.storage.sas_lifetime, chrono::Duration::hours(12));
        assert_eq!(config.storage.external_containers.len(), 1);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = SchedulerConfig::from_lookup(lookup(&[
            ("TESBATCH_DEFAULT_STORAGE_ACCOUNT", "acct"),
            ("TESBATCH_MAX_ALLOCATION_RETRIES", "many"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("TESBATCH_MAX_ALLOCATION_RETRIES"));

        let err = SchedulerConfig::from_lookup(lookup(&[
            ("TESBATCH_DEFAULT_STORAGE_ACCOUNT", "acct"),
            ("TESBATCH_LOW_PRIORITY_FALLBACK_RATIO", "0.5"),
        ]))
        .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidConfig(_)));
    }

    #[test]
    fn test_sas_lifetime_bounds() {
        let with_hours = |hours: &str| {
            SchedulerConfig::from_lookup(lookup(&[
                ("TESBATCH_DEFAULT_STORAGE_ACCOUNT", "acct"),
                ("TESBATCH_SAS_LIFETIME_HOURS", hours),
            ]))
        };

        assert!(with_hours("8760").is_ok());
        for hours in ["0", "8761", "9223372036854775807", "-9223372036854775808"] {
            let err = with_hours(hours).unwrap_err();
            assert!(matches!(err, SchedulerError::InvalidConfig(_)), "{hours}: {err}");
        }
    }

    #[test]
    fn test_oversized_lifetime_rejected_by_validate() {
        let mut config = SchedulerConfig::new("acct");
        config.storage.sas_lifetime = chrono::Duration::days(100_000_000);
        assert!(matches!(config.validate(), Err(SchedulerError::InvalidConfig(_))));
    }
}
