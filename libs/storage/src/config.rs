//! Storage resolution settings.

use url::Url;

use crate::{StorageError, StorageResult};

/// A container (or whole account) reachable with a pre-issued token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalStorageContainer {
    pub account: String,

    /// `None` for an account-level entry.
    pub container: Option<String>,

    /// Query string without the leading `?`, appended verbatim.
    pub token: String,
}

impl ExternalStorageContainer {
    /// Parses one entry of the form `https://account.host[/container][/]?token`.
    pub fn parse(entry: &str) -> StorageResult<Self> {
        let invalid = |message: &str| StorageError::InvalidExternalContainer {
            entry: entry.to_string(),
            message: message.to_string(),
        };

        let url = Url::parse(entry).map_err(|e| invalid(&e.to_string()))?;
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        let account = host
            .split('.')
            .next()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| invalid("missing account name"))?;
        let token = url
            .query()
            .filter(|q| !q.is_empty())
            .ok_or_else(|| invalid("missing token"))?;
        let container = url
            .path_segments()
            .and_then(|mut segments| segments.find(|s| !s.is_empty()))
            .map(str::to_string);

        Ok(Self {
            account: account.to_string(),
            container,
            token: token.to_string(),
        })
    }

    /// Parses a `;`-separated list. Blank entries are skipped.
    pub fn parse_list(list: &str) -> StorageResult<Vec<Self>> {
        list.split(';')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(Self::parse)
            .collect()
    }
}

/// Longest SAS lifetime accepted from configuration (one year).
pub const MAX_SAS_LIFETIME_HOURS: i64 = 365 * 24;

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub default_account: String,

    /// Host suffix after the account name, e.g. `blob.core.windows.net`.
    pub blob_service_host: String,

    /// Prefixes every input and output path must start with.
    pub execution_roots: Vec<String>,

    /// Local directory whose files are uploaded from disk.
    pub staging_dir: String,

    /// Container in the default account holding per-task scheduler files.
    pub internal_container: String,

    pub external_containers: Vec<ExternalStorageContainer>,

    pub sas_lifetime: chrono::Duration,
}

impl StorageConfig {
    pub fn new(default_account: impl Into<String>) -> Self {
        Self {
            default_account: default_account.into(),
            blob_service_host: "blob.core.windows.net".to_string(),
            execution_roots: vec!["/cromwell-executions".to_string(), "/executions".to_string()],
            staging_dir: "/cromwell-tmp".to_string(),
            internal_container: "tes-internal".to_string(),
            external_containers: Vec::new(),
            sas_lifetime: chrono::Duration::hours(48),
        }
    }

    pub fn is_execution_path(&self, path: &str) -> bool {
        self.execution_roots
            .iter()
            .any(|root| path_is_under(path, root))
    }

    pub fn is_staging_path(&self, path: &str) -> bool {
        path_is_under(path, &self.staging_dir)
    }

    /// Container entries win over account-level entries.
    pub fn find_external(
        &self,
        account: &str,
        container: &str,
    ) -> Option<&ExternalStorageContainer> {
        let same_account = |c: &&ExternalStorageContainer| c.account.eq_ignore_ascii_case(account);

        self.external_containers
            .iter()
            .filter(same_account)
            .find(|c| {
                c.container
                    .as_deref()
                    .is_some_and(|name| name.eq_ignore_ascii_case(container))
            })
            .or_else(|| {
                self.external_containers
                    .iter()
                    .filter(same_account)
                    .find(|c| c.container.is_none())
            })
    }

    /// `'/a' or '/b'`, for error messages.
    pub(crate) fn execution_roots_display(&self) -> String {
        self.execution_roots
            .iter()
            .map(|root| format!("'{root}'"))
            .collect::<Vec<_>>()
            .join(" or ")
    }
}

fn path_is_under(path: &str, root: &str) -> bool {
    let root = root.trim_end_matches('/');
    path.strip_prefix(root)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}
