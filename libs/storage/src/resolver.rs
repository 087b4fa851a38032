//! Resolution of declared inputs and outputs into transfer manifests.

use std::path::Path;

use chrono::{DateTime, Utc};
use tesbatch_id::TaskId;
use tesbatch_model::{FileType, Input, Output};
use tracing::{debug, info, instrument};
use url::Url;

use crate::sas::{AccessMode, SasRequest};
use crate::{
    StorageAccess, StorageConfig, StorageError, StorageResult, TransferEntry, TransferManifests,
};

/// Name of the input holding the task's command script.
pub const COMMAND_SCRIPT_INPUT: &str = "commandScript";

/// Returns `s` without its query string.
pub fn strip_query(s: &str) -> &str {
    s.split_once('?').map_or(s, |(head, _)| head)
}

/// How a validated input reaches the node.
enum PlannedInput<'i> {
    Inline {
        local_path: String,
        content: String,
    },
    Staged {
        local_path: &'i str,
        source: &'i str,
    },
    Fetch {
        local_path: String,
        url: &'i str,
        storage_url: String,
        rewrite_script: bool,
    },
}

/// Resolves storage locations for one scheduling call.
///
/// All tokens issued by one resolver share the same validity window.
pub struct StorageResolver<'a> {
    config: &'a StorageConfig,
    access: &'a dyn StorageAccess,
    now: DateTime<Utc>,
}

impl<'a> StorageResolver<'a> {
    pub fn new(config: &'a StorageConfig, access: &'a dyn StorageAccess) -> Self {
        Self {
            config,
            access,
            now: Utc::now(),
        }
    }

    /// Resolves a URL or internal reference. `None` when nothing matches.
    pub async fn resolve_url(&self, raw: &str, mode: AccessMode) -> StorageResult<Option<String>> {
        let raw = raw.trim();

        if let Some(path) = internal_reference(raw) {
            return self.resolve_internal(strip_query(path), mode).await;
        }

        if raw.starts_with("https://") || raw.starts_with("http://") {
            return self.resolve_absolute(raw, mode).await;
        }

        debug!(url = %raw, "Unrecognized storage location");
        Ok(None)
    }

    /// URL of a per-task scheduler file in the internal container.
    pub async fn internal_url(
        &self,
        task_id: &TaskId,
        file_name: &str,
        mode: AccessMode,
    ) -> StorageResult<String> {
        let blob = format!("{task_id}/{file_name}");
        self.default_account_url(&self.config.internal_container, &blob, mode)
            .await
    }

    /// Builds the download and upload manifests for a task.
    ///
    /// Declaration problems come back as `InvalidInput` / `InvalidOutput`.
    /// Nothing is written to storage until every input and output resolves.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub async fn build_manifests(
        &self,
        task_id: &TaskId,
        inputs: &[Input],
        outputs: &[Output],
    ) -> StorageResult<TransferManifests> {
        let rewrites: Vec<(String, String)> = inputs
            .iter()
            .filter(|input| input.path.contains('?'))
            .map(|input| (input.path.clone(), strip_query(&input.path).to_string()))
            .collect();

        let mut planned = Vec::with_capacity(inputs.len());
        for input in inputs {
            planned.push(self.plan_input(task_id, input, &rewrites).await?);
        }

        let mut manifests = TransferManifests::default();
        for output in outputs {
            manifests.upload.push(self.resolve_output(task_id, output).await?);
        }

        for plan in planned {
            let entry = match plan {
                PlannedInput::Inline {
                    local_path,
                    content,
                } => TransferEntry::inline(local_path, content),
                PlannedInput::Staged { local_path, source } => {
                    self.upload_staged_file(local_path, source).await?
                }
                PlannedInput::Fetch {
                    local_path,
                    url,
                    storage_url,
                    rewrite_script,
                } => {
                    if rewrite_script {
                        self.rewrite_command_script(url, &storage_url, &rewrites)
                            .await?;
                    }
                    TransferEntry::fetch(local_path, storage_url)
                }
            };
            manifests.download.push(entry);
        }

        debug!(
            downloads = manifests.download.len(),
            uploads = manifests.upload.len(),
            "Built transfer manifests"
        );

        Ok(manifests)
    }

    /// Validates one input and decides how it reaches the node, without
    /// touching storage contents.
    async fn plan_input<'i>(
        &self,
        task_id: &TaskId,
        input: &'i Input,
        rewrites: &[(String, String)],
    ) -> StorageResult<PlannedInput<'i>> {
        self.validate_input(task_id, input)?;
        let local_path = strip_query(&input.path);

        if let Some(content) = &input.content {
            return Ok(PlannedInput::Inline {
                local_path: local_path.to_string(),
                content: rewrite_paths(content, rewrites),
            });
        }

        // validate_input guarantees a url when there is no content
        let url = input.url.as_deref().unwrap_or_default();

        if let Some(source) = self.staged_source(url).await? {
            return Ok(PlannedInput::Staged { local_path, source });
        }

        let Some(storage_url) = self.resolve_url(url, AccessMode::Read).await? else {
            return Err(StorageError::InvalidInput(format!(
                "Unsupported input url '{url}' for task Id {task_id}. The storage account is \
                 not accessible and no external storage container matches it."
            )));
        };

        Ok(PlannedInput::Fetch {
            local_path: local_path.to_string(),
            url,
            storage_url,
            rewrite_script: input.name.as_deref() == Some(COMMAND_SCRIPT_INPUT)
                && !rewrites.is_empty()
                && internal_reference(url).is_some(),
        })
    }

    fn validate_input(&self, task_id: &TaskId, input: &Input) -> StorageResult<()> {
        if !self.config.is_execution_path(&input.path) {
            return Err(StorageError::InvalidInput(format!(
                "Unsupported input path '{}' for task Id {task_id}. Must start with {}.",
                input.path,
                self.config.execution_roots_display()
            )));
        }

        let has_url = input.url.as_deref().is_some_and(|u| !u.trim().is_empty());
        match (has_url, input.content.is_some()) {
            (false, false) => {
                return Err(StorageError::InvalidInput(
                    "One of Input Url or Content must be set".to_string(),
                ))
            }
            (true, true) => {
                return Err(StorageError::InvalidInput(
                    "Input Url and Content cannot be both set".to_string(),
                ))
            }
            _ => {}
        }

        if input.kind == FileType::Directory {
            return Err(StorageError::InvalidInput(
                "Directory input is not supported.".to_string(),
            ));
        }

        Ok(())
    }

    async fn resolve_output(
        &self,
        task_id: &TaskId,
        output: &Output,
    ) -> StorageResult<TransferEntry> {
        if !self.config.is_execution_path(&output.path) {
            return Err(StorageError::InvalidOutput(format!(
                "Unsupported output path '{}' for task Id {task_id}. Must start with {}.",
                output.path,
                self.config.execution_roots_display()
            )));
        }

        let Some(url) = output.url.as_deref().filter(|u| !u.trim().is_empty()) else {
            return Err(StorageError::InvalidOutput("Output Url must be set".to_string()));
        };

        let Some(storage_url) = self.resolve_url(url, AccessMode::Write).await? else {
            return Err(StorageError::InvalidOutput(format!(
                "Unsupported output url '{url}' for task Id {task_id}."
            )));
        };

        Ok(TransferEntry::fetch(
            strip_query(&output.path).to_string(),
            storage_url,
        ))
    }

    /// Local path of a staged file that exists on disk, if `url` names one.
    async fn staged_source<'u>(&self, url: &'u str) -> StorageResult<Option<&'u str>> {
        let source = url.strip_prefix("file://").unwrap_or(url);
        if !self.config.is_staging_path(source) {
            return Ok(None);
        }
        if !self.access.local_file_exists(Path::new(source)).await? {
            debug!(path = %source, "Staged file not present locally");
            return Ok(None);
        }
        Ok(Some(source))
    }

    /// Files under the staging directory are pushed from local disk to the
    /// default account at the input's declared path.
    async fn upload_staged_file(
        &self,
        local_path: &str,
        source: &str,
    ) -> StorageResult<TransferEntry> {
        let (container, blob) = split_container(local_path.trim_start_matches('/'));

        let upload_url = self
            .default_account_url(container, blob, AccessMode::Write)
            .await?;
        self.access
            .upload_from_local_file(&upload_url, Path::new(source))
            .await?;
        info!(path = %source, destination = %strip_query(&upload_url), "Uploaded staged input");

        let read_url = self
            .default_account_url(container, blob, AccessMode::Read)
            .await?;
        Ok(TransferEntry::local_upload(
            local_path.to_string(),
            read_url,
            source.to_string(),
        ))
    }

    async fn rewrite_command_script(
        &self,
        url: &str,
        read_url: &str,
        rewrites: &[(String, String)],
    ) -> StorageResult<()> {
        let original = self.access.download_text(read_url).await?;
        let rewritten = rewrite_paths(&original, rewrites);
        if rewritten == original {
            return Ok(());
        }

        if let Some(write_url) = self.resolve_url(url, AccessMode::Write).await? {
            self.access.upload_text(&write_url, &rewritten).await?;
            debug!(url = %strip_query(&write_url), "Rewrote local paths in command script");
        }
        Ok(())
    }

    async fn resolve_internal(
        &self,
        path: &str,
        mode: AccessMode,
    ) -> StorageResult<Option<String>> {
        if self.config.is_execution_path(path) {
            let (container, blob) = split_container(path.trim_start_matches('/'));
            return self.default_account_url(container, blob, mode).await.map(Some);
        }

        let Some((account, container, blob)) = split_account_path(path) else {
            return Ok(None);
        };

        if let Some(url) = self.signed_url(account, container, blob, mode).await? {
            return Ok(Some(url));
        }

        Ok(self.config.find_external(account, container).map(|external| {
            let base = format!(
                "https://{account}.{}/{}",
                self.config.blob_service_host,
                join_blob(container, blob)
            );
            format!("{base}?{}", external.token)
        }))
    }

    async fn resolve_absolute(&self, raw: &str, mode: AccessMode) -> StorageResult<Option<String>> {
        let Ok(mut url) = Url::parse(raw) else {
            debug!(url = %raw, "Unparseable storage URL");
            return Ok(None);
        };

        let suffix = format!(".{}", self.config.blob_service_host);
        let Some(account) = url
            .host_str()
            .and_then(|host| host.strip_suffix(suffix.as_str()))
            .map(str::to_string)
        else {
            return Ok(Some(raw.to_string()));
        };

        let path = url.path().trim_start_matches('/').to_string();
        let (container, blob) = split_container(&path);
        if container.is_empty() {
            return Ok(Some(raw.to_string()));
        }

        if let Some(external) = self.config.find_external(&account, container) {
            url.set_query(None);
            return Ok(Some(format!("{url}?{}", external.token)));
        }

        if url.query().is_none() {
            if let Some(signed) = self.signed_url(&account, container, blob, mode).await? {
                return Ok(Some(signed));
            }
        }

        Ok(Some(raw.to_string()))
    }

    async fn default_account_url(
        &self,
        container: &str,
        blob: &str,
        mode: AccessMode,
    ) -> StorageResult<String> {
        self.signed_url(&self.config.default_account, container, blob, mode)
            .await?
            .ok_or_else(|| StorageError::AccountNotAccessible(self.config.default_account.clone()))
    }

    async fn signed_url(
        &self,
        account: &str,
        container: &str,
        blob: &str,
        mode: AccessMode,
    ) -> StorageResult<Option<String>> {
        let Some(info) = self.access.storage_account_info(account).await? else {
            return Ok(None);
        };
        let key = self.access.storage_account_key(&info).await?;
        let expiry = self
            .now
            .checked_add_signed(self.config.sas_lifetime)
            .ok_or(StorageError::SasLifetimeOutOfRange {
                hours: self.config.sas_lifetime.num_hours(),
            })?;

        let token = SasRequest {
            account: &info.name,
            container,
            blob,
            mode,
            start: self.now,
            expiry,
        }
        .sign(&key)?;

        let endpoint = info.blob_endpoint.trim_end_matches('/');
        Ok(Some(format!("{endpoint}/{}?{token}", join_blob(container, blob))))
    }
}

/// `/path` or `file:///path` references, returned as `/path`.
fn internal_reference(raw: &str) -> Option<&str> {
    if let Some(path) = raw.strip_prefix("file://") {
        return Some(path);
    }
    raw.starts_with('/').then_some(raw)
}

fn split_container(path: &str) -> (&str, &str) {
    path.split_once('/').unwrap_or((path, ""))
}

fn split_account_path(path: &str) -> Option<(&str, &str, &str)> {
    let (account, rest) = path.strip_prefix('/')?.split_once('/')?;
    let (container, blob) = split_container(rest);
    if account.is_empty() || container.is_empty() {
        return None;
    }
    Some((account, container, blob))
}

fn join_blob(container: &str, blob: &str) -> String {
    if blob.is_empty() {
        container.to_string()
    } else {
        format!("{container}/{blob}")
    }
}

fn rewrite_paths(text: &str, rewrites: &[(String, String)]) -> String {
    rewrites
        .iter()
        .fold(text.to_string(), |acc, (from, to)| acc.replace(from.as_str(), to))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_query() {
        assert_eq!(strip_query("/a/b?x=1"), "/a/b");
        assert_eq!(strip_query("/a/b"), "/a/b");
    }

    #[test]
    fn test_internal_reference() {
        assert_eq!(internal_reference("file:///acct/c/b"), Some("/acct/c/b"));
        assert_eq!(internal_reference("/acct/c/b"), Some("/acct/c/b"));
        assert_eq!(internal_reference("https://host/x"), None);
        assert_eq!(internal_reference("xyz/path"), None);
    }

    #[test]
    fn test_split_account_path() {
        assert_eq!(
            split_account_path("/acct/container/dir/blob"),
            Some(("acct", "container", "dir/blob"))
        );
        assert_eq!(split_account_path("/acct/container"), Some(("acct", "container", "")));
        assert_eq!(split_account_path("/acct"), None);
        assert_eq!(split_account_path("//container/blob"), None);
    }

    #[test]
    fn test_rewrite_paths() {
        let rewrites = vec![(
            "/cromwell-executions/wf/inputs/host/path?param=2".to_string(),
            "/cromwell-executions/wf/inputs/host/path".to_string(),
        )];
        assert_eq!(
            rewrite_paths("cat /cromwell-executions/wf/inputs/host/path?param=2", &rewrites),
            "cat /cromwell-executions/wf/inputs/host/path"
        );
    }
}
