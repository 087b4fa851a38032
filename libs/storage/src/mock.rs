//! In-memory storage for testing and dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::{strip_query, StorageAccess, StorageAccountInfo};

/// Base64 key handed out for every mock account.
pub const MOCK_ACCOUNT_KEY: &str = "bW9jay1zdG9yYWdlLWFjY291bnQta2V5";

/// One upload seen by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedUpload {
    /// Full URL including the token.
    pub url: String,
    pub text: Option<String>,
    pub local_path: Option<PathBuf>,
}

/// Mock storage: readable accounts, blobs keyed by URL without query, and a
/// fake local disk.
#[derive(Debug, Default)]
pub struct MockStorage {
    host: String,
    accounts: BTreeSet<String>,
    local_files: BTreeSet<PathBuf>,
    blobs: Mutex<BTreeMap<String, String>>,
    uploads: Mutex<Vec<RecordedUpload>>,
}

impl MockStorage {
    /// Create a mock storage for the given blob service host.
    pub fn new(blob_service_host: impl Into<String>) -> Self {
        Self {
            host: blob_service_host.into(),
            ..Self::default()
        }
    }

    /// Make an account readable by the caller.
    #[must_use]
    pub fn with_account(mut self, name: &str) -> Self {
        self.accounts.insert(name.to_ascii_lowercase());
        self
    }

    #[must_use]
    pub fn with_blob(self, url: &str, text: &str) -> Self {
        self.lock_blobs()
            .insert(strip_query(url).to_string(), text.to_string());
        self
    }

    #[must_use]
    pub fn with_local_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_files.insert(path.into());
        self
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.uploads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Text of the last upload whose URL contains `fragment`.
    pub fn uploaded_text(&self, fragment: &str) -> Option<String> {
        self.uploads()
            .into_iter()
            .rev()
            .find(|u| u.url.contains(fragment))
            .and_then(|u| u.text)
    }

    fn lock_blobs(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.blobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, upload: RecordedUpload) -> Result<()> {
        self.uploads
            .lock()
            .map_err(|_| anyhow!("upload log poisoned"))?
            .push(upload);
        Ok(())
    }
}

#[async_trait]
impl StorageAccess for MockStorage {
    async fn storage_account_info(&self, name: &str) -> Result<Option<StorageAccountInfo>> {
        if !self.accounts.contains(&name.to_ascii_lowercase()) {
            return Ok(None);
        }
        Ok(Some(StorageAccountInfo {
            name: name.to_string(),
            blob_endpoint: format!("https://{name}.{}/", self.host),
        }))
    }

    async fn storage_account_key(&self, _info: &StorageAccountInfo) -> Result<String> {
        Ok(MOCK_ACCOUNT_KEY.to_string())
    }

    async fn download_text(&self, url: &str) -> Result<String> {
        match self.lock_blobs().get(strip_query(url)) {
            Some(text) => Ok(text.clone()),
            None => bail!("[MOCK] blob not found: {}", strip_query(url)),
        }
    }

    async fn upload_text(&self, url: &str, text: &str) -> Result<()> {
        debug!(url = %strip_query(url), bytes = text.len(), "[MOCK] Uploading text");
        self.lock_blobs()
            .insert(strip_query(url).to_string(), text.to_string());
        self.record(RecordedUpload {
            url: url.to_string(),
            text: Some(text.to_string()),
            local_path: None,
        })
    }

    async fn upload_from_local_file(&self, url: &str, local_path: &Path) -> Result<()> {
        if !self.local_files.contains(local_path) {
            bail!("[MOCK] local file not found: {}", local_path.display());
        }
        debug!(url = %strip_query(url), path = %local_path.display(), "[MOCK] Uploading file");
        self.record(RecordedUpload {
            url: url.to_string(),
            text: None,
            local_path: Some(local_path.to_path_buf()),
        })
    }

    async fn blob_exists(&self, url: &str) -> Result<bool> {
        Ok(self.lock_blobs().contains_key(strip_query(url)))
    }

    async fn local_file_exists(&self, local_path: &Path) -> Result<bool> {
        Ok(self.local_files.contains(local_path))
    }
}
