//! Storage collaborator interface.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

/// A storage account the caller's identity can see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageAccountInfo {
    pub name: String,

    /// e.g. `https://account.blob.core.windows.net/`
    pub blob_endpoint: String,
}

/// Storage operations the resolver depends on.
///
/// URLs passed in are fully signed where signing applies.
#[async_trait]
pub trait StorageAccess: Send + Sync {
    /// Look up an account. `None` means the caller cannot read it.
    async fn storage_account_info(&self, name: &str) -> Result<Option<StorageAccountInfo>>;

    /// Base64 account key used to sign SAS tokens.
    async fn storage_account_key(&self, info: &StorageAccountInfo) -> Result<String>;

    async fn download_text(&self, url: &str) -> Result<String>;

    async fn upload_text(&self, url: &str, text: &str) -> Result<()>;

    async fn upload_from_local_file(&self, url: &str, local_path: &Path) -> Result<()>;

    async fn blob_exists(&self, url: &str) -> Result<bool>;

    async fn local_file_exists(&self, local_path: &Path) -> Result<bool>;
}
