//! Transfer manifests: the structured output of storage resolution.

use serde::{Deserialize, Serialize};

/// How a file gets between storage and the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransferMechanism {
    /// Written on the node from the manifest itself.
    Inline { content: String },

    /// Copied by the node between `localPath` and `storageUrl`.
    Fetch,

    /// Uploaded from the scheduler's local disk before submission, then
    /// fetched by the node.
    #[serde(rename_all = "camelCase")]
    LocalUpload { source_path: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferEntry {
    /// Never carries a query string.
    pub local_path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_url: Option<String>,

    pub mechanism: TransferMechanism,
}

impl TransferEntry {
    pub fn inline(local_path: String, content: String) -> Self {
        Self {
            local_path,
            storage_url: None,
            mechanism: TransferMechanism::Inline { content },
        }
    }

    pub fn fetch(local_path: String, storage_url: String) -> Self {
        Self {
            local_path,
            storage_url: Some(storage_url),
            mechanism: TransferMechanism::Fetch,
        }
    }

    pub fn local_upload(local_path: String, storage_url: String, source_path: String) -> Self {
        Self {
            local_path,
            storage_url: Some(storage_url),
            mechanism: TransferMechanism::LocalUpload { source_path },
        }
    }
}

/// Ordered download and upload lists for one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferManifests {
    pub download: Vec<TransferEntry>,
    pub upload: Vec<TransferEntry>,
}

impl TransferManifests {
    pub fn download_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.download)
    }

    pub fn upload_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.upload)
    }
}
