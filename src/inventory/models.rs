use serde::{Deserialize, Serialize};

/// A configured backend owned by a workspace
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageProviderRecord {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub provider_type: String,
    /// base64(iv || AES-256-CTR ciphertext) of the provider's JSON config
    #[serde(skip_serializing)]
    pub encrypted_config: String,
    /// Remote id of the folder the provider is rooted at. `None` is the backend root.
    pub root_folder_id: Option<String>,
    pub quota_used: u64,
    pub quota_total: Option<u64>,
    pub last_sync_at: Option<i64>,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A folder in the virtual tree. Addressed by virtual path; the remote id
/// is only a hint since object stores have no real directories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderNode {
    pub id: String,
    pub workspace_id: String,
    pub virtual_path: String,
    pub name: String,
    pub remote_id: Option<String>,
    pub provider_id: Option<String>,
    pub parent_id: Option<String>,
    pub created_by: String,
    pub is_deleted: bool,
    pub starred: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A file in the virtual tree, stored on exactly one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNode {
    pub id: String,
    pub workspace_id: String,
    pub virtual_path: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub hash: Option<String>,
    pub remote_id: String,
    pub provider_id: String,
    pub folder_id: Option<String>,
    pub uploaded_by: String,
    pub is_deleted: bool,
    pub starred: bool,
    pub created_at: i64,
    pub updated_at: i64,
}
