//! Walks a provider's remote tree and makes the inventory match it.
//!
//! Folders are matched by virtual path since most backends have no stable
//! folder identity. Files are matched by `(remote_id, provider_id)`, then
//! by virtual path. A failure on one node is logged and skipped; it never
//! aborts the walk.

use crate::error::{EngineError, EngineResult};
use crate::inventory::{FileNode, FolderNode, InventoryDb, StorageProviderRecord};
use crate::providers::{DEFAULT_LIST_LIMIT, FileMetadata, FolderMetadata, ListOptions, StorageProvider};
use crate::utils::mime::guess_from_name;
use crate::utils::now_secs;
use crate::utils::path::{join_path, remote_name_segment};
use serde::Serialize;
use std::collections::HashSet;
use uuid::Uuid;

/// Progress is published every this many processed items
pub const PROGRESS_EVERY: usize = 10;

/// Asymptotic progress for a walk of unknown size, capped below completion
pub fn sync_progress(processed: usize) -> f64 {
    if processed == 0 {
        return 0.0;
    }
    let n = processed as f64;
    (n / (n + 20.0)).min(0.95)
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub recursive: bool,
    pub prune_deleted: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            prune_deleted: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub processed: usize,
    pub folders_created: usize,
    pub folders_updated: usize,
    pub files_created: usize,
    pub files_updated: usize,
    pub files_revived: usize,
    pub files_pruned: usize,
    /// Nodes or folders that could not be reconciled
    pub failures: Vec<String>,
}

impl SyncSummary {
    /// Rows inserted or changed by this pass
    pub fn changes(&self) -> usize {
        self.folders_created
            + self.folders_updated
            + self.files_created
            + self.files_updated
            + self.files_revived
            + self.files_pruned
    }
}

enum Change {
    Created,
    Updated,
    Revived,
    Unchanged,
}

/// Remote folder waiting to be listed
struct PendingFolder {
    remote_id: Option<String>,
    local_id: Option<String>,
    path: String,
}

pub struct Reconciler<'a> {
    db: &'a InventoryDb,
    provider: &'a dyn StorageProvider,
    record: &'a StorageProviderRecord,
    user_id: &'a str,
    options: SyncOptions,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        db: &'a InventoryDb,
        provider: &'a dyn StorageProvider,
        record: &'a StorageProviderRecord,
        user_id: &'a str,
        options: SyncOptions,
    ) -> Self {
        Self {
            db,
            provider,
            record,
            user_id,
            options,
        }
    }

    /// Walk the tree from the provider's root folder. `on_progress` receives
    /// the processed count every [`PROGRESS_EVERY`] items.
    pub async fn run(&self, mut on_progress: impl FnMut(usize)) -> EngineResult<SyncSummary> {
        let mut summary = SyncSummary::default();
        let mut seen_files: HashSet<String> = HashSet::new();
        let mut walk_complete = true;
        let mut pending = vec![PendingFolder {
            remote_id: self.record.root_folder_id.clone(),
            local_id: None,
            path: "/".to_string(),
        }];

        while let Some(folder) = pending.pop() {
            let is_root = folder.local_id.is_none() && folder.path == "/";
            let mut page_token: Option<String> = None;
            loop {
                let listing = self
                    .provider
                    .list(&ListOptions {
                        folder_id: folder.remote_id.clone(),
                        limit: Some(DEFAULT_LIST_LIMIT),
                        page_token: page_token.clone(),
                    })
                    .await;
                let listing = match listing {
                    Ok(listing) => listing,
                    // Without the root listing there is nothing to reconcile
                    Err(e) if is_root => return Err(e.into()),
                    Err(e) => {
                        tracing::warn!(target: "sync", provider_id = %self.record.id, path = %folder.path, error = %e, "Failed to list remote folder");
                        summary.failures.push(format!("{}: {}", folder.path, e));
                        walk_complete = false;
                        break;
                    }
                };

                for remote in &listing.folders {
                    match self.reconcile_folder(remote, folder.local_id.as_deref(), &folder.path) {
                        Ok((local, change)) => {
                            match change {
                                Change::Created => summary.folders_created += 1,
                                Change::Updated | Change::Revived => summary.folders_updated += 1,
                                Change::Unchanged => {}
                            }
                            if self.options.recursive {
                                pending.push(PendingFolder {
                                    remote_id: Some(remote.remote_id.clone()),
                                    local_id: Some(local.id),
                                    path: local.virtual_path,
                                });
                            }
                        }
                        Err(e) => {
                            tracing::warn!(target: "sync", provider_id = %self.record.id, remote_id = %remote.remote_id, error = %e, "Skipping folder");
                            summary.failures.push(format!("{}: {}", remote.remote_id, e));
                            // Its subtree stays unlisted
                            walk_complete = false;
                        }
                    }
                    summary.processed += 1;
                    if summary.processed % PROGRESS_EVERY == 0 {
                        on_progress(summary.processed);
                    }
                }

                for remote in &listing.files {
                    seen_files.insert(remote.remote_id.clone());
                    match self.reconcile_file(remote, folder.local_id.as_deref(), &folder.path) {
                        Ok(Change::Created) => summary.files_created += 1,
                        Ok(Change::Updated) => summary.files_updated += 1,
                        Ok(Change::Revived) => summary.files_revived += 1,
                        Ok(Change::Unchanged) => {}
                        Err(e) => {
                            tracing::warn!(target: "sync", provider_id = %self.record.id, remote_id = %remote.remote_id, error = %e, "Skipping file");
                            summary.failures.push(format!("{}: {}", remote.remote_id, e));
                        }
                    }
                    summary.processed += 1;
                    if summary.processed % PROGRESS_EVERY == 0 {
                        on_progress(summary.processed);
                    }
                }

                match listing.next_page_token {
                    Some(next) if page_token.as_deref() != Some(next.as_str()) => page_token = Some(next),
                    Some(_) => {
                        tracing::warn!(target: "sync", provider_id = %self.record.id, path = %folder.path, "Provider repeated a page token, stopping pagination");
                        break;
                    }
                    None => break,
                }
            }
        }

        if self.options.prune_deleted {
            if !self.options.recursive || !walk_complete {
                tracing::warn!(target: "sync", provider_id = %self.record.id, "Skipping prune, the walk did not cover the whole tree");
            } else if seen_files.is_empty() {
                tracing::warn!(target: "sync", provider_id = %self.record.id, "Skipping prune, no remote files were seen");
            } else {
                summary.files_pruned = self
                    .db
                    .soft_delete_unseen_files(&self.record.id, &seen_files, now_secs())?;
            }
        }

        tracing::info!(
            target: "sync",
            provider_id = %self.record.id,
            processed = summary.processed,
            changes = summary.changes(),
            failures = summary.failures.len(),
            "Reconciliation finished"
        );
        Ok(summary)
    }

    fn reconcile_folder(
        &self,
        remote: &FolderMetadata,
        parent_id: Option<&str>,
        parent_path: &str,
    ) -> EngineResult<(FolderNode, Change)> {
        let name = remote_name_segment(&remote.name);
        let path = join_path(parent_path, &name);
        let stamp = timestamp(remote.modified_at);

        match self.db.find_folder_by_path(&self.record.workspace_id, &path)? {
            Some(existing) => {
                let owned_here = existing
                    .provider_id
                    .as_deref()
                    .is_none_or(|id| id == self.record.id);
                let mut next = FolderNode {
                    name,
                    parent_id: parent_id.map(str::to_string),
                    is_deleted: false,
                    ..existing.clone()
                };
                if owned_here {
                    next.remote_id = Some(remote.remote_id.clone());
                    next.provider_id = Some(self.record.id.clone());
                }
                if next == existing {
                    return Ok((existing, Change::Unchanged));
                }
                let change = if existing.is_deleted { Change::Revived } else { Change::Updated };
                next.updated_at = stamp;
                self.db.update_folder(&next)?;
                Ok((next, change))
            }
            None => {
                let folder = FolderNode {
                    id: Uuid::new_v4().to_string(),
                    workspace_id: self.record.workspace_id.clone(),
                    virtual_path: path,
                    name,
                    remote_id: Some(remote.remote_id.clone()),
                    provider_id: Some(self.record.id.clone()),
                    parent_id: parent_id.map(str::to_string),
                    created_by: self.user_id.to_string(),
                    is_deleted: false,
                    starred: false,
                    created_at: stamp,
                    updated_at: stamp,
                };
                self.db.insert_folder(&folder)?;
                Ok((folder, Change::Created))
            }
        }
    }

    fn reconcile_file(&self, remote: &FileMetadata, folder_id: Option<&str>, parent_path: &str) -> EngineResult<Change> {
        let name = remote_name_segment(&remote.name);
        let path = join_path(parent_path, &name);
        let mime_type = if remote.mime_type.is_empty() {
            guess_from_name(&name).to_string()
        } else {
            remote.mime_type.clone()
        };
        let stamp = timestamp(remote.modified_at);

        if let Some(existing) = self.db.find_file_by_remote(&self.record.id, &remote.remote_id)? {
            let mut next = FileNode {
                virtual_path: path,
                name,
                mime_type,
                size: remote.size,
                hash: remote.hash.clone(),
                folder_id: folder_id.map(str::to_string),
                is_deleted: false,
                ..existing.clone()
            };
            if next == existing {
                return Ok(Change::Unchanged);
            }
            next.updated_at = stamp;
            self.db.update_file(&next)?;
            return Ok(if existing.is_deleted { Change::Revived } else { Change::Updated });
        }

        if let Some(occupant) = self.db.find_file_by_path(&self.record.workspace_id, &path)? {
            if !occupant.is_deleted && occupant.provider_id != self.record.id {
                return Err(EngineError::conflict(format!(
                    "{} is already stored on another provider",
                    path
                )));
            }
            let starred = !occupant.is_deleted && occupant.starred;
            let revived = FileNode {
                name,
                mime_type,
                size: remote.size,
                hash: remote.hash.clone(),
                remote_id: remote.remote_id.clone(),
                provider_id: self.record.id.clone(),
                folder_id: folder_id.map(str::to_string),
                is_deleted: false,
                starred,
                updated_at: stamp,
                ..occupant
            };
            self.db.update_file(&revived)?;
            return Ok(Change::Revived);
        }

        self.db.insert_file(&FileNode {
            id: Uuid::new_v4().to_string(),
            workspace_id: self.record.workspace_id.clone(),
            virtual_path: path,
            name,
            mime_type,
            size: remote.size,
            hash: remote.hash.clone(),
            remote_id: remote.remote_id.clone(),
            provider_id: self.record.id.clone(),
            folder_id: folder_id.map(str::to_string),
            uploaded_by: self.user_id.to_string(),
            is_deleted: false,
            starred: false,
            created_at: stamp,
            updated_at: stamp,
        })?;
        Ok(Change::Created)
    }
}

fn timestamp(modified_at: i64) -> i64 {
    if modified_at > 0 { modified_at } else { now_secs() }
}
