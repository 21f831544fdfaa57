use super::InventoryDb;
use crate::inventory::FileNode;
use crate::inventory::schema::files::{self, dsl as files_dsl};
use anyhow::{Context, Result};
use diesel::prelude::*;
use std::collections::HashSet;

/// SQLite caps bound parameters per statement
const ID_BATCH: usize = 500;

impl InventoryDb {
    pub fn get_file(&self, file_id: &str) -> Result<Option<FileNode>> {
        let mut conn = self.connection()?;
        let row = files_dsl::files
            .filter(files_dsl::id.eq(file_id))
            .first::<FileRow>(&mut conn)
            .optional()
            .context("Failed to query file")?;
        Ok(row.map(FileNode::from))
    }

    /// Look up a file by its backend identity, including soft-deleted ones
    pub fn find_file_by_remote(&self, provider_id: &str, remote_id: &str) -> Result<Option<FileNode>> {
        let mut conn = self.connection()?;
        let row = files_dsl::files
            .filter(files_dsl::provider_id.eq(provider_id))
            .filter(files_dsl::remote_id.eq(remote_id))
            .first::<FileRow>(&mut conn)
            .optional()
            .context("Failed to query file by remote id")?;
        Ok(row.map(FileNode::from))
    }

    /// Look up a file by virtual path, including soft-deleted ones
    pub fn find_file_by_path(&self, workspace_id: &str, virtual_path: &str) -> Result<Option<FileNode>> {
        let mut conn = self.connection()?;
        let row = files_dsl::files
            .filter(files_dsl::workspace_id.eq(workspace_id))
            .filter(files_dsl::virtual_path.eq(virtual_path))
            .first::<FileRow>(&mut conn)
            .optional()
            .context("Failed to query file by path")?;
        Ok(row.map(FileNode::from))
    }

    pub fn insert_file(&self, file: &FileNode) -> Result<()> {
        let mut conn = self.connection()?;
        diesel::insert_into(files::table)
            .values(&FileRow::from(file))
            .execute(&mut conn)
            .context("Failed to insert file")?;
        Ok(())
    }

    /// Overwrite every mutable column of a file by id
    pub fn update_file(&self, file: &FileNode) -> Result<()> {
        let mut conn = self.connection()?;
        diesel::update(files_dsl::files.filter(files_dsl::id.eq(&file.id)))
            .set((
                files_dsl::virtual_path.eq(&file.virtual_path),
                files_dsl::name.eq(&file.name),
                files_dsl::mime_type.eq(&file.mime_type),
                files_dsl::size.eq(file.size as i64),
                files_dsl::hash.eq(&file.hash),
                files_dsl::remote_id.eq(&file.remote_id),
                files_dsl::provider_id.eq(&file.provider_id),
                files_dsl::folder_id.eq(&file.folder_id),
                files_dsl::uploaded_by.eq(&file.uploaded_by),
                files_dsl::is_deleted.eq(file.is_deleted),
                files_dsl::starred.eq(file.starred),
                files_dsl::updated_at.eq(file.updated_at),
            ))
            .execute(&mut conn)
            .context("Failed to update file")?;
        Ok(())
    }

    /// Point a file at a new backend location after a transfer
    pub fn set_file_location(&self, file_id: &str, provider_id: &str, remote_id: &str, updated_at: i64) -> Result<()> {
        let mut conn = self.connection()?;
        diesel::update(files_dsl::files.filter(files_dsl::id.eq(file_id)))
            .set((
                files_dsl::provider_id.eq(provider_id),
                files_dsl::remote_id.eq(remote_id),
                files_dsl::updated_at.eq(updated_at),
            ))
            .execute(&mut conn)
            .context("Failed to update file location")?;
        Ok(())
    }

    /// Soft-delete every live file of a provider whose remote id is not in `seen`.
    /// Returns the number of files marked deleted.
    pub fn soft_delete_unseen_files(&self, provider_id: &str, seen: &HashSet<String>, updated_at: i64) -> Result<usize> {
        let mut conn = self.connection()?;
        let live: Vec<(String, String)> = files_dsl::files
            .filter(files_dsl::provider_id.eq(provider_id))
            .filter(files_dsl::is_deleted.eq(false))
            .select((files_dsl::id, files_dsl::remote_id))
            .load(&mut conn)
            .context("Failed to load live files for prune")?;

        let unseen: Vec<String> = live
            .into_iter()
            .filter(|(_, remote_id)| !seen.contains(remote_id))
            .map(|(id, _)| id)
            .collect();
        if unseen.is_empty() {
            return Ok(0);
        }

        conn.immediate_transaction::<_, diesel::result::Error, _>(|tx_conn| {
            let mut total = 0;
            for batch in unseen.chunks(ID_BATCH) {
                total += diesel::update(files_dsl::files.filter(files_dsl::id.eq_any(batch)))
                    .set((
                        files_dsl::is_deleted.eq(true),
                        files_dsl::updated_at.eq(updated_at),
                    ))
                    .execute(tx_conn)?;
            }
            Ok(total)
        })
        .context("Failed to soft-delete unseen files")
    }

    pub fn count_files(&self, workspace_id: &str) -> Result<i64> {
        let mut conn = self.connection()?;
        files_dsl::files
            .filter(files_dsl::workspace_id.eq(workspace_id))
            .count()
            .get_result(&mut conn)
            .context("Failed to count files")
    }

    pub fn list_files_for_provider(&self, provider_id: &str) -> Result<Vec<FileNode>> {
        let mut conn = self.connection()?;
        let rows = files_dsl::files
            .filter(files_dsl::provider_id.eq(provider_id))
            .order(files_dsl::virtual_path.asc())
            .load::<FileRow>(&mut conn)
            .context("Failed to list provider files")?;
        Ok(rows.into_iter().map(FileNode::from).collect())
    }
}

// ===== Row Types =====

#[derive(Queryable, Insertable)]
#[diesel(table_name = files)]
struct FileRow {
    id: String,
    workspace_id: String,
    virtual_path: String,
    name: String,
    mime_type: String,
    size: i64,
    hash: Option<String>,
    remote_id: String,
    provider_id: String,
    folder_id: Option<String>,
    uploaded_by: String,
    is_deleted: bool,
    starred: bool,
    created_at: i64,
    updated_at: i64,
}

impl From<&FileNode> for FileRow {
    fn from(file: &FileNode) -> Self {
        Self {
            id: file.id.clone(),
            workspace_id: file.workspace_id.clone(),
            virtual_path: file.virtual_path.clone(),
            name: file.name.clone(),
            mime_type: file.mime_type.clone(),
            size: file.size as i64,
            hash: file.hash.clone(),
            remote_id: file.remote_id.clone(),
            provider_id: file.provider_id.clone(),
            folder_id: file.folder_id.clone(),
            uploaded_by: file.uploaded_by.clone(),
            is_deleted: file.is_deleted,
            starred: file.starred,
            created_at: file.created_at,
            updated_at: file.updated_at,
        }
    }
}

impl From<FileRow> for FileNode {
    fn from(row: FileRow) -> Self {
        Self {
            id: row.id,
            workspace_id: row.workspace_id,
            virtual_path: row.virtual_path,
            name: row.name,
            mime_type: row.mime_type,
            size: row.size.max(0) as u64,
            hash: row.hash,
            remote_id: row.remote_id,
            provider_id: row.provider_id,
            folder_id: row.folder_id,
            uploaded_by: row.uploaded_by,
            is_deleted: row.is_deleted,
            starred: row.starred,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
