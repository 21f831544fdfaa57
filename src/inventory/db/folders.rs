use super::InventoryDb;
use crate::inventory::FolderNode;
use crate::inventory::schema::folders::{self, dsl as folders_dsl};
use anyhow::{Context, Result};
use diesel::prelude::*;

impl InventoryDb {
    pub fn get_folder(&self, folder_id: &str) -> Result<Option<FolderNode>> {
        let mut conn = self.connection()?;
        let row = folders_dsl::folders
            .filter(folders_dsl::id.eq(folder_id))
            .first::<FolderRow>(&mut conn)
            .optional()
            .context("Failed to query folder")?;
        Ok(row.map(FolderNode::from))
    }

    /// Look up a folder by virtual path, including soft-deleted ones
    pub fn find_folder_by_path(&self, workspace_id: &str, virtual_path: &str) -> Result<Option<FolderNode>> {
        let mut conn = self.connection()?;
        let row = folders_dsl::folders
            .filter(folders_dsl::workspace_id.eq(workspace_id))
            .filter(folders_dsl::virtual_path.eq(virtual_path))
            .first::<FolderRow>(&mut conn)
            .optional()
            .context("Failed to query folder by path")?;
        Ok(row.map(FolderNode::from))
    }

    pub fn insert_folder(&self, folder: &FolderNode) -> Result<()> {
        let mut conn = self.connection()?;
        diesel::insert_into(folders::table)
            .values(&FolderRow::from(folder))
            .execute(&mut conn)
            .context("Failed to insert folder")?;
        Ok(())
    }

    /// Overwrite every mutable column of a folder by id
    pub fn update_folder(&self, folder: &FolderNode) -> Result<()> {
        let mut conn = self.connection()?;
        diesel::update(folders_dsl::folders.filter(folders_dsl::id.eq(&folder.id)))
            .set((
                folders_dsl::virtual_path.eq(&folder.virtual_path),
                folders_dsl::name.eq(&folder.name),
                folders_dsl::remote_id.eq(&folder.remote_id),
                folders_dsl::provider_id.eq(&folder.provider_id),
                folders_dsl::parent_id.eq(&folder.parent_id),
                folders_dsl::is_deleted.eq(folder.is_deleted),
                folders_dsl::starred.eq(folder.starred),
                folders_dsl::updated_at.eq(folder.updated_at),
            ))
            .execute(&mut conn)
            .context("Failed to update folder")?;
        Ok(())
    }

    pub fn count_folders(&self, workspace_id: &str) -> Result<i64> {
        let mut conn = self.connection()?;
        folders_dsl::folders
            .filter(folders_dsl::workspace_id.eq(workspace_id))
            .count()
            .get_result(&mut conn)
            .context("Failed to count folders")
    }
}

// ===== Row Types =====

#[derive(Queryable, Insertable)]
#[diesel(table_name = folders)]
struct FolderRow {
    id: String,
    workspace_id: String,
    virtual_path: String,
    name: String,
    remote_id: Option<String>,
    provider_id: Option<String>,
    parent_id: Option<String>,
    created_by: String,
    is_deleted: bool,
    starred: bool,
    created_at: i64,
    updated_at: i64,
}

impl From<&FolderNode> for FolderRow {
    fn from(folder: &FolderNode) -> Self {
        Self {
            id: folder.id.clone(),
            workspace_id: folder.workspace_id.clone(),
            virtual_path: folder.virtual_path.clone(),
            name: folder.name.clone(),
            remote_id: folder.remote_id.clone(),
            provider_id: folder.provider_id.clone(),
            parent_id: folder.parent_id.clone(),
            created_by: folder.created_by.clone(),
            is_deleted: folder.is_deleted,
            starred: folder.starred,
            created_at: folder.created_at,
            updated_at: folder.updated_at,
        }
    }
}

impl From<FolderRow> for FolderNode {
    fn from(row: FolderRow) -> Self {
        Self {
            id: row.id,
            workspace_id: row.workspace_id,
            virtual_path: row.virtual_path,
            name: row.name,
            remote_id: row.remote_id,
            provider_id: row.provider_id,
            parent_id: row.parent_id,
            created_by: row.created_by,
            is_deleted: row.is_deleted,
            starred: row.starred,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
