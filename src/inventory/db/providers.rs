use super::InventoryDb;
use crate::inventory::StorageProviderRecord;
use crate::inventory::schema::storage_providers::{self, dsl as providers_dsl};
use crate::utils::now_secs;
use anyhow::{Context, Result};
use diesel::prelude::*;

impl InventoryDb {
    pub fn insert_provider(&self, record: &StorageProviderRecord) -> Result<()> {
        let mut conn = self.connection()?;
        diesel::insert_into(storage_providers::table)
            .values(&ProviderRow::from(record))
            .execute(&mut conn)
            .context("Failed to insert storage provider")?;
        Ok(())
    }

    pub fn get_provider(&self, provider_id: &str) -> Result<Option<StorageProviderRecord>> {
        let mut conn = self.connection()?;
        let row = providers_dsl::storage_providers
            .filter(providers_dsl::id.eq(provider_id))
            .first::<ProviderRow>(&mut conn)
            .optional()
            .context("Failed to query storage provider")?;
        Ok(row.map(StorageProviderRecord::from))
    }

    pub fn list_providers(&self, workspace_id: &str) -> Result<Vec<StorageProviderRecord>> {
        let mut conn = self.connection()?;
        let rows = providers_dsl::storage_providers
            .filter(providers_dsl::workspace_id.eq(workspace_id))
            .order(providers_dsl::created_at.asc())
            .load::<ProviderRow>(&mut conn)
            .context("Failed to list storage providers")?;
        Ok(rows.into_iter().map(StorageProviderRecord::from).collect())
    }

    pub fn update_provider_quota(&self, provider_id: &str, used: u64, total: Option<u64>) -> Result<()> {
        let mut conn = self.connection()?;
        diesel::update(providers_dsl::storage_providers.filter(providers_dsl::id.eq(provider_id)))
            .set((
                providers_dsl::quota_used.eq(used as i64),
                providers_dsl::quota_total.eq(total.map(|t| t as i64)),
                providers_dsl::updated_at.eq(now_secs()),
            ))
            .execute(&mut conn)
            .context("Failed to update provider quota")?;
        Ok(())
    }

    pub fn touch_provider_sync(&self, provider_id: &str, synced_at: i64) -> Result<()> {
        let mut conn = self.connection()?;
        diesel::update(providers_dsl::storage_providers.filter(providers_dsl::id.eq(provider_id)))
            .set((
                providers_dsl::last_sync_at.eq(Some(synced_at)),
                providers_dsl::updated_at.eq(now_secs()),
            ))
            .execute(&mut conn)
            .context("Failed to update provider sync time")?;
        Ok(())
    }

    /// Delete a provider. Its files cascade.
    pub fn delete_provider(&self, provider_id: &str) -> Result<bool> {
        let mut conn = self.connection()?;
        let affected =
            diesel::delete(providers_dsl::storage_providers.filter(providers_dsl::id.eq(provider_id)))
                .execute(&mut conn)
                .context("Failed to delete storage provider")?;
        Ok(affected > 0)
    }
}

// ===== Row Types =====

#[derive(Queryable, Insertable)]
#[diesel(table_name = storage_providers)]
struct ProviderRow {
    id: String,
    workspace_id: String,
    name: String,
    provider_type: String,
    encrypted_config: String,
    root_folder_id: Option<String>,
    quota_used: i64,
    quota_total: Option<i64>,
    last_sync_at: Option<i64>,
    is_active: bool,
    created_at: i64,
    updated_at: i64,
}

impl From<&StorageProviderRecord> for ProviderRow {
    fn from(record: &StorageProviderRecord) -> Self {
        Self {
            id: record.id.clone(),
            workspace_id: record.workspace_id.clone(),
            name: record.name.clone(),
            provider_type: record.provider_type.clone(),
            encrypted_config: record.encrypted_config.clone(),
            root_folder_id: record.root_folder_id.clone(),
            quota_used: record.quota_used as i64,
            quota_total: record.quota_total.map(|t| t as i64),
            last_sync_at: record.last_sync_at,
            is_active: record.is_active,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

impl From<ProviderRow> for StorageProviderRecord {
    fn from(row: ProviderRow) -> Self {
        Self {
            id: row.id,
            workspace_id: row.workspace_id,
            name: row.name,
            provider_type: row.provider_type,
            encrypted_config: row.encrypted_config,
            root_folder_id: row.root_folder_id,
            quota_used: row.quota_used.max(0) as u64,
            quota_total: row.quota_total.map(|t| t.max(0) as u64),
            last_sync_at: row.last_sync_at,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
