use super::{ProviderQuota, ProviderRegistry, StorageProvider};
use crate::error::{EngineError, EngineResult};
use crate::inventory::{InventoryDb, StorageProviderRecord};
use crate::utils::now_secs;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectProvider {
    pub workspace_id: String,
    pub name: String,
    pub provider_type: String,
    /// Plaintext config; encrypted before it is stored
    pub config: Value,
    #[serde(default)]
    pub root_folder_id: Option<String>,
}

/// Lifecycle of configured providers: connect, look up, refresh, disconnect
#[derive(Clone)]
pub struct ProviderService {
    db: Arc<InventoryDb>,
    registry: Arc<ProviderRegistry>,
}

impl ProviderService {
    pub fn new(db: Arc<InventoryDb>, registry: Arc<ProviderRegistry>) -> Self {
        Self { db, registry }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Verify the backend is reachable, then store the provider with its
    /// config encrypted and its initial quota
    pub async fn connect(&self, params: ConnectProvider) -> EngineResult<StorageProviderRecord> {
        if params.name.trim().is_empty() {
            return Err(EngineError::validation("Provider name is required"));
        }
        if !self.registry.is_registered(&params.provider_type) {
            return Err(EngineError::validation(format!(
                "Unknown provider type: {}",
                params.provider_type
            )));
        }

        let provider = self.registry.create(&params.provider_type, &params.config)?;
        let check = async {
            provider.test_connection().await?;
            provider.get_quota().await
        }
        .await;
        provider.cleanup().await;
        let quota = check?;

        let now = now_secs();
        let record = StorageProviderRecord {
            id: Uuid::new_v4().to_string(),
            workspace_id: params.workspace_id,
            name: params.name.trim().to_string(),
            provider_type: params.provider_type,
            encrypted_config: self.registry.encrypt_config(&params.config)?,
            root_folder_id: params.root_folder_id.filter(|id| !id.is_empty()),
            quota_used: quota.used,
            quota_total: quota.total,
            last_sync_at: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_provider(&record)?;

        tracing::info!(
            target: "providers",
            provider_id = %record.id,
            provider_type = %record.provider_type,
            "Provider connected"
        );
        Ok(record)
    }

    /// A provider of the given workspace. One owned by another workspace is
    /// reported as missing.
    pub fn get_provider(&self, provider_id: &str, workspace_id: &str) -> EngineResult<StorageProviderRecord> {
        self.db
            .get_provider(provider_id)?
            .filter(|record| record.workspace_id == workspace_id)
            .ok_or_else(|| EngineError::not_found("Provider"))
    }

    /// A provider regardless of workspace, for workers that already validated ownership
    pub fn get_provider_unchecked(&self, provider_id: &str) -> EngineResult<StorageProviderRecord> {
        self.db
            .get_provider(provider_id)?
            .ok_or_else(|| EngineError::not_found("Provider"))
    }

    pub fn list_providers(&self, workspace_id: &str) -> EngineResult<Vec<StorageProviderRecord>> {
        Ok(self.db.list_providers(workspace_id)?)
    }

    /// Configured instance for a stored provider. The caller owns cleanup.
    pub fn instance(&self, record: &StorageProviderRecord) -> EngineResult<Arc<dyn StorageProvider>> {
        if !record.is_active {
            return Err(EngineError::validation(format!("Provider {} is not active", record.id)));
        }
        self.registry.instantiate(record)
    }

    /// Read quota from the backend and store it
    pub async fn refresh_quota(&self, record: &StorageProviderRecord) -> EngineResult<ProviderQuota> {
        let provider = self.instance(record)?;
        let quota = provider.get_quota().await;
        provider.cleanup().await;
        let quota = quota?;

        self.db
            .update_provider_quota(&record.id, quota.used, quota.total)?;
        tracing::debug!(target: "providers", provider_id = %record.id, used = quota.used, "Quota refreshed");
        Ok(quota)
    }

    /// Remove a provider. Its files go with it.
    pub fn disconnect(&self, provider_id: &str, workspace_id: &str) -> EngineResult<()> {
        let record = self.get_provider(provider_id, workspace_id)?;
        self.db.delete_provider(&record.id)?;
        tracing::info!(target: "providers", provider_id = %record.id, "Provider disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ConfigCipher;
    use crate::inventory::test_support::temp_db;
    use serde_json::json;

    fn service(db: Arc<InventoryDb>) -> ProviderService {
        let registry = ProviderRegistry::with_defaults(ConfigCipher::new("secret"));
        ProviderService::new(db, Arc::new(registry))
    }

    #[tokio::test]
    async fn test_connect_stores_encrypted_config() {
        let (db, _db_dir) = temp_db();
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("a.txt"), b"12345").unwrap();
        let service = service(db.clone());

        let record = service
            .connect(ConnectProvider {
                workspace_id: "ws".into(),
                name: "Disk".into(),
                provider_type: "local".into(),
                config: json!({"rootPath": root.path()}),
                root_folder_id: None,
            })
            .await
            .unwrap();

        assert_eq!(record.quota_used, 5);
        let stored = db.get_provider(&record.id).unwrap().unwrap();
        assert!(!stored.encrypted_config.contains("rootPath"));
        assert_eq!(service.instance(&stored).unwrap().provider_type(), "local");
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_type_and_unreachable_backend() {
        let (db, _db_dir) = temp_db();
        let service = service(db);

        let err = service
            .connect(ConnectProvider {
                workspace_id: "ws".into(),
                name: "Drive".into(),
                provider_type: "gdrive".into(),
                config: json!({}),
                root_folder_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = service
            .connect(ConnectProvider {
                workspace_id: "ws".into(),
                name: "Missing".into(),
                provider_type: "local".into(),
                config: json!({"rootPath": "/definitely/not/here"}),
                root_folder_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Provider(_)));
    }

    #[test]
    fn test_provider_scoped_to_workspace() {
        let (db, _db_dir) = temp_db();
        db.insert_provider(&crate::inventory::test_support::provider_record("p1", "ws", "local"))
            .unwrap();
        let service = service(db);

        assert!(service.get_provider("p1", "ws").is_ok());
        assert!(matches!(
            service.get_provider("p1", "other").unwrap_err(),
            EngineError::NotFound(_)
        ));
        assert!(service.disconnect("p1", "other").is_err());
        service.disconnect("p1", "ws").unwrap();
        assert!(service.get_provider("p1", "ws").is_err());
    }
}
