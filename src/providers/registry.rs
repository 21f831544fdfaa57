use super::{StorageProvider, local, webdav};
use crate::crypto::ConfigCipher;
use crate::error::{EngineError, EngineResult, ProviderResult};
use crate::inventory::StorageProviderRecord;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// How a provider authenticates against its backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    #[serde(rename = "oauth")]
    OAuth,
    ApiKey,
    EmailPass,
    NoAuth,
}

/// One field the client must fill in to connect a provider
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigField {
    pub name: &'static str,
    pub label: &'static str,
    pub required: bool,
    pub secret: bool,
}

impl ConfigField {
    const fn required(name: &'static str, label: &'static str) -> Self {
        Self {
            name,
            label,
            required: true,
            secret: false,
        }
    }

    const fn optional(name: &'static str, label: &'static str) -> Self {
        Self {
            name,
            label,
            required: false,
            secret: false,
        }
    }

    const fn secret(mut self) -> Self {
        self.secret = true;
        self
    }
}

/// Builds a configured instance from a decrypted config object
pub type ProviderFactory = Arc<dyn Fn(&Value) -> ProviderResult<Arc<dyn StorageProvider>> + Send + Sync>;

#[derive(Clone)]
pub struct ProviderRegistration {
    pub provider_type: String,
    pub description: String,
    pub supports_presigned_urls: bool,
    pub auth_type: AuthType,
    pub config_fields: Vec<ConfigField>,
    pub factory: ProviderFactory,
}

/// Serializable view of a registration, without the factory
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub provider_type: String,
    pub description: String,
    pub supports_presigned_urls: bool,
    pub auth_type: AuthType,
    pub config_fields: Vec<ConfigField>,
}

impl From<&ProviderRegistration> for ProviderInfo {
    fn from(registration: &ProviderRegistration) -> Self {
        Self {
            provider_type: registration.provider_type.clone(),
            description: registration.description.clone(),
            supports_presigned_urls: registration.supports_presigned_urls,
            auth_type: registration.auth_type,
            config_fields: registration.config_fields.clone(),
        }
    }
}

/// Maps a provider type to a factory for configured instances
pub struct ProviderRegistry {
    registrations: HashMap<String, ProviderRegistration>,
    cipher: ConfigCipher,
}

impl ProviderRegistry {
    pub fn new(cipher: ConfigCipher) -> Self {
        Self {
            registrations: HashMap::new(),
            cipher,
        }
    }

    /// Registry with the built-in backends
    pub fn with_defaults(cipher: ConfigCipher) -> Self {
        let mut registry = Self::new(cipher);

        registry.register(ProviderRegistration {
            provider_type: local::PROVIDER_TYPE.to_string(),
            description: "A directory on the server's filesystem".to_string(),
            supports_presigned_urls: false,
            auth_type: AuthType::NoAuth,
            config_fields: vec![ConfigField::required("rootPath", "Root directory")],
            factory: Arc::new(|config| {
                Ok(Arc::new(local::LocalProvider::from_config(config)?) as Arc<dyn StorageProvider>)
            }),
        });

        registry.register(ProviderRegistration {
            provider_type: webdav::PROVIDER_TYPE.to_string(),
            description: "Any WebDAV server".to_string(),
            supports_presigned_urls: false,
            auth_type: AuthType::EmailPass,
            config_fields: vec![
                ConfigField::required("url", "Server URL"),
                ConfigField::optional("username", "Username"),
                ConfigField::optional("password", "Password").secret(),
            ],
            factory: Arc::new(|config| {
                Ok(Arc::new(webdav::WebDavProvider::from_config(config)?) as Arc<dyn StorageProvider>)
            }),
        });

        registry
    }

    /// Add or replace a registration
    pub fn register(&mut self, registration: ProviderRegistration) {
        tracing::debug!(target: "providers", provider_type = %registration.provider_type, "Provider type registered");
        self.registrations
            .insert(registration.provider_type.clone(), registration);
    }

    pub fn is_registered(&self, provider_type: &str) -> bool {
        self.registrations.contains_key(provider_type)
    }

    /// Every registered type, sorted by name
    pub fn list(&self) -> Vec<ProviderInfo> {
        let mut infos: Vec<ProviderInfo> = self.registrations.values().map(ProviderInfo::from).collect();
        infos.sort_by(|a, b| a.provider_type.cmp(&b.provider_type));
        infos
    }

    /// Build an instance from a plaintext config
    pub fn create(&self, provider_type: &str, config: &Value) -> EngineResult<Arc<dyn StorageProvider>> {
        let registration = self
            .registrations
            .get(provider_type)
            .ok_or_else(|| EngineError::validation(format!("Unknown provider type: {}", provider_type)))?;
        Ok((registration.factory)(config)?)
    }

    /// Build an instance for a stored provider, decrypting its config
    pub fn instantiate(&self, record: &StorageProviderRecord) -> EngineResult<Arc<dyn StorageProvider>> {
        let config = self.cipher.decrypt_json(&record.encrypted_config)?;
        self.create(&record.provider_type, &config)
    }

    pub fn encrypt_config(&self, config: &Value) -> EngineResult<String> {
        Ok(self.cipher.encrypt_json(config)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::test_support::provider_record;
    use serde_json::json;

    #[test]
    fn test_defaults_are_listed() {
        let registry = ProviderRegistry::with_defaults(ConfigCipher::new("secret"));
        let types: Vec<String> = registry.list().into_iter().map(|i| i.provider_type).collect();
        assert_eq!(types, vec!["local".to_string(), "webdav".to_string()]);

        let info = serde_json::to_value(registry.list()).unwrap();
        assert_eq!(info[0]["authType"], "no_auth");
        assert_eq!(info[1]["authType"], "email_pass");
    }

    #[test]
    fn test_unknown_type_is_validation_error() {
        let registry = ProviderRegistry::with_defaults(ConfigCipher::new("secret"));
        let err = registry.create("gdrive", &json!({})).err().unwrap();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_instantiate_decrypts_config() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProviderRegistry::with_defaults(ConfigCipher::new("secret"));

        let mut record = provider_record("p1", "ws", "local");
        record.encrypted_config = registry
            .encrypt_config(&json!({"rootPath": dir.path()}))
            .unwrap();

        let provider = registry.instantiate(&record).unwrap();
        assert_eq!(provider.provider_type(), "local");
    }

    #[test]
    fn test_factory_error_is_provider_error() {
        let registry = ProviderRegistry::with_defaults(ConfigCipher::new("secret"));
        let err = registry.create("local", &json!({})).err().unwrap();
        assert!(matches!(err, EngineError::Provider(_)));
    }
}
