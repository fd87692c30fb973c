use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub node: NodeConfig,
    pub storage: StorageConfig,
    pub uploads: UploadConfig,
    pub transfer: TransferConfig,
    /// Capacity of the in-process event channel
    pub event_buffer: usize,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: String,
    /// Directory of the redb metadata database
    pub data_dir: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root of the upload sessions and the local blob store
    pub root: String,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Leave finalization to postprocessing events instead of finishing synchronously
    pub async_uploads: bool,
    pub disable_versioning: bool,
    /// Maximum upload size in bytes, 0 for unlimited
    pub max_upload_size: u64,
    pub upload_expiration_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub data_gateway_endpoint: String,
    pub download_endpoint: String,
    pub shared_secret: String,
    pub expires_seconds: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: "./storage".to_string(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            async_uploads: false,
            disable_versioning: false,
            max_upload_size: 0,
            upload_expiration_seconds: 24 * 60 * 60,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            data_gateway_endpoint: "http://localhost:9199/data".to_string(),
            download_endpoint: "http://localhost:9158/data".to_string(),
            shared_secret: String::new(),
            expires_seconds: 24 * 60 * 60,
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| v == "true" || v == "1")
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let node_id = std::env::var("NODE_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
        let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string());

        let storage = StorageConfig {
            root: std::env::var("STORAGE_ROOT").unwrap_or_else(|_| StorageConfig::default().root),
        };

        let upload_defaults = UploadConfig::default();
        let uploads = UploadConfig {
            async_uploads: env_bool("ASYNC_UPLOADS").unwrap_or(upload_defaults.async_uploads),
            disable_versioning: env_bool("DISABLE_VERSIONING")
                .unwrap_or(upload_defaults.disable_versioning),
            max_upload_size: env_parse("MAX_UPLOAD_SIZE").unwrap_or(upload_defaults.max_upload_size),
            upload_expiration_seconds: env_parse("UPLOAD_EXPIRATION")
                .unwrap_or(upload_defaults.upload_expiration_seconds),
        };

        let transfer_defaults = TransferConfig::default();
        let transfer = TransferConfig {
            data_gateway_endpoint: std::env::var("DATA_GATEWAY_ENDPOINT")
                .unwrap_or(transfer_defaults.data_gateway_endpoint),
            download_endpoint: std::env::var("DOWNLOAD_ENDPOINT")
                .unwrap_or(transfer_defaults.download_endpoint),
            shared_secret: std::env::var("TRANSFER_SHARED_SECRET").unwrap_or_default(),
            expires_seconds: env_parse("TRANSFER_EXPIRES").unwrap_or(transfer_defaults.expires_seconds),
        };

        let config = Config {
            node: NodeConfig {
                id: node_id,
                data_dir,
            },
            storage,
            uploads,
            transfer,
            event_buffer: env_parse("EVENT_BUFFER").unwrap_or(128),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.id.is_empty() {
            return Err(ConfigError::ValidationError(
                "NODE_ID cannot be empty".to_string(),
            ));
        }

        if self.storage.root.is_empty() {
            return Err(ConfigError::ValidationError(
                "STORAGE_ROOT cannot be empty".to_string(),
            ));
        }

        if self.uploads.async_uploads && self.transfer.shared_secret.is_empty() {
            return Err(ConfigError::ValidationError(
                "TRANSFER_SHARED_SECRET is required when ASYNC_UPLOADS is enabled".to_string(),
            ));
        }

        if self.event_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "EVENT_BUFFER must be greater than zero".to_string(),
            ));
        }

        if self.uploads.upload_expiration_seconds == 0 {
            tracing::warn!("UPLOAD_EXPIRATION is 0, every upload session expires immediately");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            node: NodeConfig {
                id: "node-1".to_string(),
                data_dir: "./data".to_string(),
            },
            storage: StorageConfig::default(),
            uploads: UploadConfig::default(),
            transfer: TransferConfig::default(),
            event_buffer: 16,
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn test_async_requires_secret() {
        let mut c = config();
        c.uploads.async_uploads = true;
        assert!(matches!(c.validate(), Err(ConfigError::ValidationError(_))));

        c.transfer.shared_secret = "secret".to_string();
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_empty_node_id() {
        let mut c = config();
        c.node.id = String::new();
        assert!(c.validate().is_err());
    }
}
