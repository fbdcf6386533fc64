use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::{
    fs::{read_to_string, write},
    path::PathBuf,
};

pub const DEFAULT_ID_FIELD: &str = "id";
pub const DEFAULT_GC_RELEASE_BUFFER_SIZE: usize = 10;

/// Tunables shared by the normalizer, the store and the publish queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Response field holding a server-assigned global id.
    pub id_field: String,
    /// How many released operations stay retained before garbage collection may drop them.
    pub gc_release_buffer_size: usize,
    pub gc_enabled: bool,
    /// Log a developer error when one normalization pass writes two different values to the same
    /// storage key.
    pub warn_on_conflicting_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            id_field: DEFAULT_ID_FIELD.to_string(),
            gc_release_buffer_size: DEFAULT_GC_RELEASE_BUFFER_SIZE,
            gc_enabled: true,
            warn_on_conflicting_writes: true,
        }
    }
}

pub trait ConfigProvider: Send + Sync {
    fn get_config(&self) -> Result<StoreConfig, StoreError>;
    fn set_config(&self, config: &StoreConfig) -> Result<(), StoreError>;
}

/// Reads and writes the `[store]` table of a TOML file.
#[derive(Debug, Serialize, Deserialize)]
pub struct TomlConfigProvider {
    path: PathBuf,
}

impl TomlConfigProvider {
    pub fn new(path: PathBuf) -> Self {
        TomlConfigProvider { path }
    }
}

impl ConfigProvider for TomlConfigProvider {
    fn get_config(&self) -> Result<StoreConfig, StoreError> {
        tracing::debug!("Attempting to read store config from: {:?}", &self.path);
        if !self.path.exists() {
            tracing::debug!("Config file not found, using default store config.");
            return Ok(StoreConfig::default());
        }
        let content = read_to_string(&self.path)?;
        let mut config: BTreeMap<String, StoreConfig> = toml::from_str(&content)?;
        config
            .remove("store")
            .ok_or_else(|| StoreError::Config("[store] table not found in config".to_string()))
    }

    fn set_config(&self, store_config: &StoreConfig) -> Result<(), StoreError> {
        tracing::debug!("Attempting to write store config to: {:?}", &self.path);
        let mut config = BTreeMap::new();
        config.insert("store".to_string(), store_config.clone());
        let toml_string = toml::to_string(&config)?;
        write(&self.path, toml_string)?;
        Ok(())
    }
}
