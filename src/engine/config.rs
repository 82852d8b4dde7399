//! AirKV Configuration Module
//! Handles loading and validating airkv.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::engine::store::migration::SchemaDelta;

pub const CONFIG_FILE: &str = "airkv.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// How a store is opened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// Database name
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    /// Ordered schema deltas
    #[serde(default)]
    pub schema: Vec<SchemaDelta>,
    /// Skip compound-key indexes the engine cannot hold
    #[serde(default)]
    pub shim_mode: bool,
}

fn default_version() -> u32 {
    1
}

impl StoreConfig {
    pub fn new(name: &str, version: u32) -> Self {
        Self {
            name: name.to_string(),
            version,
            schema: Vec::new(),
            shim_mode: false,
        }
    }

    pub fn with_schema(mut self, schema: Vec<SchemaDelta>) -> Self {
        self.schema = schema;
        self
    }

    pub fn shim_mode(mut self, enabled: bool) -> Self {
        self.shim_mode = enabled;
        self
    }

    pub fn load(project_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = project_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path));
        }
        let content = std::fs::read_to_string(&config_path)?;
        let config: StoreConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, project_dir: &Path) -> Result<(), ConfigError> {
        let config_path = project_dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// Check the name, the version and that delta versions ascend up to
    /// the store version
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("name cannot be empty".to_string()));
        }
        if self.version == 0 {
            return Err(ConfigError::Invalid("version must be at least 1".to_string()));
        }
        for pair in self.schema.windows(2) {
            if pair[1].version <= pair[0].version {
                return Err(ConfigError::Invalid(format!(
                    "schema version {} follows {}",
                    pair[1].version, pair[0].version
                )));
            }
        }
        if let Some(last) = self.schema.last() {
            if last.version > self.version {
                return Err(ConfigError::Invalid(format!(
                    "schema version {} is above store version {}",
                    last.version, self.version
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::adapter::{IndexSpec, KeyPathConfig};
    use crate::engine::store::migration::CollectionSchema;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::new("app", 2).with_schema(vec![
            SchemaDelta::new(1).collection(
                "users",
                CollectionSchema::new(KeyPathConfig::auto_increment("id"))
                    .index("username", IndexSpec::new("username", true)),
            ),
            SchemaDelta::new(2),
        ]);

        config.save(dir.path()).unwrap();
        let loaded = StoreConfig::load(dir.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_camel_case_with_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"name": "app", "shimMode": true}"#,
        )
        .unwrap();

        let config = StoreConfig::load(dir.path()).unwrap();
        assert_eq!(config.version, 1);
        assert!(config.shim_mode);
        assert!(config.schema.is_empty());
    }

    #[test]
    fn test_missing_and_invalid() {
        let dir = tempdir().unwrap();
        assert!(matches!(StoreConfig::load(dir.path()), Err(ConfigError::NotFound(_))));

        let config = StoreConfig::new("app", 1).with_schema(vec![SchemaDelta::new(2), SchemaDelta::new(1)]);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = StoreConfig::new("app", 1).with_schema(vec![SchemaDelta::new(2)]);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
