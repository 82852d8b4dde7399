//! Store Error Types

use thiserror::Error;

use super::bulk::BulkItem;
use crate::engine::adapter::AdapterError;
use crate::engine::config::ConfigError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("No schema defined, can not upgrade from version {old_version}")]
    MissingSchema { old_version: u32 },

    #[error("Store is not open")]
    NotOpen,

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Index not found: {collection}.{index}")]
    IndexNotFound { collection: String, index: String },

    #[error("Invalid bulk item: {0}")]
    InvalidBulkItem(String),

    #[error("Bulk item {position} failed: {source}")]
    BulkItem {
        position: usize,
        item: Box<BulkItem>,
        #[source]
        source: Box<StoreError>,
    },
}

impl StoreError {
    /// Native engine error behind this failure, if any
    pub fn adapter_error(&self) -> Option<&AdapterError> {
        match self {
            StoreError::Adapter(err) => Some(err),
            StoreError::BulkItem { source, .. } => source.adapter_error(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
