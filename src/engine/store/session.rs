//! Store Session
//!
//! Owns the open connection, runs schema migrations when the stored
//! version is behind the configured one, and hands out collection handles.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::collection::Collection;
use super::error::{Result, StoreError};
use super::migration::{MigrationEngine, MigrationReport, MigrationState};
use crate::engine::adapter::{Connection, OpenOutcome, StorageAdapter};
use crate::engine::config::StoreConfig;
use crate::engine::events::{Emitter, ERROR_EVENT};

pub struct StoreSession {
    adapter: Arc<dyn StorageAdapter>,
    config: StoreConfig,
    connection: Option<Arc<dyn Connection>>,
    collections: BTreeMap<String, Collection>,
    version: u32,
    state: MigrationState,
    emitter: Arc<Emitter>,
}

impl StoreSession {
    pub fn new(adapter: Arc<dyn StorageAdapter>, config: StoreConfig) -> Self {
        Self {
            adapter,
            config,
            connection: None,
            collections: BTreeMap::new(),
            version: 0,
            state: MigrationState::Closed,
            emitter: Arc::new(Emitter::new()),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Open the database at the configured version, migrating first when
    /// the stored version is older. Returns the migration report when an
    /// upgrade ran.
    pub async fn open(&mut self) -> Result<Option<MigrationReport>> {
        if self.state == MigrationState::Open {
            debug!(database = %self.config.name, "Store already open");
            return Ok(None);
        }

        if let Err(err) = self.config.validate() {
            warn!(database = %self.config.name, error = %err, "Invalid store config");
            self.emitter.emit(ERROR_EVENT, Value::String(err.to_string()));
            return Err(err.into());
        }

        let outcome = match self.adapter.open(&self.config.name, self.config.version).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(database = %self.config.name, error = %err, "Failed to open store");
                self.emitter.emit(ERROR_EVENT, Value::String(err.message().to_string()));
                return Err(err.into());
            }
        };

        let (connection, report) = match outcome {
            OpenOutcome::Ready(connection) => (connection, None),
            OpenOutcome::UpgradeNeeded(upgrade) => {
                self.state = MigrationState::Upgrading { old_version: upgrade.old_version() };
                let mut engine = MigrationEngine::new(&self.config.schema, self.config.shim_mode);
                match engine.run(upgrade).await {
                    Ok((connection, report)) => (connection, Some(report)),
                    Err(err) => {
                        self.state = engine.state();
                        self.emitter.emit(ERROR_EVENT, Value::String(err.to_string()));
                        return Err(err);
                    }
                }
            }
        };

        self.collections = connection
            .collection_names()
            .await
            .into_iter()
            .map(|name| {
                let handle = Collection::new(&name, Arc::clone(&connection));
                (name, handle)
            })
            .collect();
        self.version = connection.version();
        self.connection = Some(connection);
        self.state = MigrationState::Open;

        info!(
            database = %self.config.name,
            version = self.version,
            collections = self.collections.len(),
            "Store opened"
        );
        Ok(report)
    }

    /// Handle on a collection, `None` when the schema has no such collection
    pub fn collection(&self, name: &str) -> Result<Option<Collection>> {
        if self.state != MigrationState::Open {
            return Err(StoreError::NotOpen);
        }
        Ok(self.collections.get(name).cloned())
    }

    /// Like [`collection`](Self::collection) but a missing collection is an
    /// error
    pub fn require(&self, name: &str) -> Result<Collection> {
        self.collection(name)?
            .ok_or_else(|| StoreError::CollectionNotFound(name.to_string()))
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    /// Version of the open database; 0 before the first open
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn state(&self) -> MigrationState {
        self.state
    }

    pub fn emitter(&self) -> &Arc<Emitter> {
        &self.emitter
    }

    pub fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
            debug!(database = %self.config.name, "Store closed");
        }
        self.collections.clear();
        self.state = MigrationState::Closed;
    }

    /// Close the store and delete the database
    pub async fn delete_database(&mut self) -> Result<()> {
        self.close();
        self.adapter.delete_database(&self.config.name).await?;
        self.version = 0;
        info!(database = %self.config.name, "Store deleted");
        Ok(())
    }
}
